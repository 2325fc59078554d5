//! Slab-allocated object pool.
//!
//! Objects live in fixed-capacity slabs (256 slots each) and are addressed
//! by a stable [`PoolKey`]. Any slab other than the first is released as
//! soon as it empties; the vacated position stays behind as a hole so later
//! slabs keep their indices and outstanding keys stay valid. Generations
//! are drawn from one pool-wide counter, so a stale key can never alias a
//! later occupant, even after its whole slab was released and the position
//! reused. The first slab persists to anchor the pool.

/// Slots per slab.
const SLAB_CAPACITY: usize = 256;

/// Stable handle to a pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    slab: u32,
    slot: u32,
    generation: u64,
}

enum Slot<T> {
    Free { next: Option<u32> },
    Live { value: T, generation: u64 },
}

struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Slab<T> {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(SLAB_CAPACITY);
        for i in 0..SLAB_CAPACITY {
            let next = if i + 1 < SLAB_CAPACITY {
                Some(i as u32 + 1)
            } else {
                None
            };
            slots.push(Slot::Free { next });
        }
        Self {
            slots,
            free_head: Some(0),
            live: 0,
        }
    }

    /// Pops a free slot and stores `value` in place; hands the value back
    /// when the slab is full.
    fn insert(&mut self, value: T, generation: u64) -> std::result::Result<u32, T> {
        let slot_idx = match self.free_head {
            Some(idx) => idx,
            None => return Err(value),
        };
        let next = match &self.slots[slot_idx as usize] {
            Slot::Free { next } => *next,
            Slot::Live { .. } => unreachable!("free list points at a live slot"),
        };
        self.free_head = next;
        self.slots[slot_idx as usize] = Slot::Live { value, generation };
        self.live += 1;
        Ok(slot_idx)
    }

    fn remove(&mut self, slot_idx: u32, generation: u64) -> Option<T> {
        let slot = self.slots.get_mut(slot_idx as usize)?;
        match slot {
            Slot::Live {
                generation: live_gen,
                ..
            } if *live_gen == generation => {
                let freed = Slot::Free {
                    next: self.free_head,
                };
                let old = std::mem::replace(slot, freed);
                self.free_head = Some(slot_idx);
                self.live -= 1;
                match old {
                    Slot::Live { value, .. } => Some(value),
                    Slot::Free { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    fn get(&self, slot_idx: u32, generation: u64) -> Option<&T> {
        match self.slots.get(slot_idx as usize)? {
            Slot::Live {
                value,
                generation: live_gen,
            } if *live_gen == generation => Some(value),
            _ => None,
        }
    }
}

/// Unbounded pool built from fixed-capacity slabs.
pub struct ObjectPool<T> {
    slabs: Vec<Option<Slab<T>>>,
    next_generation: u64,
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectPool<T> {
    /// Creates a pool with one anchor slab.
    pub fn new() -> Self {
        Self {
            slabs: vec![Some(Slab::new())],
            next_generation: 0,
        }
    }

    /// Stores a value, allocating a new slab only when every existing slab
    /// is full. A hole left by a released slab is reused before the slab
    /// list grows. Returns the value's stable key.
    pub fn create(&mut self, value: T) -> PoolKey {
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut value = value;
        for (slab_idx, entry) in self.slabs.iter_mut().enumerate().rev() {
            if let Some(slab) = entry {
                match slab.insert(value, generation) {
                    Ok(slot) => {
                        return PoolKey {
                            slab: slab_idx as u32,
                            slot,
                            generation,
                        }
                    }
                    Err(v) => value = v,
                }
            }
        }

        let mut slab = Slab::new();
        let slot = match slab.insert(value, generation) {
            Ok(placed) => placed,
            Err(_) => unreachable!("a fresh slab always has free slots"),
        };
        let slab_idx = match self.slabs.iter().position(Option::is_none) {
            Some(hole) => {
                self.slabs[hole] = Some(slab);
                hole
            }
            None => {
                self.slabs.push(Some(slab));
                self.slabs.len() - 1
            }
        };
        PoolKey {
            slab: slab_idx as u32,
            slot,
            generation,
        }
    }

    /// Removes and returns the value behind `key`, if still live. An empty
    /// slab other than the first is released in place — later slabs keep
    /// their indices — and trailing holes are trimmed off the slab list.
    pub fn destroy(&mut self, key: PoolKey) -> Option<T> {
        let entry = self.slabs.get_mut(key.slab as usize)?;
        let slab = entry.as_mut()?;
        let value = slab.remove(key.slot, key.generation)?;

        if key.slab != 0 && slab.live == 0 {
            *entry = None;
        }
        while self.slabs.len() > 1 && matches!(self.slabs.last(), Some(None)) {
            self.slabs.pop();
        }
        Some(value)
    }

    /// Looks up a live value.
    pub fn get(&self, key: PoolKey) -> Option<&T> {
        self.slabs
            .get(key.slab as usize)?
            .as_ref()?
            .get(key.slot, key.generation)
    }

    /// Membership test: true only while the key addresses a live slot.
    pub fn allocated(&self, key: PoolKey) -> bool {
        self.get(key).is_some()
    }

    /// Visits every live value.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        for slab in self.slabs.iter().flatten() {
            for slot in &slab.slots {
                if let Slot::Live { value, .. } = slot {
                    f(value);
                }
            }
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slabs.iter().flatten().map(|s| s.live).sum()
    }

    /// True when no values are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every value; the anchor slab remains. The generation counter
    /// keeps running so keys from before the clear stay dead.
    pub fn clear(&mut self) {
        self.slabs.clear();
        self.slabs.push(Some(Slab::new()));
    }
}
