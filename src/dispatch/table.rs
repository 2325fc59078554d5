//! Asynchronous one-shot subscription table.
//!
//! For each message type the table keeps a FIFO of one-shot callbacks.
//! Dispatching a frame pops and invokes the head callback; cancelling
//! drains every FIFO, invoking each callback with the cancellation error.
//! Every subscriber is invoked exactly once, with a message or with the
//! cancellation, never both.

use std::collections::HashMap;
use std::collections::VecDeque;

use super::module::decode_or_malformed;
use crate::error::{FramewireError, Result};
use crate::protocol::{Packet, Protocol};

enum Delivery<'a> {
    Message(&'a [u8]),
    Cancelled,
}

type Subscriber = Box<dyn FnOnce(Delivery<'_>)>;

/// Per-type FIFO of one-shot async subscribers with cancellation.
#[derive(Default)]
pub struct DispatchTable {
    queues: HashMap<u16, VecDeque<Subscriber>>,
    pending: usize,
}

impl DispatchTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a one-shot subscriber for `T`. The callback receives either
    /// a decoded message or `OperationCancelled`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not part of `proto`; subscriptions are resolved at
    /// registration time, like every other type-to-id lookup.
    pub fn subscribe<T, F>(&mut self, proto: &Protocol, callback: F)
    where
        T: Packet,
        F: FnOnce(Result<T>) + 'static,
    {
        let id = match proto.id_of::<T>() {
            Some(id) => id,
            None => panic!("subscribe: {} is not part of the protocol", T::NAME),
        };
        let subscriber: Subscriber = Box::new(move |delivery| match delivery {
            Delivery::Message(payload) => callback(decode_or_malformed::<T>(payload)),
            Delivery::Cancelled => callback(Err(FramewireError::OperationCancelled)),
        });
        self.queues.entry(id).or_default().push_back(subscriber);
        self.pending += 1;
    }

    /// Pops the head subscriber for `type_id`, if any. The caller invokes
    /// the returned closure outside any borrow of the table, so a callback
    /// may subscribe again.
    #[must_use]
    pub(crate) fn pop(&mut self, type_id: u16) -> Option<Subscriber> {
        let queue = self.queues.get_mut(&type_id)?;
        let subscriber = queue.pop_front()?;
        self.pending -= 1;
        Some(subscriber)
    }

    /// Takes every queued subscriber for a cancellation drain. Subscribers
    /// added while the drain runs land in fresh queues and are *not* part
    /// of this pass.
    #[must_use]
    pub(crate) fn take_all(&mut self) -> Vec<Subscriber> {
        let mut drained = Vec::new();
        for (_, queue) in self.queues.iter_mut() {
            drained.extend(queue.drain(..));
        }
        self.pending -= drained.len();
        drained
    }

    /// True when no subscribers are pending.
    pub fn done(&self) -> bool {
        self.pending == 0
    }

    /// Number of pending subscribers.
    pub fn pending(&self) -> usize {
        self.pending
    }
}

/// Dispatches one frame into `table`; returns true when a subscriber
/// consumed it. Invocation happens after the borrow on `table` ends, so
/// callbacks may freely re-subscribe.
pub(crate) fn dispatch_into(
    table: &std::cell::RefCell<DispatchTable>,
    type_id: u16,
    payload: &[u8],
) -> bool {
    let subscriber = table.borrow_mut().pop(type_id);
    match subscriber {
        Some(cb) => {
            cb(Delivery::Message(payload));
            true
        }
        None => false,
    }
}

/// Cancels every pending subscriber in `table`. Re-subscriptions performed
/// inside a cancellation callback survive the pass.
pub(crate) fn cancel_all(table: &std::cell::RefCell<DispatchTable>) {
    let drained = table.borrow_mut().take_all();
    for cb in drained {
        cb(Delivery::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol;
    use serde::{Deserialize, Serialize};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        seq: u32,
    }
    impl Packet for Ping {
        const NAME: &'static str = "Ping";
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pong {
        seq: u32,
    }
    impl Packet for Pong {
        const NAME: &'static str = "Pong";
    }

    fn proto() -> Protocol {
        protocol![Ping, Pong]
    }

    #[test]
    fn test_subscriber_receives_message() {
        let proto = proto();
        let table = RefCell::new(DispatchTable::new());
        let got = Rc::new(RefCell::new(None));

        let sink = got.clone();
        table
            .borrow_mut()
            .subscribe::<Ping, _>(&proto, move |msg| {
                *sink.borrow_mut() = Some(msg.unwrap());
            });

        let payload = MsgPackCodec::encode(&Ping { seq: 7 }).unwrap();
        assert!(dispatch_into(&table, 0, &payload));
        assert_eq!(*got.borrow(), Some(Ping { seq: 7 }));
        assert!(table.borrow().done());
    }

    #[test]
    fn test_unsubscribed_type_is_not_consumed() {
        let proto = proto();
        let table = RefCell::new(DispatchTable::new());
        table.borrow_mut().subscribe::<Ping, _>(&proto, |_| {});

        let payload = MsgPackCodec::encode(&Pong { seq: 1 }).unwrap();
        assert!(!dispatch_into(&table, 1, &payload));
        assert_eq!(table.borrow().pending(), 1);
    }

    #[test]
    fn test_fifo_order_per_type() {
        let proto = proto();
        let table = RefCell::new(DispatchTable::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in [1, 2, 3] {
            let order = order.clone();
            table
                .borrow_mut()
                .subscribe::<Ping, _>(&proto, move |msg| {
                    order.borrow_mut().push((tag, msg.unwrap().seq));
                });
        }

        for seq in [10, 20, 30] {
            let payload = MsgPackCodec::encode(&Ping { seq }).unwrap();
            assert!(dispatch_into(&table, 0, &payload));
        }

        assert_eq!(*order.borrow(), vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn test_cancel_invokes_each_subscriber_once() {
        let proto = proto();
        let table = RefCell::new(DispatchTable::new());
        let cancelled = Rc::new(RefCell::new(0));

        for _ in 0..3 {
            let cancelled = cancelled.clone();
            table
                .borrow_mut()
                .subscribe::<Ping, _>(&proto, move |msg| {
                    assert!(msg.unwrap_err().is_cancelled());
                    *cancelled.borrow_mut() += 1;
                });
        }

        cancel_all(&table);
        assert_eq!(*cancelled.borrow(), 3);
        assert!(table.borrow().done());
    }

    #[test]
    fn test_resubscription_during_cancel_survives_the_pass() {
        let proto = Rc::new(proto());
        let table = Rc::new(RefCell::new(DispatchTable::new()));
        let calls = Rc::new(RefCell::new(0));

        {
            let table = table.clone();
            let proto = proto.clone();
            let calls = calls.clone();
            table
                .clone()
                .borrow_mut()
                .subscribe::<Ping, _>(&proto.clone(), move |_| {
                    *calls.borrow_mut() += 1;
                    let calls = calls.clone();
                    table.borrow_mut().subscribe::<Ping, _>(&proto, move |_| {
                        *calls.borrow_mut() += 1;
                    });
                });
        }

        cancel_all(&table);

        // Only the original subscriber ran; the re-subscription is queued.
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(table.borrow().pending(), 1);
    }

    #[test]
    fn test_decode_failure_surfaces_malformed_error() {
        let proto = proto();
        let table = RefCell::new(DispatchTable::new());
        let got = Rc::new(RefCell::new(None));

        let sink = got.clone();
        table
            .borrow_mut()
            .subscribe::<Ping, _>(&proto, move |msg| {
                *sink.borrow_mut() = Some(msg.unwrap_err());
            });

        assert!(dispatch_into(&table, 0, b"\xc1garbage"));
        assert!(matches!(
            got.borrow().as_ref(),
            Some(FramewireError::FrameMalformed { .. })
        ));
    }
}
