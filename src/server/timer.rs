//! Pausable periodic timer.
//!
//! The timer handle controls a task on the server executor. `pause` keeps
//! the task alive but suppresses firings, `resume` restarts the period from
//! now, and `stop` ends the task for good.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

pub(crate) struct TimerState {
    paused: Cell<bool>,
    stopped: Cell<bool>,
    period: Cell<Duration>,
    wake: Notify,
}

/// Handle to a periodic timer created by `create_timer`.
#[derive(Clone)]
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    pub(crate) fn new(period: Duration) -> (Timer, Rc<TimerState>) {
        let state = Rc::new(TimerState {
            paused: Cell::new(false),
            stopped: Cell::new(false),
            period: Cell::new(period),
            wake: Notify::new(),
        });
        (
            Timer {
                state: state.clone(),
            },
            state,
        )
    }

    /// Suppresses firings until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.state.paused.set(true);
    }

    /// Restarts the timer; the next firing is one full period from now.
    pub fn resume(&self) {
        if self.state.stopped.get() {
            return;
        }
        self.state.paused.set(false);
        self.state.wake.notify_one();
    }

    /// Ends the timer permanently.
    pub fn stop(&self) {
        self.state.stopped.set(true);
        self.state.wake.notify_one();
    }

    /// True while firings are suppressed.
    pub fn paused(&self) -> bool {
        self.state.paused.get()
    }
}

/// Timer task body; `tick` runs once per elapsed period while not paused.
pub(crate) async fn run_timer(state: Rc<TimerState>, mut tick: impl FnMut()) {
    loop {
        if state.stopped.get() {
            break;
        }
        if state.paused.get() {
            state.wake.notified().await;
            continue;
        }

        tokio::time::sleep(state.period.get()).await;

        if state.stopped.get() {
            break;
        }
        if state.paused.get() {
            continue;
        }
        tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_until_stopped() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (timer, state) = Timer::new(Duration::from_millis(10));
                let count = Rc::new(Cell::new(0u32));

                let counter = count.clone();
                let handle = timer.clone();
                tokio::task::spawn_local(run_timer(state, move || {
                    counter.set(counter.get() + 1);
                    if counter.get() == 3 {
                        handle.stop();
                    }
                }));

                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(count.get(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suppresses_firings() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (timer, state) = Timer::new(Duration::from_millis(10));
                let count = Rc::new(Cell::new(0u32));

                let counter = count.clone();
                let handle = timer.clone();
                tokio::task::spawn_local(run_timer(state, move || {
                    counter.set(counter.get() + 1);
                    handle.pause();
                }));

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(count.get(), 1);
                assert!(timer.paused());

                timer.resume();
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(count.get(), 2);

                timer.stop();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_stop_is_noop() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (timer, state) = Timer::new(Duration::from_millis(10));
                let count = Rc::new(Cell::new(0u32));

                let counter = count.clone();
                tokio::task::spawn_local(run_timer(state, move || {
                    counter.set(counter.get() + 1);
                }));

                timer.stop();
                timer.resume();
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(count.get(), 0);
            })
            .await;
    }
}
