//! Executor notifications
//!
//! Observers are called from the scheduling thread (and from whichever thread
//! calls start/stop/pause/resume), always after the executor lock has been
//! released. A panicking observer is logged and otherwise ignored.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use tracing::warn;

use super::state::RunState;

/// Listener interface for executor notifications
///
/// All methods default to doing nothing.
pub trait ExecutorObserver: Send + Sync {
    /// A new setpoint was commanded
    fn on_setpoint(&self, _setpoint: f64) {}

    /// The active segment changed (`index` is 0-based)
    fn on_step(&self, _index: usize, _total: usize) {}

    /// The trajectory finished and outputs were zeroed
    fn on_complete(&self) {}

    /// A power-source command failed
    fn on_error(&self, _message: &str) {}

    fn on_state_change(&self, _state: RunState) {}
}

/// Executor notification as a value
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Setpoint(f64),
    Step { index: usize, total: usize },
    Complete,
    Error(String),
    StateChanged(RunState),
}

/// Observer that forwards every notification into a channel
#[derive(Debug)]
pub struct EventChannel {
    tx: Sender<ExecutorEvent>,
}

impl EventChannel {
    /// Create the observer and the receiving end
    pub fn new() -> (Arc<Self>, Receiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: ExecutorEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl ExecutorObserver for EventChannel {
    fn on_setpoint(&self, setpoint: f64) {
        self.send(ExecutorEvent::Setpoint(setpoint));
    }

    fn on_step(&self, index: usize, total: usize) {
        self.send(ExecutorEvent::Step { index, total });
    }

    fn on_complete(&self) {
        self.send(ExecutorEvent::Complete);
    }

    fn on_error(&self, message: &str) {
        self.send(ExecutorEvent::Error(message.to_owned()));
    }

    fn on_state_change(&self, state: RunState) {
        self.send(ExecutorEvent::StateChanged(state));
    }
}

/// Call `f` on every observer, isolating panics
pub(crate) fn dispatch<F>(observers: &[Arc<dyn ExecutorObserver>], f: F)
where
    F: Fn(&dyn ExecutorObserver),
{
    for observer in observers {
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref())));
        if result.is_err() {
            warn!("Executor observer panicked; notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: AtomicUsize,
    }

    impl ExecutorObserver for Counter {
        fn on_complete(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl ExecutorObserver for Panicker {
        fn on_complete(&self) {
            panic!("observer bug");
        }
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        let observers: Vec<Arc<dyn ExecutorObserver>> =
            vec![Arc::new(Panicker), counter.clone(), Arc::new(Panicker)];

        dispatch(&observers, |o| o.on_complete());
        dispatch(&observers, |o| o.on_complete());

        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_channel_forwards() {
        let (channel, rx) = EventChannel::new();
        let observers: Vec<Arc<dyn ExecutorObserver>> = vec![channel];

        dispatch(&observers, |o| o.on_setpoint(2.5));
        dispatch(&observers, |o| o.on_step(1, 3));
        dispatch(&observers, |o| o.on_error("link down"));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ExecutorEvent::Setpoint(2.5),
                ExecutorEvent::Step { index: 1, total: 3 },
                ExecutorEvent::Error("link down".into()),
            ]
        );
    }

    #[test]
    fn test_event_channel_survives_dropped_receiver() {
        let (channel, rx) = EventChannel::new();
        drop(rx);
        channel.on_complete();
    }
}
