//! Connectivity state.
//!
//! A process-wide online/offline flag, modeled as an injectable service
//! rather than ambient global state: every read goes through the service a
//! replica owns, and transitions notify subscribers synchronously so queued
//! operations can flush on the online transition.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Online/offline state with subscribe/notify semantics.
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
    subscribers: Mutex<Vec<Sender<bool>>>,
}

impl Connectivity {
    /// Creates a connectivity service that starts online.
    #[must_use]
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns true if the process is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flips the flag, notifying subscribers when the state actually
    /// changes. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }
        tracing::debug!(online, "connectivity transition");
        self.subscribers
            .lock()
            .retain(|sender| sender.send(online).is_ok());
        true
    }

    /// Subscribes to transitions. Each transition delivers the new state.
    pub fn subscribe(&self) -> Receiver<bool> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Restores the initial state (online, no subscribers) for tests.
    pub fn reset_for_testing(&self) {
        self.online.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_online() {
        let connectivity = Connectivity::new();
        assert!(connectivity.is_online());
    }

    #[test]
    fn transition_notifies_subscribers() {
        let connectivity = Connectivity::new();
        let receiver = connectivity.subscribe();

        assert!(connectivity.set_online(false));
        assert_eq!(receiver.try_recv(), Ok(false));

        assert!(connectivity.set_online(true));
        assert_eq!(receiver.try_recv(), Ok(true));
    }

    #[test]
    fn no_notification_without_transition() {
        let connectivity = Connectivity::new();
        let receiver = connectivity.subscribe();

        assert!(!connectivity.set_online(true));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn reset_restores_initial_state() {
        let connectivity = Connectivity::new();
        let receiver = connectivity.subscribe();
        connectivity.set_online(false);

        connectivity.reset_for_testing();
        assert!(connectivity.is_online());

        // Former subscribers are dropped.
        connectivity.set_online(false);
        assert!(receiver.try_recv().is_err());
    }
}
