use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use tokio::sync::oneshot;

/// Tracks handlers waiting for an inference to finish, keyed by the
/// `"<tag>|<dst>"` event tag. One subscriber drains the pub/sub channel
/// and fires every signal registered for the finished key; the critical
/// sections are a map insert and a map drain, so a single mutex carries
/// all of it.
#[derive(Default)]
pub struct WaitRegistry {
    events: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an event tag. Returns whether this waiter is
    /// the first, in which case the caller must schedule the processing.
    pub fn register(&self, key: &str) -> (bool, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        let mut events = self.events.lock().expect("wait registry mutex");
        match events.get_mut(key) {
            Some(waiters) => {
                waiters.push(sender);
                (false, receiver)
            }
            None => {
                events.insert(key.to_string(), vec![sender]);
                (true, receiver)
            }
        }
    }

    /// Signal everyone registered for the event tag and drop the key.
    /// Returns how many waiters were signaled.
    pub fn fire(&self, key: &str) -> usize {
        let waiters = {
            let mut events = self.events.lock().expect("wait registry mutex");
            events.remove(key)
        };
        match waiters {
            Some(waiters) => {
                let count = waiters.len();
                debug!("Firing events for {} listeners of {}", count, key);
                for waiter in waiters {
                    // A waiter that already timed out is fine to miss.
                    let _ = waiter.send(());
                }
                count
            }
            None => {
                debug!("Asked to fire events for {}, which has no listeners", key);
                0
            }
        }
    }

    /// `(pending keys, registered waiters)` for status logging.
    pub fn status(&self) -> (usize, usize) {
        let events = self.events.lock().expect("wait registry mutex");
        (events.len(), events.values().map(|w| w.len()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_registration_wins_dispatch() {
        let registry = WaitRegistry::new();
        let (first, _rx1) = registry.register("T|9");
        let (second, _rx2) = registry.register("T|9");
        assert!(first);
        assert!(!second);
        assert_eq!(registry.status(), (1, 2));
    }

    #[tokio::test]
    async fn test_fire_wakes_all_waiters() {
        let registry = WaitRegistry::new();
        let (_, rx1) = registry.register("T|9");
        let (_, rx2) = registry.register("T|9");
        assert_eq!(registry.fire("T|9"), 2);
        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
        // The key is gone; a new registration is first again.
        let (first, _rx) = registry.register("T|9");
        assert!(first);
    }

    #[tokio::test]
    async fn test_fire_unknown_key_is_noop() {
        let registry = WaitRegistry::new();
        assert_eq!(registry.fire("T|9"), 0);
    }
}
