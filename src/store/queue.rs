use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use super::queue_name;
use crate::Asn;

/// Persisted contents of one processing queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub entries: VecDeque<Asn>,
    /// Deduplicates pending entries (`unique_entry` set).
    pub unique: BTreeSet<Asn>,
    /// Destinations already handed to a worker (`seen` set).
    pub seen: BTreeSet<Asn>,
}

/// Work queue of destinations awaiting inference for one RIB tag. Adds
/// consult the dedup set first, so an in-flight destination is enqueued
/// at most once; a listener counter records whether any worker is
/// subscribed.
pub struct ProcQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: tokio::sync::Notify,
    listeners: AtomicUsize,
    total_enqueued: AtomicUsize,
    track_seen: bool,
}

impl ProcQueue {
    pub fn new(tag: &str, state: QueueState, track_seen: bool) -> Self {
        Self {
            name: queue_name(tag),
            state: Mutex::new(state),
            notify: tokio::sync::Notify::new(),
            listeners: AtomicUsize::new(0),
            total_enqueued: AtomicUsize::new(0),
            track_seen,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a destination unless it is already pending. Returns
    /// whether the element was actually added.
    pub fn add(&self, element: &str) -> bool {
        let added = {
            let mut state = self.state.lock().expect("queue mutex");
            if state.unique.insert(element.to_string()) {
                state.entries.push_back(element.to_string());
                true
            } else {
                false
            }
        };
        if added {
            self.total_enqueued.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            debug!("{}: enqueued {}", self.name, element);
        }
        added
    }

    pub fn add_from<I: IntoIterator<Item = Asn>>(&self, elements: I) -> usize {
        elements.into_iter().filter(|e| self.add(e)).count()
    }

    /// Pop the next unseen element, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<Asn> {
        let mut state = self.state.lock().expect("queue mutex");
        while let Some(element) = state.entries.pop_front() {
            state.unique.remove(&element);
            if self.track_seen && !state.seen.insert(element.clone()) {
                continue;
            }
            return Some(element);
        }
        None
    }

    /// Wait for the next element.
    pub async fn next(&self) -> Asn {
        loop {
            if let Some(element) = self.pop() {
                return element;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue mutex").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("queue mutex");
        state.entries.clear();
        state.unique.clear();
        state.seen.clear();
    }

    pub fn has_listeners(&self) -> bool {
        self.listeners.load(Ordering::SeqCst) > 0
    }

    /// Register a consuming worker for the lifetime of the guard.
    pub fn subscribe(self: &Arc<Self>) -> ListenerGuard {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        ListenerGuard {
            queue: Arc::clone(self),
        }
    }

    /// Total successful enqueues since startup.
    pub fn total_enqueued(&self) -> usize {
        self.total_enqueued.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> QueueState {
        self.state.lock().expect("queue mutex").clone()
    }
}

pub struct ListenerGuard {
    queue: Arc<ProcQueue>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.queue.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_deduplicates_pending() {
        let queue = ProcQueue::new("T", QueueState::default(), false);
        assert!(queue.add("9"));
        assert!(!queue.add("9"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.total_enqueued(), 1);
        assert_eq!(queue.pop(), Some("9".to_string()));
        // Once popped, the destination may be enqueued again.
        assert!(queue.add("9"));
    }

    #[test]
    fn test_add_from_counts_new_entries() {
        let queue = ProcQueue::new("T", QueueState::default(), false);
        let added = queue.add_from(vec!["1".to_string(), "2".to_string(), "1".to_string()]);
        assert_eq!(added, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_track_seen_skips_processed() {
        let queue = ProcQueue::new("T", QueueState::default(), true);
        queue.add("9");
        assert_eq!(queue.pop(), Some("9".to_string()));
        queue.add("9");
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_listener_counter() {
        let queue = Arc::new(ProcQueue::new("T", QueueState::default(), false));
        assert!(!queue.has_listeners());
        let guard = queue.subscribe();
        assert!(queue.has_listeners());
        drop(guard);
        assert!(!queue.has_listeners());
    }

    #[tokio::test]
    async fn test_next_wakes_on_add() {
        let queue = Arc::new(ProcQueue::new("T", QueueState::default(), false));
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.next().await });
        tokio::task::yield_now().await;
        queue.add("9");
        assert_eq!(handle.await.unwrap(), "9".to_string());
    }
}
