//! Status event bus shared by process controllers and health monitors
//!
//! Each entity owns one [`StatusBus`]. The bus keeps the latest value, a
//! bounded history of recent transitions, and a list of registered
//! subscribers. Every subscriber receives every transition published after it
//! subscribed, so any number of observers (a CLI printer, the HTTP status
//! endpoint, the dependency launcher) can watch the same entity.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Number of transitions retained for late subscribers
pub const DEFAULT_HISTORY: usize = 32;

struct BusState<S> {
    current: S,
    history: VecDeque<S>,
    capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<S>>,
}

/// Latest value + history + subscriber list for one entity's status
#[derive(Clone)]
pub struct StatusBus<S> {
    state: Arc<Mutex<BusState<S>>>,
}

impl<S: Clone + Send + 'static> StatusBus<S> {
    /// Create a bus holding `initial` as both current value and first history entry
    pub fn new(initial: S) -> Self {
        Self::with_capacity(initial, DEFAULT_HISTORY)
    }

    /// Create a bus retaining at most `capacity` transitions
    pub fn with_capacity(initial: S, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut history = VecDeque::with_capacity(capacity);
        history.push_back(initial.clone());
        Self {
            state: Arc::new(Mutex::new(BusState {
                current: initial,
                history,
                capacity,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState<S>> {
        // Holders never panic mid-update, so a poisoned lock still guards consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest published value
    pub fn current(&self) -> S {
        self.lock().current.clone()
    }

    /// Retained transitions, oldest first
    pub fn history(&self) -> Vec<S> {
        self.lock().history.iter().cloned().collect()
    }

    /// Number of live subscribers
    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Publish a new value to the history and every live subscriber
    pub fn publish(&self, status: S) {
        let mut state = self.lock();
        state.current = status.clone();
        if state.history.len() == state.capacity {
            state.history.pop_front();
        }
        state.history.push_back(status.clone());
        state
            .subscribers
            .retain(|tx| tx.send(status.clone()).is_ok());
    }

    /// Subscribe to transitions published from now on
    pub fn subscribe(&self) -> StatusStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        StatusStream { rx }
    }

    /// Subscribe, first replaying the retained history
    pub fn subscribe_with_history(&self) -> StatusStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for status in &state.history {
            let _ = tx.send(status.clone());
        }
        state.subscribers.push(tx);
        StatusStream { rx }
    }

    /// Wait until the current or a later value satisfies `pred`.
    ///
    /// Returns `None` only if every handle to the bus was dropped first.
    pub async fn wait_for<F>(&self, pred: F) -> Option<S>
    where
        F: Fn(&S) -> bool,
    {
        let mut stream = {
            let mut state = self.lock();
            if pred(&state.current) {
                return Some(state.current.clone());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.push(tx);
            StatusStream { rx }
        };

        while let Some(status) = stream.recv().await {
            if pred(&status) {
                return Some(status);
            }
        }
        None
    }
}

/// Receiving side of a bus subscription
pub struct StatusStream<S> {
    rx: mpsc::UnboundedReceiver<S>,
}

impl<S> StatusStream<S> {
    /// Next transition, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<S> {
        self.rx.recv().await
    }

    /// Next already-delivered transition without waiting
    pub fn try_recv(&mut self) -> Option<S> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_history_is_bounded() {
        let bus = StatusBus::with_capacity(0u32, 3);
        for i in 1..=5 {
            bus.publish(i);
        }
        assert_eq!(bus.current(), 5);
        assert_eq!(bus.history(), vec![3, 4, 5]);
    }

    #[test]
    fn test_every_subscriber_sees_every_transition() {
        let bus = StatusBus::new("a");
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish("b");
        bus.publish("c");

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.try_recv(), Some("b"));
            assert_eq!(stream.try_recv(), Some("c"));
            assert_eq!(stream.try_recv(), None);
        }
    }

    #[test]
    fn test_subscribe_with_history_replays() {
        let bus = StatusBus::new(1);
        bus.publish(2);
        let mut stream = bus.subscribe_with_history();
        bus.publish(3);

        assert_eq!(stream.try_recv(), Some(1));
        assert_eq!(stream.try_recv(), Some(2));
        assert_eq!(stream.try_recv(), Some(3));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = StatusBus::new(0);
        let stream = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(stream);
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_current_value() {
        let bus = StatusBus::new(7);
        assert_eq!(bus.wait_for(|v| *v == 7).await, Some(7));
    }

    #[tokio::test]
    async fn test_wait_for_later_value() {
        let bus = StatusBus::new(0);
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(1);
            publisher.publish(2);
        });

        let value = tokio::time::timeout(Duration::from_secs(1), bus.wait_for(|v| *v == 2))
            .await
            .unwrap();
        assert_eq!(value, Some(2));
    }
}
