//! # Per-Session Audio Queue
//!
//! Bounded FIFO of pending playback items for one session. Overflow evicts the
//! oldest pending item so the newest prompt always gets a slot.
//!
//! ## Thread Safety:
//! The deque sits behind its own mutex, separate from the session registry, so
//! enqueueing for one call never contends with lookups for another. A `Notify`
//! wakes the single worker blocked in [`AudioQueue::dequeue`].
//!
//! Every clear bumps a generation counter under the same lock. A dequeued item
//! carries the generation it was taken in; if the counter has moved by the
//! time the worker is ready to play it, a kill landed in between.

use crate::playback::item::AudioItem;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What sits in the deque: a real item, or the stop marker placed by [`AudioQueue::stop`].
#[derive(Debug)]
enum QueueEntry {
    Item(AudioItem),
    Stop,
}

/// Result of a bounded wait for work.
#[derive(Debug)]
pub enum Dequeued {
    Item { item: AudioItem, generation: u64 },
    /// Nothing arrived before the timeout; the caller re-checks its stop conditions
    Empty,
    /// The queue was stopped; the worker must exit without playing anything
    Stop,
}

/// Result of a successful enqueue.
#[derive(Debug)]
pub struct EnqueueOutcome {
    /// Pending items after the operation
    pub depth: usize,
    /// Oldest item evicted to make room, if the queue was full
    pub dropped: Option<AudioItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The queue belongs to a session being torn down
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed => write!(f, "queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    closed: bool,
    generation: u64,
}

/// Bounded, drop-oldest playback queue for one session.
#[derive(Debug)]
pub struct AudioQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_depth: usize,
}

impl AudioQueue {
    /// Create an empty queue holding at most `max_depth` pending items.
    pub fn new(max_depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(max_depth),
                closed: false,
                generation: 0,
            }),
            notify: Notify::new(),
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Append an item at the tail, evicting the head first when full.
    ///
    /// Never blocks beyond the queue's own short critical section.
    pub fn enqueue(&self, item: AudioItem) -> Result<EnqueueOutcome, QueueError> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }

            let dropped = if state.entries.len() >= self.max_depth {
                match state.entries.pop_front() {
                    Some(QueueEntry::Item(oldest)) => Some(oldest),
                    _ => None,
                }
            } else {
                None
            };

            state.entries.push_back(QueueEntry::Item(item));
            EnqueueOutcome {
                depth: state.entries.len(),
                dropped,
            }
        };

        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wait up to `timeout` for the head entry.
    pub async fn dequeue(&self, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.entries.pop_front() {
                    return match entry {
                        QueueEntry::Item(item) => Dequeued::Item {
                            item,
                            generation: state.generation,
                        },
                        QueueEntry::Stop => Dequeued::Stop,
                    };
                }
            }

            // A permit stored by notify_one covers an enqueue racing this wait
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Dequeued::Empty;
            }
        }
    }

    /// Remove every pending item. An item already handed to the worker is unaffected.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state
            .entries
            .iter()
            .filter(|entry| matches!(entry, QueueEntry::Item(_)))
            .count();
        state.entries.clear();
        state.generation += 1;
        if state.closed {
            // Keep the worker's exit marker
            state.entries.push_back(QueueEntry::Stop);
        }
        removed
    }

    /// Clear pending items, put the stop marker at the head and refuse further enqueues.
    pub fn stop(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let removed = state
                .entries
                .iter()
                .filter(|entry| matches!(entry, QueueEntry::Item(_)))
                .count();
            state.entries.clear();
            state.entries.push_front(QueueEntry::Stop);
            state.closed = true;
            state.generation += 1;
            removed
        };
        self.notify.notify_one();
        removed
    }

    /// Number of clears so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending items (the stop marker is not counted).
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| matches!(entry, QueueEntry::Item(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File paths of pending items, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                QueueEntry::Item(item) => Some(item.file_path.clone()),
                QueueEntry::Stop => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(tag: usize) -> AudioItem {
        AudioItem::raw(format!("/tmp/clip-{}.r16", tag), 16000).unwrap()
    }

    #[test]
    fn test_drop_oldest_bound() {
        let queue = AudioQueue::new(10);
        for tag in 1..=11 {
            let outcome = queue.enqueue(item(tag)).unwrap();
            assert!(outcome.depth <= 10);
            if tag == 11 {
                let dropped = outcome.dropped.expect("oldest item should be evicted");
                assert_eq!(dropped.file_path, "/tmp/clip-1.r16");
            } else {
                assert!(outcome.dropped.is_none());
            }
        }

        let expected: Vec<String> = (2..=11).map(|tag| format!("/tmp/clip-{}.r16", tag)).collect();
        assert_eq!(queue.snapshot(), expected);
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = AudioQueue::new(10);
        for tag in 1..=5 {
            queue.enqueue(item(tag)).unwrap();
        }

        for tag in 1..=5 {
            match queue.dequeue(Duration::from_millis(10)).await {
                Dequeued::Item { item, .. } => assert_eq!(item.file_path, format!("/tmp/clip-{}.r16", tag)),
                other => panic!("expected item {}, got {:?}", tag, other),
            }
        }
        assert!(matches!(
            queue.dequeue(Duration::from_millis(10)).await,
            Dequeued::Empty
        ));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(AudioQueue::new(10));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(item(7)).unwrap();
        });

        match queue.dequeue(Duration::from_secs(2)).await {
            Dequeued::Item { item, .. } => assert_eq!(item.file_path, "/tmp/clip-7.r16"),
            other => panic!("expected item, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_then_empty() {
        let queue = AudioQueue::new(10);
        for tag in 1..=5 {
            queue.enqueue(item(tag)).unwrap();
        }
        assert_eq!(queue.clear(), 5);
        assert_eq!(queue.len(), 0);
        assert!(matches!(
            queue.dequeue(Duration::from_millis(10)).await,
            Dequeued::Empty
        ));
    }

    #[tokio::test]
    async fn test_clear_moves_generation() {
        let queue = AudioQueue::new(10);
        queue.enqueue(item(1)).unwrap();
        queue.enqueue(item(2)).unwrap();

        let Dequeued::Item { generation, .. } = queue.dequeue(Duration::from_millis(10)).await else {
            panic!("expected an item");
        };
        assert_eq!(generation, queue.generation());

        queue.clear();
        assert_ne!(generation, queue.generation());
        queue.enqueue(item(3)).unwrap();
        let Dequeued::Item { item, generation: after } = queue.dequeue(Duration::from_millis(10)).await else {
            panic!("expected an item");
        };
        assert_eq!(item.file_path, "/tmp/clip-3.r16");
        assert_eq!(after, queue.generation());
    }

    #[tokio::test]
    async fn test_stop_signal_precedes_items_and_closes() {
        let queue = AudioQueue::new(10);
        queue.enqueue(item(1)).unwrap();
        queue.enqueue(item(2)).unwrap();

        assert_eq!(queue.stop(), 2);
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(item(3)).unwrap_err(), QueueError::Closed);

        // Clearing a stopped queue keeps the exit marker
        queue.clear();
        assert!(matches!(
            queue.dequeue(Duration::from_millis(10)).await,
            Dequeued::Stop
        ));
    }
}
