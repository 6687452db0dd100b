//! Bounded hand-off between the loader thread and inference.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::error::{Error, Result};

/// Process-wide stop request, shared by the producer and the consumer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Occupancy instrumentation for a [`LoadQueue`].
#[derive(Debug)]
pub struct QueueStats {
    capacity: usize,
    peak: AtomicUsize,
    pushed: AtomicUsize,
}

impl QueueStats {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            peak: AtomicUsize::new(0),
            pushed: AtomicUsize::new(0),
        }
    }

    fn record_push(&self, occupancy: usize) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(occupancy, Ordering::Relaxed);
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest number of items observed waiting in the queue.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Items the producer has enqueued so far.
    #[must_use]
    pub fn pushed(&self) -> usize {
        self.pushed.load(Ordering::Relaxed)
    }
}

/// An item produced by the loader.
#[derive(Debug)]
pub struct Queued<T> {
    /// Position in the input list.
    pub index: usize,
    pub path: PathBuf,
    pub value: T,
}

/// Loader thread feeding a fixed-capacity queue.
///
/// The producer blocks while the queue is full. Iterating the queue blocks
/// until an item is available and ends once the producer is done.
pub struct LoadQueue<T> {
    receiver: Receiver<Queued<T>>,
    stats: Arc<QueueStats>,
    producer: JoinHandle<()>,
}

impl<T: Send + 'static> LoadQueue<T> {
    /// Start loading `paths` in order with `load`.
    ///
    /// The producer checks `cancel` before each load and stops early once it
    /// is set.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for zero capacity, or an IO error if the
    /// thread cannot be started.
    pub fn spawn<F>(paths: Vec<PathBuf>, capacity: usize, cancel: CancelFlag, load: F) -> Result<Self>
    where
        F: Fn(&Path) -> T + Send + 'static,
    {
        if capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        let (sender, receiver) = bounded(capacity);
        let stats = Arc::new(QueueStats::new(capacity));
        let producer_stats = Arc::clone(&stats);

        let producer = std::thread::Builder::new()
            .name("loader".to_string())
            .spawn(move || {
                for (index, path) in paths.into_iter().enumerate() {
                    if cancel.is_cancelled() {
                        tracing::debug!("Loader stopping: cancelled");
                        break;
                    }
                    let value = load(&path);
                    if sender.send(Queued { index, path, value }).is_err() {
                        break;
                    }
                    producer_stats.record_push(sender.len());
                }
            })?;

        Ok(Self {
            receiver,
            stats,
            producer,
        })
    }
}

impl<T> LoadQueue<T> {
    #[must_use]
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Stop consuming and wait for the loader thread.
    ///
    /// # Errors
    ///
    /// Returns `TaskPanicked` if the loader panicked.
    pub fn finish(self) -> Result<Arc<QueueStats>> {
        let Self {
            receiver,
            stats,
            producer,
        } = self;
        drop(receiver);
        producer.join().map_err(|_| Error::TaskPanicked {
            path: PathBuf::from("<loader>"),
        })?;
        Ok(stats)
    }
}

impl<T> Iterator for LoadQueue<T> {
    type Item = Queued<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("{i}.png"))).collect()
    }

    #[test]
    fn test_delivers_in_order() {
        let mut queue = LoadQueue::spawn(paths(5), 2, CancelFlag::new(), |p| {
            p.display().to_string()
        })
        .unwrap();

        let items: Vec<_> = queue.by_ref().map(|q| (q.index, q.value)).collect();
        assert_eq!(items.len(), 5);
        assert_eq!(items[3], (3, "3.png".to_string()));
        queue.finish().unwrap();
    }

    #[test]
    fn test_occupancy_bounded_by_capacity() {
        let mut queue = LoadQueue::spawn(paths(40), 4, CancelFlag::new(), |_| vec![0u8; 16]).unwrap();

        // Slow consumer: the producer runs ahead until the queue is full.
        std::thread::sleep(Duration::from_millis(50));
        let stats = queue.stats();
        let mut seen = 0;
        for _ in queue.by_ref() {
            seen += 1;
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(seen, 40);
        assert_eq!(stats.pushed(), 40);
        assert!(stats.peak() <= stats.capacity());
        assert!(stats.peak() >= 1);
        queue.finish().unwrap();
    }

    #[test]
    fn test_cancel_stops_producer() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut queue = LoadQueue::spawn(paths(10), 2, cancel, |_| ()).unwrap();

        assert!(queue.next().is_none());
        let stats = queue.finish().unwrap();
        assert_eq!(stats.pushed(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = LoadQueue::spawn(paths(1), 0, CancelFlag::new(), |_| ());
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
