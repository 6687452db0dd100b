//! Worker pool for encode/write tasks with explicit join semantics.

use std::panic::{self, AssertUnwindSafe};
use std::collections::VecDeque;
use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// Identifies a task submitted to a [`TaskGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

/// How a task ended.
#[derive(Debug)]
pub struct TaskOutcome {
    pub id: TaskId,
    /// File the task wrote.
    pub path: PathBuf,
    pub result: Result<()>,
}

struct Pending {
    id: TaskId,
    path: PathBuf,
    done: Receiver<Result<()>>,
}

/// A set of write tasks on a fixed-size thread pool.
///
/// Every spawned task yields exactly one [`TaskOutcome`] from
/// [`TaskGroup::join`], whether it succeeded, failed or panicked. Two tasks
/// writing the same path never run at the same time, and at most `limit`
/// tasks are outstanding: `spawn` waits for the oldest one beyond that.
pub struct TaskGroup {
    pool: ThreadPool,
    limit: usize,
    pending: VecDeque<Pending>,
    finished: Vec<TaskOutcome>,
    next_id: usize,
}

impl TaskGroup {
    /// Half the available processing units, at least one.
    #[must_use]
    pub fn default_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, |n| n.get() / 2)
            .max(1)
    }

    /// A pool of `threads` writers holding at most twice that many
    /// outstanding tasks.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the pool cannot be built.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("writer-{i}"))
            .build()
            .map_err(|err| Error::config(format!("cannot start worker pool: {err}")))?;
        let threads = pool.current_num_threads();
        tracing::debug!("Worker pool with {threads} threads");
        Ok(Self {
            pool,
            limit: threads * 2,
            pending: VecDeque::new(),
            finished: Vec::new(),
            next_id: 0,
        })
    }

    /// Cap the number of outstanding tasks, at least one.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Queue `task`, which writes `path`.
    ///
    /// If an earlier task for the same path is still outstanding, this waits
    /// for it first. With `limit` tasks outstanding it waits for the oldest.
    pub fn spawn<F>(&mut self, path: PathBuf, task: F) -> TaskId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if let Some(position) = self.pending.iter().position(|p| p.path == path) {
            tracing::debug!("Waiting for previous write of {}", path.display());
            if let Some(previous) = self.pending.remove(position) {
                self.settle(previous);
            }
        }
        while self.pending.len() >= self.limit {
            match self.pending.pop_front() {
                Some(oldest) => self.settle(oldest),
                None => break,
            }
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        let (sender, done) = bounded(1);
        let label = path.clone();
        self.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task))
                .unwrap_or_else(|_| Err(Error::TaskPanicked { path: label }));
            // The group may already be gone; nobody is left to report to.
            let _ = sender.send(result);
        });
        self.pending.push_back(Pending { id, path, done });
        id
    }

    /// Tasks spawned but not yet collected.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every task and return all outcomes in submission order.
    #[must_use]
    pub fn join(mut self) -> Vec<TaskOutcome> {
        for pending in std::mem::take(&mut self.pending) {
            self.settle(pending);
        }
        let mut outcomes = std::mem::take(&mut self.finished);
        outcomes.sort_by_key(|outcome| outcome.id);
        outcomes
    }

    fn settle(&mut self, pending: Pending) {
        let result = pending.done.recv().unwrap_or_else(|_| {
            Err(Error::TaskPanicked {
                path: pending.path.clone(),
            })
        });
        self.finished.push(TaskOutcome {
            id: pending.id,
            path: pending.path,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_join_collects_every_outcome() {
        let mut group = TaskGroup::new(2).unwrap();
        for i in 0..6 {
            group.spawn(PathBuf::from(format!("{i}.png")), move || {
                if i % 3 == 0 {
                    Err(Error::config(format!("task {i}")))
                } else {
                    Ok(())
                }
            });
        }

        let outcomes = group.join();
        assert_eq!(outcomes.len(), 6);
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.path.clone())
            .collect();
        assert_eq!(failed, vec![PathBuf::from("0.png"), PathBuf::from("3.png")]);
    }

    #[test]
    fn test_panic_becomes_outcome() {
        let mut group = TaskGroup::new(1).unwrap();
        group.spawn(PathBuf::from("bad.png"), || panic!("encoder exploded"));
        group.spawn(PathBuf::from("good.png"), || Ok(()));

        let outcomes = group.join();
        assert!(matches!(outcomes[0].result, Err(Error::TaskPanicked { .. })));
        assert!(outcomes[1].result.is_ok());
    }

    #[test]
    fn test_same_path_writes_do_not_overlap() {
        let mut group = TaskGroup::new(4).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let active = Arc::clone(&active);
            let order = Arc::clone(&order);
            group.spawn(PathBuf::from("same.png"), move || {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(Duration::from_millis(5));
                order.lock().unwrap().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let outcomes = group.join();
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_outstanding_tasks_bounded() {
        let mut group = TaskGroup::new(1).unwrap().with_limit(3);
        let written = Arc::new(AtomicUsize::new(0));

        for i in 0..40 {
            let payload = vec![0u8; 1 << 16];
            let written = Arc::clone(&written);
            group.spawn(PathBuf::from(format!("{i}.png")), move || {
                std::thread::sleep(Duration::from_millis(1));
                written.fetch_add(payload.len(), Ordering::SeqCst);
                Ok(())
            });
            assert!(group.outstanding() <= 3);
        }

        let outcomes = group.join();
        assert_eq!(outcomes.len(), 40);
        assert!(outcomes.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(written.load(Ordering::SeqCst), 40 << 16);
    }

    #[test]
    fn test_default_limit_follows_threads() {
        assert_eq!(TaskGroup::new(3).unwrap().limit(), 6);
        assert_eq!(TaskGroup::new(2).unwrap().with_limit(0).limit(), 1);
    }

    #[test]
    fn test_default_threads_at_least_one() {
        assert!(TaskGroup::default_threads() >= 1);
    }
}
