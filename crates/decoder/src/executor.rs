//! Host-stage thread pool with fork-join task groups.
//!
//! A [`HostExecutor`] owns a fixed-size rayon pool. Work is submitted through
//! [`HostExecutor::task_group`]: every task spawned inside the group has
//! finished when the call returns, so the end of the group is the host-stage
//! barrier. Tasks start in submission order (FIFO), which is what lets the
//! load balancer's largest-first ordering take effect.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ScopeFifo, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use pf_common::{DecodeError, InitError, SourceId};

type Failures = Arc<Mutex<Vec<(usize, DecodeError)>>>;

/// Fixed-size pool of host worker threads.
pub struct HostExecutor {
    pool: ThreadPool,
    num_threads: usize,
    pinned: bool,
}

impl HostExecutor {
    /// Build a pool of `num_threads` workers named `pf-host-{i}`.
    ///
    /// With `pin_threads`, worker `i` is pinned to core `i % cores`. Pinning
    /// is best effort: when the platform reports no cores the pool runs
    /// unpinned.
    pub fn new(num_threads: usize, pin_threads: bool) -> Result<Self, InitError> {
        if num_threads == 0 {
            return Err(InitError::ThreadPool("num_threads must be > 0".into()));
        }

        let mut builder = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("pf-host-{i}"));

        let mut pinned = false;
        if pin_threads {
            let cores = core_affinity::get_core_ids().unwrap_or_default();
            if cores.is_empty() {
                warn!("Thread pinning requested but no core ids available, running unpinned");
            } else {
                pinned = true;
                builder = builder.start_handler(move |i| {
                    let core = cores[i % cores.len()];
                    if !core_affinity::set_for_current(core) {
                        warn!(worker = i, core = core.id, "Failed to pin host worker");
                    }
                });
            }
        }

        let pool = builder
            .build()
            .map_err(|e| InitError::ThreadPool(e.to_string()))?;

        info!(num_threads, pinned, "Host executor started");
        Ok(Self {
            pool,
            num_threads,
            pinned,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run `build`, which submits tasks to the group, then wait for all of
    /// them.
    ///
    /// Returns the number of tasks run. If any task failed, the failure with
    /// the lowest key is returned; the others are logged and dropped.
    pub fn task_group<'scope, F>(&self, build: F) -> Result<usize, DecodeError>
    where
        F: FnOnce(&TaskGroup<'_, 'scope>) + Send,
    {
        let failures: Failures = Arc::new(Mutex::new(Vec::new()));

        let submitted = self.pool.scope_fifo(|scope| {
            let group = TaskGroup {
                scope,
                failures: failures.clone(),
                submitted: Cell::new(0),
            };
            build(&group);
            group.submitted.get()
        });

        let mut failures = std::mem::take(&mut *failures.lock());
        failures.sort_by_key(|(key, _)| *key);
        let count = failures.len();
        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(submitted),
            Some((key, first)) => {
                for (other_key, other) in failures {
                    debug!(key = other_key, error = %other, "Additional host task failure");
                }
                debug!(key, failed = count, submitted, "Task group failed");
                Err(first)
            }
        }
    }
}

impl fmt::Debug for HostExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostExecutor")
            .field("num_threads", &self.num_threads)
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// Handle for submitting tasks inside [`HostExecutor::task_group`].
pub struct TaskGroup<'a, 'scope> {
    scope: &'a ScopeFifo<'scope>,
    failures: Failures,
    submitted: Cell<usize>,
}

impl<'a, 'scope> TaskGroup<'a, 'scope> {
    /// Queue `task`. `key` orders failures; `sample` names a panicking task.
    pub fn submit<F>(&self, key: usize, sample: SourceId, task: F)
    where
        F: FnOnce() -> Result<(), DecodeError> + Send + 'scope,
    {
        self.submitted.set(self.submitted.get() + 1);
        let failures = self.failures.clone();
        self.scope.spawn_fifo(move |_| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                Err(DecodeError::HostWorker {
                    sample,
                    reason: panic_message(payload.as_ref()),
                })
            });
            if let Err(err) = outcome {
                failures.lock().push((key, err));
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
