//! Bounded worker pool for a detection run.
//!
//! Buckets are independent, so a run fans them out over a fixed number of
//! named worker threads fed through a bounded queue. The producer blocks
//! when the queue is full. The pool is scoped to the run: when the
//! function returns every worker has exited, which is the barrier the
//! group aggregation step waits on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::debug;

use crate::error::ExecutionError;

/// Cooperative cancellation flag shared with a running detection.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; workers stop before their next pair.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Runs `work` over every job on a scoped pool and returns the results in
/// completion order.
///
/// Stops feeding new jobs once `token` is cancelled. A worker panic is
/// reported as `ExecutionError::Worker`.
pub fn run_pool<J, R, F>(
    jobs: Vec<J>,
    config: PoolConfig,
    token: &CancellationToken,
    work: F,
) -> Result<Vec<R>, ExecutionError>
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    let workers = config.workers.max(1).min(jobs.len().max(1));
    let (job_tx, job_rx) = bounded::<J>(config.queue_capacity.max(1));
    let (result_tx, result_rx) = unbounded::<R>();
    let work = &work;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("accordance-detect-{idx}"))
                .spawn_scoped(scope, move || {
                    for job in job_rx.iter() {
                        if result_tx.send(work(job)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(job_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ExecutionError::Worker {
                        message: format!("failed to spawn detection worker: {e}"),
                    });
                }
            }
        }
        drop(result_tx);
        debug!(workers, "detection pool started");

        for job in jobs {
            if token.is_cancelled() {
                break;
            }
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut panicked = 0usize;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(ExecutionError::Worker {
                message: format!("{panicked} detection worker(s) panicked"),
            });
        }
        Ok(result_rx.try_iter().collect())
    })
}
