// Fixed pool of symmetric worker threads.
//
// The accept loop pushes connections into a bounded `WorkQueue`; each worker
// pops one, serves exactly one request on it, and goes back for the next.
// Workers keep no state between requests apart from their counters.

use crate::error::Result;
use crate::handlers::{ServerContext, serve_connection};
use crate::listener::Connection;
use crate::queue::WorkQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

/// Worker thread statistics
#[derive(Debug)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub requests_processed: AtomicU64,
    pub total_processing_time_us: AtomicU64,
    pub errors: AtomicU64,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            requests_processed: AtomicU64::new(0),
            total_processing_time_us: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Mean time spent per request so far, in microseconds.
    pub fn average_processing_time_us(&self) -> u64 {
        let processed = self.requests_processed.load(Ordering::Relaxed);
        if processed == 0 {
            return 0;
        }
        self.total_processing_time_us.load(Ordering::Relaxed) / processed
    }

    fn record(&self, started: Instant) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_us.fetch_add(
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

/// Worker thread pool handle
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    worker_stats: Vec<Arc<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers draining `queue`.
    ///
    /// A worker that hits a fatal error logs it and terminates the process
    /// with status 1.
    pub fn spawn(
        worker_count: usize,
        queue: Arc<WorkQueue<Connection>>,
        ctx: Arc<ServerContext>,
    ) -> Result<Self> {
        info!("Starting worker pool with {} workers", worker_count);

        let mut handles = Vec::with_capacity(worker_count);
        let mut worker_stats = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let stats = Arc::new(WorkerStats::new(worker_id));
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let thread_stats = Arc::clone(&stats);

            let handle = thread::Builder::new()
                .name(format!("burrow-worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, &queue, &ctx, &thread_stats) {
                        error!("Worker {} stopped on a fatal error: {}", worker_id, e);
                        std::process::exit(1);
                    }
                })?;

            handles.push(handle);
            worker_stats.push(stats);
        }

        Ok(Self {
            handles,
            worker_stats,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &[Arc<WorkerStats>] {
        &self.worker_stats
    }

    /// Requests finished across all workers.
    pub fn total_processed(&self) -> u64 {
        self.worker_stats
            .iter()
            .map(|s| s.requests_processed.load(Ordering::Relaxed))
            .sum()
    }
}

fn worker_loop(
    worker_id: usize,
    queue: &WorkQueue<Connection>,
    ctx: &ServerContext,
    stats: &WorkerStats,
) -> Result<()> {
    debug!("Worker {} started", worker_id);

    loop {
        let conn = queue.pop();
        let started = Instant::now();
        let conn_id = conn.id();

        let outcome = serve_connection(ctx, conn);
        stats.record(started);

        match outcome {
            Ok(status) => debug!(
                "Worker {} finished connection {} with {} ({} served, avg {}us)",
                worker_id,
                conn_id,
                status.code(),
                stats.requests_processed.load(Ordering::Relaxed),
                stats.average_processing_time_us()
            ),
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
    }
}
