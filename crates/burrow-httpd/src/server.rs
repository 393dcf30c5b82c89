use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::config::HttpdConfig;
use crate::error::Result;
use crate::gate::LockGate;
use crate::handlers::ServerContext;
use crate::listener::{Connection, Listener};
use crate::queue::WorkQueue;
use crate::worker_pool::WorkerPool;

/// A bound server with its worker pool already running.
pub struct HttpServer {
    listener: Listener,
    queue: Arc<WorkQueue<Connection>>,
    pool: WorkerPool,
}

impl HttpServer {
    /// Create the gate marker, bind the listener and start the workers.
    ///
    /// `config` is expected to have passed
    /// [`validate_config`](crate::config::validate_config).
    pub fn bind(config: &HttpdConfig, audit: AuditLogger) -> Result<Self> {
        let gate = LockGate::create(&config.root_dir)?;
        let queue = Arc::new(WorkQueue::new(config.workers)?);
        let ctx = Arc::new(ServerContext::new(
            config.root_dir.clone(),
            gate,
            audit,
            config.performance.use_sendfile,
            config.connection.max_header_bytes,
        ));

        let listener = Listener::bind(config.bind_addr, config.performance.reuse_address)?
            .with_read_timeout(config.connection.read_timeout());

        info!(
            "Serving {} on {} with {} workers",
            ctx.root().display(),
            listener.local_addr()?,
            config.workers
        );

        let pool = WorkerPool::spawn(config.workers, Arc::clone(&queue), ctx)?;

        Ok(Self {
            listener,
            queue,
            pool,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, handing each to the pool.
    ///
    /// Blocks in `push` whenever every worker is busy and the queue is full.
    pub fn run(mut self) -> Result<()> {
        info!("Accepting connections for {} workers", self.pool.worker_count());
        loop {
            match self.listener.accept() {
                Ok(conn) => self.queue.push(conn),
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}
