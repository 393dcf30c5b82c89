use std::path::PathBuf;

use thiserror::Error;

/// Internal failures of the daemon.
///
/// Client-triggerable conditions never surface here; handlers resolve them to a
/// [`StatusCode`](crate::protocol::StatusCode). Anything that does reach a worker
/// as an `HttpdError` is treated as fatal.
#[derive(Error, Debug)]
pub enum HttpdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("flock on {} failed: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("work queue error: {0}")]
    Queue(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HttpdError>;
