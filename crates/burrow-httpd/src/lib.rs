//! # Burrow HTTPD
//!
//! A small multi-threaded file server speaking a subset of HTTP/1.1.
//!
//! `GET /name` returns the bytes of `name` under the serve root and
//! `PUT /name` replaces them with the request body. Same-name requests are
//! serialized with advisory `flock` locks (shared for reads, exclusive for
//! writes), and a gate lock makes "open or create, then lock" atomic. The
//! locks are advisory, so several server processes sharing a root
//! coordinate too.
//!
//! ## Layout
//!
//! - [`server`]: binds the listener and runs the accept loop
//! - [`worker_pool`]: fixed pool of threads draining the [`queue`]
//! - [`handlers`]: dispatch plus the read and write handlers
//! - [`gate`]: the gated open-and-lock operation
//! - [`protocol`], [`listener`], [`transfer`]: wire format and byte movement
//! - [`audit`]: one line per completed request

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod listener;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transfer;
pub mod worker_pool;

pub use audit::{AuditBuffer, AuditLogger, AuditRecord};
pub use config::{AuditFormat, HttpdConfig, LogFormat};
pub use error::{HttpdError, Result};
pub use protocol::StatusCode;
pub use server::HttpServer;
