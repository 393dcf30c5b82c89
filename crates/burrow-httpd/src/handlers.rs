//! Request dispatch plus the read and write handlers.
//!
//! Every handler resolves its request to exactly one response and one audit
//! record. Only lock failures escape as `Err`; the worker treats those as
//! fatal.

use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::error::Result;
use crate::gate::{AccessMode, LockGate, Opened};
use crate::listener::Connection;
use crate::protocol::{self, Method, Request, StatusCode};
use crate::transfer::{self, SendFailure};

/// State shared by every worker, built once by the server entry point.
pub struct ServerContext {
    root: PathBuf,
    gate: LockGate,
    audit: AuditLogger,
    use_sendfile: bool,
    max_header_bytes: usize,
}

impl ServerContext {
    pub fn new(
        root: PathBuf,
        gate: LockGate,
        audit: AuditLogger,
        use_sendfile: bool,
        max_header_bytes: usize,
    ) -> Self {
        Self {
            root,
            gate,
            audit,
            use_sendfile,
            max_header_bytes,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// Parse one request from `conn`, run it, and close the connection.
///
/// Returns the status sent to the peer.
pub fn serve_connection(ctx: &ServerContext, mut conn: Connection) -> Result<StatusCode> {
    let request = match protocol::parse(&mut conn, ctx.max_header_bytes) {
        Ok(request) => request,
        Err(status) => {
            debug!(
                "Connection {} from {}: unparseable request, answering {}",
                conn.id(),
                conn.peer(),
                status.code()
            );
            respond(&mut conn, status);
            conn.close();
            return Ok(status);
        }
    };

    debug!(
        "Connection {}: {} {} (request id {})",
        conn.id(),
        request.method().as_str(),
        request.target(),
        request.request_id()
    );

    let outcome = match request.method() {
        Method::Get => handle_get(ctx, &mut conn, &request),
        Method::Put => handle_put(ctx, &mut conn, &request),
        Method::Other(name) => {
            respond(&mut conn, StatusCode::NotImplemented);
            ctx.audit.log(
                name,
                request.resource_name(),
                StatusCode::NotImplemented,
                request.request_id(),
            );
            Ok(StatusCode::NotImplemented)
        }
    };

    conn.close();
    outcome
}

fn handle_get(ctx: &ServerContext, conn: &mut Connection, request: &Request) -> Result<StatusCode> {
    let path = ctx.root.join(request.resource_name());

    let status = match ctx.gate.open_locked(&path, AccessMode::Read)? {
        Opened::Refused(e) => {
            let status = classify_open_failure(&e, AccessMode::Read);
            respond(conn, status);
            status
        }
        Opened::Locked(resource) => {
            let sent = resource
                .size()
                .map_err(SendFailure::Head)
                .and_then(|len| {
                    transfer::send_file(conn, resource.file(), len, ctx.use_sendfile)
                });
            match sent {
                Ok(()) => StatusCode::Ok,
                Err(failure) => {
                    warn!("Read of {} failed: {}", path.display(), failure);
                    abandon_read(conn, &failure)
                }
            }
        }
    };

    ctx.audit.log(
        request.method().as_str(),
        request.resource_name(),
        status,
        request.request_id(),
    );
    Ok(status)
}

fn handle_put(ctx: &ServerContext, conn: &mut Connection, request: &Request) -> Result<StatusCode> {
    let path = ctx.root.join(request.resource_name());

    let status = match ctx.gate.open_locked(&path, AccessMode::Write)? {
        Opened::Refused(e) => {
            let status = classify_open_failure(&e, AccessMode::Write);
            respond(conn, status);
            status
        }
        Opened::Locked(resource) => {
            // Full replace: never append to previous content.
            let stored = resource
                .file()
                .set_len(0)
                .and_then(|()| transfer::receive_body(conn, request, resource.file()));
            let status = match stored {
                Ok(_) if resource.existed() => StatusCode::Ok,
                Ok(_) => StatusCode::Created,
                Err(e) => {
                    warn!("Write of {} failed: {}", path.display(), e);
                    StatusCode::InternalServerError
                }
            };
            respond(conn, status);
            status
        }
    };

    ctx.audit.log(
        request.method().as_str(),
        request.resource_name(),
        status,
        request.request_id(),
    );
    Ok(status)
}

/// Answer a failed read with 500 unless the 200 head is already on the
/// wire, in which case the connection is only closed.
fn abandon_read(conn: &mut Connection, failure: &SendFailure) -> StatusCode {
    if !failure.head_sent() {
        respond(conn, StatusCode::InternalServerError);
    }
    StatusCode::InternalServerError
}

/// Map a refused open to the status the client sees.
///
/// A missing path means "not found" for reads but "forbidden" for writes,
/// since a write can only fail that way on a missing parent directory.
pub fn classify_open_failure(err: &io::Error, mode: AccessMode) -> StatusCode {
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::IsADirectory => StatusCode::Forbidden,
        io::ErrorKind::NotFound => match mode {
            AccessMode::Read => StatusCode::NotFound,
            AccessMode::Write => StatusCode::Forbidden,
        },
        _ => StatusCode::InternalServerError,
    }
}

fn respond(conn: &mut Connection, status: StatusCode) {
    if let Err(e) = protocol::send_response(conn, status) {
        debug!(
            "Connection {}: failed to send {}: {}",
            conn.id(),
            status.code(),
            e
        );
    }
}
