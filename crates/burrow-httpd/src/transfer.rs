//! Byte movement between client sockets and resource descriptors.

use std::fs::File;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::listener::Connection;
use crate::protocol::{self, Request};

#[cfg(target_os = "linux")]
const MAX_SENDFILE_CHUNK: usize = 1 << 30;

/// Why [`send_file`] stopped.
#[derive(Debug, Error)]
pub enum SendFailure {
    /// The head did not go out; an error response may still be attempted.
    #[error("writing response head: {0}")]
    Head(#[source] io::Error),
    /// The 200 head already went out, so the stream can only be abandoned.
    #[error("streaming response body: {0}")]
    Body(#[source] io::Error),
}

impl SendFailure {
    pub fn head_sent(&self) -> bool {
        matches!(self, SendFailure::Body(_))
    }
}

/// Send a 200 response whose body is the first `length` bytes of `file`.
///
/// Fails if the file turns out shorter than `length` or the peer goes away.
pub fn send_file(
    conn: &mut Connection,
    file: &File,
    length: u64,
    use_sendfile: bool,
) -> Result<(), SendFailure> {
    protocol::write_ok_head(conn, length).map_err(SendFailure::Head)?;
    send_body(conn, file, length, use_sendfile).map_err(SendFailure::Body)
}

fn send_body(
    conn: &mut Connection,
    file: &File,
    length: u64,
    use_sendfile: bool,
) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if use_sendfile {
            return sendfile_all(conn, file, length);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = use_sendfile;

    let copied = io::copy(&mut Read::take(file, length), conn)?;
    if copied < length {
        return Err(short_file(copied, length));
    }
    conn.flush()
}

#[cfg(target_os = "linux")]
fn sendfile_all(conn: &Connection, file: &File, length: u64) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::sendfile::sendfile;

    let mut offset: nix::libc::off_t = 0;
    let mut sent: u64 = 0;

    while sent < length {
        let count = usize::try_from(length - sent)
            .unwrap_or(usize::MAX)
            .min(MAX_SENDFILE_CHUNK);
        match sendfile(conn.stream(), file, Some(&mut offset), count) {
            Ok(0) => return Err(short_file(sent, length)),
            Ok(n) => sent += n as u64,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }

    debug!("sendfile moved {} bytes to connection {}", sent, conn.id());
    Ok(())
}

/// Store the request body in `file`, starting with the bytes that arrived
/// together with the head.
///
/// Returns the number of body bytes written, which always equals the
/// request's `Content-Length` on success.
pub fn receive_body(conn: &mut Connection, request: &Request, file: &File) -> io::Result<u64> {
    let expected = request.content_length().unwrap_or(0);
    let mut writer = file;

    let prefix = request.body_prefix();
    let prefix_len = prefix.len().min(usize::try_from(expected).unwrap_or(usize::MAX));
    writer.write_all(&prefix[..prefix_len])?;

    let remaining = expected - prefix_len as u64;
    let copied = io::copy(&mut Read::take(conn, remaining), &mut writer)?;
    if copied < remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "peer closed after {} of {} body bytes",
                prefix_len as u64 + copied,
                expected
            ),
        ));
    }

    debug!("Received {} body bytes", expected);
    Ok(expected)
}

fn short_file(sent: u64, length: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("resource ended after {sent} of {length} bytes"),
    )
}
