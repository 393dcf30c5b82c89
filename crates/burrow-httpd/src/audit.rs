use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{Level, event, warn};

use crate::config::AuditFormat;
use crate::protocol::StatusCode;

const SERVICE_NAME: &str = "burrow-httpd";

/// One completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Request method as received (`GET`, `PUT`, ...)
    pub operation: String,
    /// Resource name with a leading slash
    pub resource: String,
    /// Status code sent to the peer
    pub status: u16,
    /// Client correlation id, `"0"` when absent
    pub request_id: String,
}

impl AuditRecord {
    pub fn new(operation: &str, resource_name: &str, status: StatusCode, request_id: &str) -> Self {
        Self {
            operation: operation.to_string(),
            resource: format!("/{resource_name}"),
            status: status.code(),
            request_id: request_id.to_string(),
        }
    }

    /// `operation,/resource,status,request_id`
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{}",
            self.operation, self.resource, self.status, self.request_id
        )
    }

    fn severity(&self) -> &'static str {
        match self.status {
            500.. => "error",
            400..=499 => "warn",
            _ => "info",
        }
    }
}

/// Fields added to every JSON audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error, derived from the status class
    pub severity: String,
}

impl CommonFields {
    fn new(hostname: &str, severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname.to_string(),
            service: SERVICE_NAME.to_string(),
            severity: severity.to_string(),
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    #[serde(flatten)]
    common: CommonFields,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

/// Process-wide append-only request log.
///
/// Each record becomes exactly one line, written with a single `write_all`
/// under the sink mutex, so concurrent records never tear.
pub struct AuditLogger {
    sink: Mutex<Box<dyn Write + Send>>,
    format: AuditFormat,
    hostname: String,
}

impl AuditLogger {
    /// Log to standard error.
    pub fn stderr(format: AuditFormat) -> Self {
        Self::with_writer(io::stderr(), format)
    }

    pub fn with_writer<W: Write + Send + 'static>(writer: W, format: AuditFormat) -> Self {
        Self {
            sink: Mutex::new(Box::new(writer)),
            format,
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Log into memory; the returned buffer sees every line.
    pub fn in_memory(format: AuditFormat) -> (Self, AuditBuffer) {
        let buffer = AuditBuffer::default();
        (Self::with_writer(buffer.clone(), format), buffer)
    }

    pub fn log(&self, operation: &str, resource_name: &str, status: StatusCode, request_id: &str) {
        self.record(&AuditRecord::new(operation, resource_name, status, request_id));
    }

    pub fn record(&self, record: &AuditRecord) {
        let mut line = match self.format {
            AuditFormat::Csv => record.to_csv(),
            AuditFormat::Json => {
                let json = JsonLine {
                    common: CommonFields::new(&self.hostname, record.severity()),
                    record,
                };
                serde_json::to_string(&json).unwrap_or_else(|e| {
                    format!("{{\"error\": \"Failed to serialize audit record: {e}\"}}")
                })
            }
        };
        line.push('\n');

        match record.severity() {
            "error" => event!(Level::ERROR, audit = %record.to_csv()),
            "warn" => event!(Level::WARN, audit = %record.to_csv()),
            _ => event!(Level::DEBUG, audit = %record.to_csv()),
        }

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = sink.write_all(line.as_bytes()).and_then(|()| sink.flush()) {
            warn!("Failed to write audit record: {}", e);
        }
    }
}

/// Shared in-memory audit sink.
#[derive(Debug, Clone, Default)]
pub struct AuditBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl AuditBuffer {
    /// All complete lines written so far.
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for AuditBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
