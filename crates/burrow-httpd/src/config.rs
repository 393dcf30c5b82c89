use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HttpdError, Result};
use crate::protocol::DEFAULT_MAX_HEAD_BYTES;

/// Smallest request-head limit that still fits a request line and one header.
pub const MIN_HEADER_BYTES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpdConfig {
    /// Directory resource names are resolved against; also holds the gate marker
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Worker thread count, which is also the work queue capacity
    pub workers: usize,
    pub logging: LoggingConfig,
    pub connection: ConnectionConfig,
    pub performance: PerformanceConfig,
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 8080),
            workers: 4,
            logging: LoggingConfig::default(),
            connection: ConnectionConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Diagnostic log file; stdout when unset
    pub file: Option<PathBuf>,
    /// Layout of the audit lines written to stderr
    pub audit_format: AuditFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_format: AuditFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per log event
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    /// `OP,/name,status,id`
    Csv,
    /// The same four fields plus timestamp, hostname and service
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound on the request line plus headers
    pub max_header_bytes: usize,
    /// Read timeout applied to accepted sockets; none blocks indefinitely
    pub read_timeout_secs: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEAD_BYTES,
            read_timeout_secs: None,
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Use sendfile(2) for reads (Linux only)
    pub use_sendfile: bool,
    /// Set SO_REUSEADDR on the listening socket
    pub reuse_address: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let default_sendfile = true;

        #[cfg(not(target_os = "linux"))]
        let default_sendfile = false;

        Self {
            use_sendfile: default_sendfile,
            reuse_address: true,
        }
    }
}

pub fn load_config(path: &Path) -> Result<HttpdConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: HttpdConfig = toml::from_str(&contents).map_err(|e| {
        HttpdError::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &HttpdConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| HttpdError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check a merged configuration before anything is bound or created.
pub fn validate_config(config: &HttpdConfig) -> Result<()> {
    if config.workers == 0 {
        return Err(HttpdError::Config("workers must be a positive integer".to_string()));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(HttpdError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HttpdError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(HttpdError::Io(e)),
    }

    if config.connection.max_header_bytes < MIN_HEADER_BYTES {
        return Err(HttpdError::Config(format!(
            "connection.max_header_bytes must be at least {}",
            MIN_HEADER_BYTES
        )));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = match log_file.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => {
                return Err(HttpdError::Config("logging.file must name a file".to_string()));
            }
        };
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(HttpdError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(HttpdError::Config(format!("logging.file parent error: {}", e)));
            }
        }
        if log_file.file_name().is_none() {
            return Err(HttpdError::Config("logging.file must name a file".to_string()));
        }
    }

    Ok(())
}
