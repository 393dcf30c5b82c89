//! Burrow HTTPD server binary
//!
//! Run with: cargo run --bin burrow-httpd -- 8080 -t 8

use anyhow::Context;
use burrow_httpd::config::{LoggingConfig, load_config, validate_config, write_config};
use burrow_httpd::{AuditLogger, HttpServer, HttpdConfig, LogFormat};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "burrow-httpd",
    version,
    about = "Multi-threaded file server speaking a subset of HTTP/1.1"
)]
struct Cli {
    /// TCP port to listen on
    #[arg(required_unless_present_any = ["init_config", "check_config"])]
    port: Option<u16>,

    /// Number of worker threads [default: 4]
    #[arg(short = 't', long, value_parser = parse_positive)]
    threads: Option<usize>,

    /// Path to the TOML configuration file, loaded when it exists
    #[arg(long, default_value = "burrow-httpd.toml")]
    config: PathBuf,

    /// Write the effective configuration to --config and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Directory to serve and store resources in
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Address to bind the listener to
    #[arg(long)]
    bind: Option<IpAddr>,
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("`{value}` is not a positive integer")),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("Fatal: {:#}", e);
        eprintln!("burrow-httpd: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        HttpdConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(ip) = cli.bind {
        config.bind_addr = SocketAddr::new(ip, config.bind_addr.port());
    }
    if let Some(port) = cli.port {
        config.bind_addr.set_port(port);
    }
    if let Some(threads) = cli.threads {
        config.workers = threads;
    }

    if cli.init_config {
        write_config(&cli.config, &config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config)?;

    let _log_guard = init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        root_dir = %config.root_dir.display(),
        bind_addr = %config.bind_addr,
        workers = config.workers,
        "Starting burrow-httpd"
    );

    let audit = AuditLogger::stderr(config.logging.audit_format);
    let server = HttpServer::bind(&config, audit)
        .with_context(|| format!("starting server on {}", config.bind_addr))?;
    server.run()?;
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::new(logging.level.clone());

    let Some(ref log_file) = logging.file else {
        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
        return Ok(None);
    };

    let dir = match log_file.parent() {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => std::path::Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .context("logging.file must include a file name")?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init(),
    }

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_and_threads() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::try_parse_from(["burrow-httpd", "8081", "-t", "8"])?;
        assert_eq!(cli.port, Some(8081));
        assert_eq!(cli.threads, Some(8));
        Ok(())
    }

    #[test]
    fn requires_a_port() {
        assert!(Cli::try_parse_from(["burrow-httpd"]).is_err());
        assert!(Cli::try_parse_from(["burrow-httpd", "--check-config"]).is_ok());
    }

    #[test]
    fn rejects_non_positive_threads() {
        for bad in ["0", "-3", "many"] {
            assert!(
                Cli::try_parse_from(["burrow-httpd", "8080", "--threads", bad]).is_err(),
                "accepted --threads {bad}"
            );
        }
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Cli::try_parse_from(["burrow-httpd", "70000"]).is_err());
        assert!(Cli::try_parse_from(["burrow-httpd", "http"]).is_err());
    }
}
