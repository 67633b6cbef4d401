//! `gatewayd` entrypoint: config loading, logging setup, and the daemon loop.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gateway::GatewayConfig;
use proto::ConfigError;

#[cfg(not(test))]
use gateway::Gateway;
#[cfg(not(test))]
use tracing::info;
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for `gatewayd`.
#[derive(Parser)]
#[command(name = "gatewayd")]
#[command(about = "Multi-transport RPC gateway", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write debug logs to a daily rotated file
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Directory for debug log files (default ~/.gateway/logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Supported subcommands.
#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start the gateway (default)
    Start {
        /// PID file path (default ~/.gateway/gatewayd.pid)
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Validate the config and print the resolved listeners
    Check,
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or(Commands::Start { pid_file: None });

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let log_dir = cli
            .log_dir
            .clone()
            .unwrap_or_else(|| config::home_dir().join("logs"));
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "gatewayd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug,hyper=info,hyper_util=info,rustls=info"));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();
        info!(log_dir = %log_dir.display(), "Debug file logging enabled");
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    let config = config::load(cli.config.as_deref())?;

    match command {
        Commands::Start { pid_file } => cmd_start(config, pid_file).await,
        Commands::Check => cmd_check(&config),
    }
}

#[cfg(not(test))]
async fn cmd_start(config: GatewayConfig, pid_file: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting gatewayd");

    let gateway = Gateway::new(config)?;
    let running = gateway.start().await?;
    info!(tasks = running.task_count(), "Listeners running");

    let pid_file = daemon::PidFile::new(pid_file.unwrap_or_else(daemon::PidFile::default_path));
    pid_file.write().await?;

    daemon::wait_for_shutdown().await;
    gateway.outer().close();
    if let Some(inner) = gateway.inner() {
        inner.close();
    }

    pid_file.remove().await;
    info!("gatewayd stopped");
    Ok(())
}

#[cfg(not(test))]
fn cmd_check(config: &GatewayConfig) -> anyhow::Result<()> {
    for line in check_summary(config)? {
        println!("{line}");
    }
    Ok(())
}

/// Validates `config` and describes every enabled listener.
fn check_summary(config: &GatewayConfig) -> Result<Vec<String>, ConfigError> {
    config.check()?;

    let mut lines = Vec::new();
    if config.enable_socket {
        let peer = config.outer_socket.peer_config()?;
        lines.push(format!(
            "socket     {}{}",
            peer.listen,
            tls_suffix(peer.tls.is_some())
        ));
    }
    if config.enable_http {
        let ep = config.outer_http.endpoint()?;
        lines.push(format!("http       {}{}", ep.addr, tls_suffix(ep.tls.is_some())));
    }
    if config.enable_websocket {
        let ep = config.outer_websocket.endpoint()?;
        lines.push(format!(
            "websocket  {}{} path={}",
            ep.addr,
            tls_suffix(ep.tls.is_some()),
            config.outer_websocket.upgrade_path()
        ));
    }
    if config.enable_inner {
        let peer = config.inner_socket.peer_config()?;
        lines.push(format!(
            "inner      {}{}",
            peer.listen,
            tls_suffix(peer.tls.is_some())
        ));
    }
    lines.push(format!(
        "discovery  {} static service(s), lease {}",
        config.discovery.services.len(),
        lease_label(config)
    ));
    Ok(lines)
}

fn tls_suffix(tls: bool) -> &'static str {
    if tls { " (tls)" } else { "" }
}

fn lease_label(config: &GatewayConfig) -> String {
    let ttl = config.discovery.lease_ttl;
    if ttl.is_zero() {
        "none".to_string()
    } else {
        format!("{}s", ttl.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_defaults_to_start() {
        let cli = Cli::try_parse_from(["gatewayd"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
        assert!(!cli.debug);
    }

    #[test]
    fn start_accepts_pid_file_and_global_flags() {
        let cli = Cli::try_parse_from([
            "gatewayd",
            "--config",
            "/etc/gateway.toml",
            "-l",
            "debug",
            "--debug",
            "start",
            "--pid-file",
            "/tmp/gw.pid",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/gateway.toml")));
        assert_eq!(cli.log_level, "debug");
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Some(Commands::Start {
                pid_file: Some(PathBuf::from("/tmp/gw.pid"))
            })
        );
    }

    #[test]
    fn check_subcommand_parses() {
        let cli = Cli::try_parse_from(["gatewayd", "check"]).expect("parse");
        assert_eq!(cli.command, Some(Commands::Check));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["gatewayd", "serve"]).is_err());
    }

    #[test]
    fn check_summary_lists_enabled_listeners() {
        let mut config = GatewayConfig::default();
        config.enable_websocket = true;
        config.outer_websocket.path = "ws".into();

        let lines = check_summary(&config).expect("valid config");
        assert!(lines.iter().any(|l| l.starts_with("socket") && l.contains("0.0.0.0:9090")));
        assert!(lines.iter().any(|l| l.starts_with("http") && l.contains("0.0.0.0:5000")));
        assert!(lines.iter().any(|l| l.contains("path=/ws")));
        assert!(!lines.iter().any(|l| l.starts_with("inner")));
        assert!(lines.last().expect("discovery line").contains("lease 30s"));
    }

    #[test]
    fn check_summary_reports_address_conflicts() {
        let mut config = GatewayConfig::default();
        config.outer_http.listen_address = "0.0.0.0:9090".into();
        let err = check_summary(&config).expect_err("conflict");
        assert!(err.to_string().contains("outer_http"));
    }
}
