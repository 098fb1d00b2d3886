use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use xtrace::agent::Agent;
use xtrace::config::{Config, MonitorMode, Overrides};
use xtrace::rdma::RdmaMonitor;
use xtrace::tracer::{iface, Direction};

/// eBPF flow telemetry agent for RoCE, InfiniBand and IP traffic.
#[derive(Parser)]
#[command(name = "xtrace", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Interfaces to monitor, comma separated.
    #[arg(short = 'i', long = "interface", env = "NETWORK_INTERFACE", value_delimiter = ',')]
    interfaces: Vec<String>,

    /// Monitor mode (xdp, tc, rdma).
    #[arg(short, long, env = "MONITOR_MODE")]
    mode: Option<MonitorMode>,

    /// Traffic-control direction (ingress, egress, both).
    #[arg(long, env = "TC_DIRECTION")]
    direction: Option<Direction>,

    /// RDMA device for rdma mode.
    #[arg(short, long, env = "RDMA_DEVICE")]
    device: Option<String>,

    /// Report only one traffic class (roce, roce_v1, roce_v2, tcp, udp, ib).
    #[arg(short, long, env = "TRAFFIC_FILTER")]
    filter: Option<String>,

    /// Hide flows towards well-known public DNS resolvers.
    #[arg(long, env = "EXCLUDE_DNS")]
    exclude_dns: bool,

    /// Collection interval in milliseconds.
    #[arg(long, env = "COLLECT_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Disable per-flow console output.
    #[arg(long)]
    quiet: bool,

    /// Push flow metrics to the remote store.
    #[arg(long = "metrics", env = "METRICS_ENABLED")]
    metrics: bool,

    /// Remote store URL (remote-write when the path contains /api/v1/write).
    #[arg(long, env = "VM_REMOTE_WRITE_URL")]
    metrics_url: Option<String>,

    /// Collection-group tag attached to every series.
    #[arg(long, env = "COLLECT_AGG")]
    collect_agg: Option<String>,

    /// List network interfaces and exit.
    #[arg(long)]
    list: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            interfaces: (!self.interfaces.is_empty()).then(|| self.interfaces.clone()),
            mode: self.mode,
            direction: self.direction,
            device: self.device.clone(),
            filter: self.filter.clone(),
            exclude_dns: self.exclude_dns.then_some(true),
            interval_ms: self.interval_ms,
            console: self.quiet.then_some(false),
            metrics_enabled: self.metrics.then_some(true),
            metrics_url: self.metrics_url.clone(),
            collect_agg: self.collect_agg.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("xtrace {}", version::full());
        return Ok(());
    }

    if cli.list {
        return list_interfaces();
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_overrides(cli.overrides());

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    cfg.finalize().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        mode = %cfg.mode,
        interfaces = ?cfg.interfaces,
        "starting xtrace",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cfg.mode {
            MonitorMode::Rdma => run_rdma(cfg).await,
            MonitorMode::Xdp | MonitorMode::Tc => run(cfg).await,
        }
    })
}

fn list_interfaces() -> Result<()> {
    let interfaces = iface::list_interfaces()?;
    println!("Available network interfaces:");
    for info in interfaces {
        println!("  {:>3}: {} ({})", info.index, info.name, info.state);
    }
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    wait_for_shutdown().await;

    agent.stop().await?;

    tracing::info!("xtrace stopped");

    Ok(())
}

async fn run_rdma(cfg: Config) -> Result<()> {
    let iface = cfg.interfaces.first().context("no interface configured")?;
    let mut monitor = RdmaMonitor::new(&cfg.device, iface)?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        stopper.cancel();
    });

    monitor.run(cancel, cfg.interval()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            None
        }
    };

    let terminate = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
