use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tracer::{Direction, HookKind};

/// Lower bound for the collection interval.
pub const MIN_INTERVAL_MS: u64 = 100;

/// Upper bound for the collection interval (one hour).
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// What the agent monitors and how.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    /// Ingress flows via the XDP hook.
    #[default]
    Xdp,
    /// Flows via the clsact traffic-control hook.
    Tc,
    /// Link state and counters of an RDMA device, no packet hook.
    Rdma,
}

impl MonitorMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xdp => "xdp",
            Self::Tc => "tc",
            Self::Rdma => "rdma",
        }
    }

    /// Hook kind used for flow collection. `None` in RDMA mode.
    pub const fn hook_kind(self) -> Option<HookKind> {
        match self {
            Self::Xdp => Some(HookKind::Xdp),
            Self::Tc => Some(HookKind::Tc),
            Self::Rdma => None,
        }
    }

    fn default_interface(self) -> &'static str {
        match self {
            Self::Rdma => "ibs8f0",
            _ => "eth0",
        }
    }
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xdp" => Ok(Self::Xdp),
            "tc" => Ok(Self::Tc),
            "rdma" => Ok(Self::Rdma),
            other => Err(format!("invalid mode: {other} (expected xdp, tc, rdma)")),
        }
    }
}

/// Top-level configuration for the xtrace agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Interfaces to monitor. Empty selects the mode's default interface.
    #[serde(default)]
    pub interfaces: Vec<String>,

    #[serde(default)]
    pub mode: MonitorMode,

    /// Traffic-control direction. Anything other than ingress forces TC.
    #[serde(default)]
    pub direction: Direction,

    /// RDMA device queried in rdma mode. Default: "mlx5_0".
    #[serde(default = "default_device")]
    pub device: String,

    /// Reporting filter name, empty for all traffic.
    #[serde(default)]
    pub filter: String,

    /// Suppress flows towards well-known public DNS resolvers.
    #[serde(default)]
    pub exclude_dns: bool,

    /// Collection period in milliseconds. Default: 5000.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Print one line per active flow every tick. Default: true.
    #[serde(default = "default_true")]
    pub console: bool,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub hook: HookConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

/// Remote metrics export.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Push URL. Paths containing `/api/v1/write` use remote-write, others text.
    #[serde(default)]
    pub url: String,

    /// Free-text collection-group tag attached to every series.
    #[serde(default)]
    pub collect_agg: String,

    /// HTTP request timeout. Default: 10s.
    #[serde(default = "default_metrics_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Location of the precompiled hook objects.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default = "default_xdp_object")]
    pub xdp_object: PathBuf,

    #[serde(default = "default_xdp_program")]
    pub xdp_program: String,

    #[serde(default = "default_tc_object")]
    pub tc_object: PathBuf,

    #[serde(default = "default_tc_program")]
    pub tc_program: String,

    /// Flow table name inside either object.
    #[serde(default = "default_map")]
    pub map: String,
}

impl HookConfig {
    /// Object file and program name for `kind`.
    pub fn program(&self, kind: HookKind) -> (&Path, &str) {
        match kind {
            HookKind::Xdp => (&self.xdp_object, &self.xdp_program),
            HookKind::Tc => (&self.tc_object, &self.tc_program),
        }
    }
}

/// Self-observability server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Values taken from the command line or environment, applied over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub interfaces: Option<Vec<String>>,
    pub mode: Option<MonitorMode>,
    pub direction: Option<Direction>,
    pub device: Option<String>,
    pub filter: Option<String>,
    pub exclude_dns: Option<bool>,
    pub interval_ms: Option<u64>,
    pub console: Option<bool>,
    pub metrics_enabled: Option<bool>,
    pub metrics_url: Option<String>,
    pub collect_agg: Option<String>,
    pub log_level: Option<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device() -> String {
    "mlx5_0".to_string()
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_xdp_object() -> PathBuf {
    PathBuf::from("xdp_monitor.o")
}

fn default_xdp_program() -> String {
    "xdp_monitor".to_string()
}

fn default_tc_object() -> PathBuf {
    PathBuf::from("tc_monitor.o")
}

fn default_tc_program() -> String {
    "tc_egress_monitor".to_string()
}

fn default_map() -> String {
    "flows".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interfaces: Vec::new(),
            mode: MonitorMode::default(),
            direction: Direction::default(),
            device: default_device(),
            filter: String::new(),
            exclude_dns: false,
            interval_ms: default_interval_ms(),
            console: true,
            metrics: MetricsConfig::default(),
            hook: HookConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            collect_agg: String::new(),
            timeout: default_metrics_timeout(),
        }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            xdp_object: default_xdp_object(),
            xdp_program: default_xdp_program(),
            tc_object: default_tc_object(),
            tc_program: default_tc_program(),
            map: default_map(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Resolution, validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Overrides and validation are
    /// applied separately by [`finalize`](Self::finalize).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Replace file values with any value set on the command line or in the environment.
    pub fn apply_overrides(&mut self, o: Overrides) {
        if let Some(v) = o.interfaces {
            self.interfaces = v;
        }
        if let Some(v) = o.mode {
            self.mode = v;
        }
        if let Some(v) = o.direction {
            self.direction = v;
        }
        if let Some(v) = o.device {
            self.device = v;
        }
        if let Some(v) = o.filter {
            self.filter = v;
        }
        if let Some(v) = o.exclude_dns {
            self.exclude_dns = v;
        }
        if let Some(v) = o.interval_ms {
            self.interval_ms = v;
        }
        if let Some(v) = o.console {
            self.console = v;
        }
        if let Some(v) = o.metrics_enabled {
            self.metrics.enabled = v;
        }
        if let Some(v) = o.metrics_url {
            self.metrics.url = v;
        }
        if let Some(v) = o.collect_agg {
            self.metrics.collect_agg = v;
        }
        if let Some(v) = o.log_level {
            self.log_level = v;
        }
    }

    /// Fill mode-dependent defaults, resolve the hook kind and validate.
    pub fn finalize(&mut self) -> Result<()> {
        self.interfaces = self
            .interfaces
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        if self.interfaces.is_empty() {
            self.interfaces
                .push(self.mode.default_interface().to_string());
        }

        if self.mode == MonitorMode::Xdp && self.direction != Direction::Ingress {
            tracing::info!(
                direction = %self.direction,
                "XDP only sees ingress traffic, using the traffic-control hook",
            );
            self.mode = MonitorMode::Tc;
        }

        self.validate()
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            bail!("at least one interface is required");
        }

        if self.interfaces.iter().any(|name| name.is_empty()) {
            bail!("interface names must not be empty");
        }

        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&self.interval_ms) {
            bail!(
                "interval_ms must be between {MIN_INTERVAL_MS} and {MAX_INTERVAL_MS}, got {}",
                self.interval_ms
            );
        }

        if self.mode == MonitorMode::Rdma && self.device.is_empty() {
            bail!("device is required in rdma mode");
        }

        if self.metrics.enabled {
            if self.metrics.url.is_empty() {
                bail!("metrics.url is required when metrics are enabled");
            }
            if !self.metrics.url.starts_with("http://") && !self.metrics.url.starts_with("https://")
            {
                bail!("metrics.url must be an http(s) URL: {}", self.metrics.url);
            }
            if self.metrics.timeout.is_zero() {
                bail!("metrics.timeout must be positive");
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }

    /// Collection period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether more than one interface is monitored.
    pub fn is_multi_interface(&self) -> bool {
        self.interfaces.len() > 1
    }
}
