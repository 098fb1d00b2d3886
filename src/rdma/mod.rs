//! RDMA device monitor.
//!
//! Reports port state from `ibstat` together with the kernel's interface
//! counters. No packet hook is involved.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Port attributes reported by `ibstat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub state: String,
    pub active_width: String,
    pub active_speed: String,
}

/// Interface counters from `/proc/net/dev`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
}

impl InterfaceCounters {
    /// Per-field increase since `prev`. Counters that went backwards yield zero.
    pub fn delta_since(&self, prev: &Self) -> Self {
        Self {
            rx_bytes: self.rx_bytes.saturating_sub(prev.rx_bytes),
            rx_packets: self.rx_packets.saturating_sub(prev.rx_packets),
            rx_errors: self.rx_errors.saturating_sub(prev.rx_errors),
            tx_bytes: self.tx_bytes.saturating_sub(prev.tx_bytes),
            tx_packets: self.tx_packets.saturating_sub(prev.tx_packets),
            tx_errors: self.tx_errors.saturating_sub(prev.tx_errors),
        }
    }

    /// Combined rx+tx throughput in MiB/s over `elapsed`.
    pub fn bandwidth_mib_per_sec(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.rx_bytes.saturating_add(self.tx_bytes) as f64 / secs / (1024.0 * 1024.0)
    }
}

/// Extract port state, width and speed from `ibstat <device>` output.
pub fn parse_ibstat(text: &str) -> PortInfo {
    let mut info = PortInfo::default();
    for line in text.lines() {
        let Some((name, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim() {
            "State" => info.state = value,
            "Active width" => info.active_width = value,
            "Active speed" => info.active_speed = value,
            _ => {}
        }
    }
    info
}

/// Counters for `iface` from `/proc/net/dev` content. `None` if the
/// interface is absent or its line is malformed.
pub fn parse_proc_net_dev(text: &str, iface: &str) -> Option<InterfaceCounters> {
    text.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != iface {
            return None;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() < 11 {
            return None;
        }
        Some(InterfaceCounters {
            rx_bytes: fields[0],
            rx_packets: fields[1],
            rx_errors: fields[2],
            tx_bytes: fields[8],
            tx_packets: fields[9],
            tx_errors: fields[10],
        })
    })
}

/// Locate an executable by name on `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Periodic ibstat + interface counter reporter.
pub struct RdmaMonitor {
    device: String,
    iface: String,
    ibstat: PathBuf,
    proc_net_dev: PathBuf,
    started: Instant,
    last: Option<(InterfaceCounters, Instant)>,
}

impl RdmaMonitor {
    /// Fails when `ibstat` is not installed.
    pub fn new(device: &str, iface: &str) -> Result<Self> {
        let Some(ibstat) = find_on_path("ibstat") else {
            bail!("ibstat not found on PATH, install infiniband-diags to use rdma mode");
        };

        Ok(Self {
            device: device.to_string(),
            iface: iface.to_string(),
            ibstat,
            proc_net_dev: PathBuf::from(PROC_NET_DEV),
            started: Instant::now(),
            last: None,
        })
    }

    async fn port_info(&self) -> Result<PortInfo> {
        let output = tokio::process::Command::new(&self.ibstat)
            .arg(&self.device)
            .output()
            .await
            .with_context(|| format!("running {}", self.ibstat.display()))?;

        if !output.status.success() {
            bail!(
                "ibstat {} exited with {}: {}",
                self.device,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_ibstat(&String::from_utf8_lossy(&output.stdout)))
    }

    fn counters(&self) -> Result<InterfaceCounters> {
        read_counters(&self.proc_net_dev, &self.iface)
    }

    /// Take one sample and render the report block.
    pub async fn sample(&mut self) -> Result<String> {
        let port = self.port_info().await?;
        let now = Instant::now();

        let counters = match self.counters() {
            Ok(c) => c,
            Err(e) => {
                warn!(interface = %self.iface, error = %e, "reading interface counters");
                self.last.map(|(c, _)| c).unwrap_or_default()
            }
        };

        let previous = self
            .last
            .map(|(prev, at)| (counters.delta_since(&prev), now.saturating_duration_since(at)));
        self.last = Some((counters, now));

        Ok(render_report(
            &self.device,
            &self.iface,
            now.saturating_duration_since(self.started),
            &port,
            &counters,
            previous,
        ))
    }

    /// Print a report every `interval` until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            device = %self.device,
            interface = %self.iface,
            interval_ms = interval.as_millis() as u64,
            "rdma monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sample().await {
                    Ok(report) => println!("{report}---"),
                    Err(e) => warn!(device = %self.device, error = %e, "rdma sample failed"),
                },
            }
        }

        info!(device = %self.device, "rdma monitor stopped");
        Ok(())
    }
}

fn read_counters(path: &Path, iface: &str) -> Result<InterfaceCounters> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_proc_net_dev(&text, iface)
        .with_context(|| format!("interface {iface} not listed in {}", path.display()))
}

/// Human-readable status block. `previous` carries the delta since the last
/// sample and the time it covers.
pub fn render_report(
    device: &str,
    iface: &str,
    uptime: Duration,
    port: &PortInfo,
    counters: &InterfaceCounters,
    previous: Option<(InterfaceCounters, Duration)>,
) -> String {
    let mut out = String::with_capacity(512);
    let _ = writeln!(out, "=== RDMA monitor ===");
    let _ = writeln!(out, "device: {device}");
    let _ = writeln!(out, "interface: {iface}");
    let _ = writeln!(out, "uptime: {:.2} s", uptime.as_secs_f64());
    let _ = writeln!(out);
    let _ = writeln!(out, "port:");
    let _ = writeln!(out, "  state: {}", port.state);
    let _ = writeln!(out, "  active width: {}", port.active_width);
    let _ = writeln!(out, "  active speed: {}", port.active_speed);
    let _ = writeln!(out);
    let _ = writeln!(out, "tx:");
    let _ = writeln!(out, "  bytes: {}", counters.tx_bytes);
    let _ = writeln!(out, "  packets: {}", counters.tx_packets);
    let _ = writeln!(out, "  errors: {}", counters.tx_errors);
    let _ = writeln!(out);
    let _ = writeln!(out, "rx:");
    let _ = writeln!(out, "  bytes: {}", counters.rx_bytes);
    let _ = writeln!(out, "  packets: {}", counters.rx_packets);
    let _ = writeln!(out, "  errors: {}", counters.rx_errors);

    if let Some((delta, elapsed)) = previous {
        let _ = writeln!(out);
        let _ = writeln!(out, "delta (last {:.2} s):", elapsed.as_secs_f64());
        let _ = writeln!(
            out,
            "  tx: {} bytes, {} packets",
            delta.tx_bytes, delta.tx_packets
        );
        let _ = writeln!(
            out,
            "  rx: {} bytes, {} packets",
            delta.rx_bytes, delta.rx_packets
        );
        let _ = writeln!(
            out,
            "  bandwidth: {:.2} MB/s",
            delta.bandwidth_mib_per_sec(elapsed)
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const IBSTAT: &str = "CA 'mlx5_0'
\tCA type: MT4123
\tNumber of ports: 1
\tPort 1:
\t\tState: Active
\t\tPhysical state: LinkUp
\t\tRate: 200
\t\tActive width: 4X
\t\tActive speed: HDR
\t\tLink layer: InfiniBand
";

    const PROC_NET_DEV: &str = "Inter-|   Receive                                                |  Transmit
 face |bytes    bytes packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000 10 0 0 0 0 0 0 1000 10 0 0 0 0 0 0
ibs8f0: 5242880 4000 2 0 0 0 0 0 10485760 8000 1 0 0 0 0 0
";

    #[test]
    fn test_parse_ibstat() {
        let port = parse_ibstat(IBSTAT);
        assert_eq!(port.state, "Active");
        assert_eq!(port.active_width, "4X");
        assert_eq!(port.active_speed, "HDR");
    }

    #[test]
    fn test_parse_ibstat_empty() {
        assert_eq!(parse_ibstat(""), PortInfo::default());
    }

    #[test]
    fn test_parse_proc_net_dev() {
        let c = parse_proc_net_dev(PROC_NET_DEV, "ibs8f0").expect("listed");
        assert_eq!(
            c,
            InterfaceCounters {
                rx_bytes: 5_242_880,
                rx_packets: 4_000,
                rx_errors: 2,
                tx_bytes: 10_485_760,
                tx_packets: 8_000,
                tx_errors: 1,
            }
        );
        assert_eq!(parse_proc_net_dev(PROC_NET_DEV, "lo").expect("lo").rx_bytes, 1_000);
        assert!(parse_proc_net_dev(PROC_NET_DEV, "ibs8f").is_none());
        assert!(parse_proc_net_dev(PROC_NET_DEV, "eth0").is_none());
    }

    #[test]
    fn test_parse_proc_net_dev_glued_name() {
        let text = "eth0:123 1 0 0 0 0 0 0 456 2 0 0 0 0 0 0\n";
        let c = parse_proc_net_dev(text, "eth0").expect("listed");
        assert_eq!(c.rx_bytes, 123);
        assert_eq!(c.tx_bytes, 456);
    }

    #[test]
    fn test_delta_saturates() {
        let prev = InterfaceCounters {
            rx_bytes: 100,
            tx_bytes: 500,
            ..Default::default()
        };
        let cur = InterfaceCounters {
            rx_bytes: 50,
            tx_bytes: 700,
            ..Default::default()
        };
        let d = cur.delta_since(&prev);
        assert_eq!(d.rx_bytes, 0);
        assert_eq!(d.tx_bytes, 200);
    }

    #[test]
    fn test_bandwidth() {
        let d = InterfaceCounters {
            rx_bytes: 5 * 1024 * 1024,
            tx_bytes: 5 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(d.bandwidth_mib_per_sec(Duration::from_secs(5)), 2.0);
        assert_eq!(d.bandwidth_mib_per_sec(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_render_report_with_delta() {
        let counters = parse_proc_net_dev(PROC_NET_DEV, "ibs8f0").expect("listed");
        let delta = InterfaceCounters {
            rx_bytes: 5 * 1024 * 1024,
            tx_bytes: 5 * 1024 * 1024,
            rx_packets: 10,
            tx_packets: 20,
            ..Default::default()
        };
        let report = render_report(
            "mlx5_0",
            "ibs8f0",
            Duration::from_secs(12),
            &parse_ibstat(IBSTAT),
            &counters,
            Some((delta, Duration::from_secs(5))),
        );
        assert!(report.contains("device: mlx5_0"));
        assert!(report.contains("  state: Active"));
        assert!(report.contains("  tx: 5242880 bytes, 20 packets"));
        assert!(report.contains("  bandwidth: 2.00 MB/s"));
    }

    #[test]
    fn test_render_report_first_sample_has_no_delta() {
        let report = render_report(
            "mlx5_0",
            "ibs8f0",
            Duration::ZERO,
            &PortInfo::default(),
            &InterfaceCounters::default(),
            None,
        );
        assert!(!report.contains("delta"));
    }

    #[test]
    fn test_find_on_path_missing() {
        assert!(find_on_path("xtrace-no-such-binary").is_none());
    }
}
