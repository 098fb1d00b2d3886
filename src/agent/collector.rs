use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregate::signal_completion;
use crate::export::health::HealthMetrics;
use crate::flow::classify::{classify, is_excluded_dns, Category, TrafficFilter};
use crate::flow::nic::{NicKey, NicRates};
use crate::flow::{compute_rate, FlowDelta, FlowRate, FlowTracker};
use crate::sink::registry::{FlowMetrics, SeriesContext};
use crate::tracer::event::{FlowKey, FlowRecord};
use crate::tracer::FlowTable;

/// Lifecycle of one interface collection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Attaching,
    Running,
    Draining,
    Stopped,
}

impl CollectorState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attaching => "attaching",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reporting options shared by all collection tasks.
#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub filter: TrafficFilter,
    pub exclude_dns: bool,
    pub console: bool,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records returned by the table, placeholders included.
    pub polled: usize,
    /// Records that passed classification filtering and DNS exclusion.
    pub reported: usize,
    /// Console lines written.
    pub printed: usize,
    /// Keys dropped from the last-seen state.
    pub pruned: usize,
    pub poll_failed: bool,
}

/// Polls one interface's flow table on a fixed period.
pub struct Collector {
    table: Box<dyn FlowTable>,
    tracker: FlowTracker,
    settings: CollectorSettings,
    ctx: SeriesContext,
    health: Arc<HealthMetrics>,
    metrics: Option<Arc<FlowMetrics>>,
    done_tx: Option<mpsc::Sender<()>>,
    state: CollectorState,
    records: Vec<FlowRecord>,
    nic: NicRates,
}

impl Collector {
    pub fn new(
        table: Box<dyn FlowTable>,
        settings: CollectorSettings,
        ctx: SeriesContext,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            table,
            tracker: FlowTracker::new(Instant::now()),
            settings,
            ctx,
            health,
            metrics: None,
            done_tx: None,
            state: CollectorState::Attaching,
            records: Vec::with_capacity(1024),
            nic: NicRates::new(),
        }
    }

    /// Record into `metrics` and signal `done_tx` after every tick.
    pub fn with_export(mut self, metrics: Arc<FlowMetrics>, done_tx: mpsc::Sender<()>) -> Self {
        self.metrics = Some(metrics);
        self.done_tx = Some(done_tx);
        self
    }

    pub fn interface(&self) -> &str {
        &self.ctx.interface
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn tracked_flows(&self) -> usize {
        self.tracker.len()
    }

    /// Enter `Running`. The first interval is measured from `now`.
    pub fn mark_running(&mut self, now: Instant) {
        self.tracker = FlowTracker::new(now);
        self.state = CollectorState::Running;
    }

    /// Run one poll, delta, report and prune cycle.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let elapsed = self.tracker.begin_tick(now);
        let mut report = TickReport::default();

        let mut records = std::mem::take(&mut self.records);
        records.clear();
        if let Err(e) = self.table.poll(&mut records) {
            warn!(
                interface = %self.ctx.interface,
                error = %e,
                partial = records.len(),
                "flow table poll failed",
            );
            self.health
                .poll_errors_total
                .with_label_values(&[self.ctx.interface.as_str()])
                .inc();
            report.poll_failed = true;
        }
        report.polled = records.len();

        self.nic.clear();
        for record in &records {
            // Every polled key updates the state, filtered or not.
            let delta = self.tracker.observe(record.key, record.stats);

            if record.key.is_placeholder() {
                debug!(
                    interface = %self.ctx.interface,
                    proto = record.key.proto,
                    first_u16 = record.key.first_u16,
                    pkt_len_low = record.key.pkt_len_low,
                    avg_len = record.stats.avg_packet_len(),
                    packets = record.stats.packets,
                    "zero-address flow record",
                );
                continue;
            }

            let key = &record.key;
            let category = classify(key.proto, key.src_port, key.dst_port);
            if !self.settings.filter.accepts(category) {
                continue;
            }
            if self.settings.exclude_dns && is_excluded_dns(key.dst_addr()) {
                continue;
            }
            report.reported += 1;

            let rate = compute_rate(delta.bytes, elapsed);

            if let Some(metrics) = &self.metrics {
                metrics.record_flow(&self.ctx, key, category, delta, rate);
                self.nic.add(
                    NicKey {
                        src: key.src_addr(),
                        dst: key.dst_addr(),
                        proto: key.proto,
                    },
                    rate,
                    category,
                );
            }

            if self.settings.console && delta.packets > 0 {
                println!(
                    "{}",
                    format_flow_line(&self.ctx.interface, key, category, delta, rate, &self.ctx.host_ip)
                );
                report.printed += 1;
            }
        }
        self.records = records;

        if let Some(metrics) = &self.metrics {
            if !self.nic.is_empty() {
                metrics.record_nic(&self.ctx, &self.nic);
            }
        }

        report.pruned = self.tracker.end_tick();

        let iface = self.ctx.interface.as_str();
        self.health.ticks_total.with_label_values(&[iface]).inc();
        self.health
            .tracked_flows
            .with_label_values(&[iface])
            .set(self.tracker.len() as f64);

        if let Some(tx) = &self.done_tx {
            signal_completion(tx, iface, &self.health);
        }

        report
    }

    /// Tick every `interval` until cancelled, then release the table.
    pub async fn run(&mut self, cancel: CancellationToken, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.mark_running(Instant::now());
        info!(
            interface = %self.ctx.interface,
            interval_ms = interval.as_millis() as u64,
            "collector started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Rates divide by the measured gap, not the scheduled one.
                    let report = self.tick(Instant::now());
                    debug!(
                        interface = %self.ctx.interface,
                        polled = report.polled,
                        reported = report.reported,
                        pruned = report.pruned,
                        "tick complete",
                    );
                }
            }
        }

        self.state = CollectorState::Draining;
        let result = self.table.release();
        self.state = CollectorState::Stopped;

        info!(interface = %self.ctx.interface, "collector stopped");
        result
    }
}

/// Console line for one flow's interval activity.
pub fn format_flow_line(
    iface: &str,
    key: &FlowKey,
    category: Category,
    delta: FlowDelta,
    rate: FlowRate,
    host_ip: &str,
) -> String {
    format!(
        "[{iface}] {key} proto={} {} packets={} bytes={} ({:.2} MB/s, {:.2} Mbps) host_ip={host_ip}",
        key.proto,
        category.console_tag(),
        delta.packets,
        delta.bytes,
        rate.mib_per_sec(),
        rate.mbps(),
    )
}
