pub mod aggregate;
pub mod collector;
pub mod host;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::collector::{Collector, CollectorSettings};
use crate::config::{Config, MonitorMode};
use crate::export::health::HealthMetrics;
use crate::flow::classify::TrafficFilter;
use crate::sink::http::HttpPusher;
use crate::sink::registry::{FlowMetrics, SeriesContext};
use crate::tracer::{self, FlowTable, HookKind};

/// Agent orchestrates the per-interface collectors, the batch aggregator and
/// the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Attach every configured interface and start collecting.
    pub async fn start(&mut self) -> Result<()> {
        self.start_health().await?;

        let kind = self
            .cfg
            .mode
            .hook_kind()
            .with_context(|| format!("mode {} has no flow hook", self.cfg.mode))?;

        let tables = self.attach_all(kind)?;
        self.start_with_tables(tables)
    }

    async fn start_health(&self) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }
        Ok(())
    }

    /// Attach the hook to each interface.
    ///
    /// With a single interface any failure is fatal. With several, failed
    /// interfaces are skipped as long as at least one attaches.
    fn attach_all(&self, kind: HookKind) -> Result<Vec<Box<dyn FlowTable>>> {
        let multi = self.cfg.is_multi_interface();
        let mut tables = Vec::with_capacity(self.cfg.interfaces.len());

        for iface in &self.cfg.interfaces {
            match tracer::attach(iface, kind, self.cfg.direction, &self.cfg.hook) {
                Ok(table) => tables.push(table),
                Err(e) if multi => {
                    warn!(interface = %iface, error = %e, "skipping interface");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("attaching to interface {iface}"));
                }
            }
        }

        if tables.is_empty() {
            bail!(
                "no interface could be attached (tried {})",
                self.cfg.interfaces.join(", ")
            );
        }

        Ok(tables)
    }

    /// Spawn one collector per table, plus the aggregator when export is enabled.
    pub fn start_with_tables(&mut self, tables: Vec<Box<dyn FlowTable>>) -> Result<()> {
        if tables.is_empty() {
            bail!("no flow tables to collect from");
        }

        let expected = tables.len();
        self.health.interfaces_attached.set(expected as f64);

        let filter = TrafficFilter::resolve(&self.cfg.filter);
        let settings = CollectorSettings {
            filter,
            exclude_dns: self.cfg.exclude_dns,
            console: self.cfg.console,
        };

        let host_ip = host::host_ip();
        let tc_mode = self.cfg.mode == MonitorMode::Tc;
        let direction = tc_mode.then_some(self.cfg.direction);

        let export = if self.cfg.metrics.enabled {
            let metrics = Arc::new(FlowMetrics::new(tc_mode).context("creating flow metrics")?);
            let pusher = HttpPusher::new(&self.cfg.metrics.url, self.cfg.metrics.timeout)?;
            let (done_tx, done_rx) = mpsc::channel(expected * 2);

            info!(
                url = %self.cfg.metrics.url,
                format = pusher.format().as_str(),
                collect_agg = %self.cfg.metrics.collect_agg,
                "metrics export configured",
            );

            self.tasks.push(tokio::spawn(aggregate::run_aggregator(
                done_rx,
                expected,
                Arc::clone(&metrics),
                pusher,
                Arc::clone(&self.health),
                self.cancel.child_token(),
            )));

            Some((metrics, done_tx))
        } else {
            None
        };

        let interval = self.cfg.interval();
        for table in tables {
            let ctx = SeriesContext {
                interface: table.interface().to_string(),
                host_ip: host_ip.clone(),
                collect_agg: self.cfg.metrics.collect_agg.clone(),
                direction,
            };

            let mut collector = Collector::new(table, settings, ctx, Arc::clone(&self.health));
            if let Some((metrics, done_tx)) = &export {
                collector = collector.with_export(Arc::clone(metrics), done_tx.clone());
            }

            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                let result = collector.run(cancel, interval).await;
                if let Err(e) = result {
                    error!(
                        interface = %collector.interface(),
                        error = %e,
                        "releasing flow table",
                    );
                }
            }));
        }

        info!(
            interfaces = expected,
            mode = %self.cfg.mode,
            filter = %filter,
            interval_ms = self.cfg.interval_ms,
            host_ip = %host_ip,
            "agent started",
        );

        Ok(())
    }

    /// Stop every task, waiting for in-flight ticks and hook release.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "agent task panicked");
            }
        }

        self.health.stop();

        info!("agent stopped");
        Ok(())
    }
}
