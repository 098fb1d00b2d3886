use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Opts, Registry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::sink::remote_write::encode_text;

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const NAMESPACE: &str = "xtrace_agent";

/// Prometheus metrics describing the agent itself.
///
/// Recorded unconditionally; only served when the health server is started.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Collection ticks completed per interface.
    pub ticks_total: CounterVec,
    /// Flow table iteration failures per interface.
    pub poll_errors_total: CounterVec,
    /// Keys held in the last-seen state per interface.
    pub tracked_flows: GaugeVec,
    /// Successful metric pushes.
    pub export_success: Counter,
    /// Failed metric pushes.
    pub export_errors: Counter,
    /// Completion signals dropped because the channel stayed full.
    pub signals_dropped: Counter,
    /// Interfaces with an attached hook.
    pub interfaces_attached: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ticks_total = CounterVec::new(
            Opts::new("ticks_total", "Collection ticks completed.").namespace(NAMESPACE),
            &["interface"],
        )?;
        let poll_errors_total = CounterVec::new(
            Opts::new("poll_errors_total", "Flow table iteration failures.").namespace(NAMESPACE),
            &["interface"],
        )?;
        let tracked_flows = GaugeVec::new(
            Opts::new("tracked_flows", "Flows held in the last-seen state.").namespace(NAMESPACE),
            &["interface"],
        )?;
        let export_success = Counter::with_opts(
            Opts::new("export_success_total", "Successful metric pushes.").namespace(NAMESPACE),
        )?;
        let export_errors = Counter::with_opts(
            Opts::new("export_errors_total", "Failed metric pushes.").namespace(NAMESPACE),
        )?;
        let signals_dropped = Counter::with_opts(
            Opts::new(
                "signals_dropped_total",
                "Round completion signals dropped on a full channel.",
            )
            .namespace(NAMESPACE),
        )?;
        let interfaces_attached = Gauge::with_opts(
            Opts::new("interfaces_attached", "Interfaces with an attached hook.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(poll_errors_total.clone()))?;
        registry.register(Box::new(tracked_flows.clone()))?;
        registry.register(Box::new(export_success.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(signals_dropped.clone()))?;
        registry.register(Box::new(interfaces_attached.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ticks_total,
            poll_errors_total,
            tracked_flows,
            export_success,
            export_errors,
            signals_dropped,
            interfaces_attached,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve `/metrics` and `/healthz` until [`stop`](Self::stop). Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(ServerState {
                registry: self.registry.clone(),
                interfaces_attached: self.interfaces_attached.clone(),
            }));

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        info!(addr = %local_addr, "health server listening");
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "health server exited");
            }
        });

        Ok(local_addr)
    }

    /// No-op unless the server is running.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Empty means `:9090`; a leading `:` binds every address.
fn bind_address(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:9090".to_string(),
        port if port.starts_with(':') => format!("0.0.0.0{port}"),
        full => full.to_string(),
    }
}

struct ServerState {
    registry: Registry,
    interfaces_attached: Gauge,
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Response {
    match encode_text(&state.registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "encoding agent metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Healthy once at least one interface is being collected.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, &'static str) {
    if state.interfaces_attached.get() > 0.0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no interfaces attached")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_namespaced() {
        let health = HealthMetrics::new(":0").expect("health");
        health.ticks_total.with_label_values(&["eth0"]).inc();
        health.export_errors.inc();
        health.interfaces_attached.set(2.0);

        let names: Vec<String> = health
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"xtrace_agent_ticks_total".to_string()));
        assert!(names.contains(&"xtrace_agent_export_errors_total".to_string()));
        assert!(names.contains(&"xtrace_agent_interfaces_attached".to_string()));
    }

    #[test]
    fn test_bind_address_shorthand() {
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address(":9464"), "0.0.0.0:9464");
        assert_eq!(bind_address("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_serves_health_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("health");
        health.signals_dropped.inc();
        let addr = health.start().await.expect("start");

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz");
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        health.interfaces_attached.set(1.0);
        let body = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(body.contains("xtrace_agent_signals_dropped_total 1"));

        health.stop();
        health.stop();
    }
}
