//! Cross-interface batch export.
//!
//! Each collection task signals once per completed tick. The aggregator
//! pushes the shared registry once per round of signals, then clears the
//! rate gauges so the next round starts from an empty rate view.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::sink::registry::FlowMetrics;
use crate::sink::MetricsPusher;

/// Bound on the fallback send when the completion channel is full.
pub const SIGNAL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Counts completion signals until a full round has arrived.
#[derive(Debug)]
pub struct RoundBarrier {
    expected: usize,
    received: usize,
}

impl RoundBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            expected: expected.max(1),
            received: 0,
        }
    }

    /// Record one signal. Returns true when it completes the round.
    pub fn record(&mut self) -> bool {
        self.received += 1;
        if self.received >= self.expected {
            self.received = 0;
            return true;
        }
        false
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn pending(&self) -> usize {
        self.received
    }
}

/// Tell the aggregator one tick finished. Never blocks the caller.
///
/// A full channel hands the signal to a short-lived task that waits up to
/// [`SIGNAL_SEND_TIMEOUT`]; after that the signal is dropped.
pub fn signal_completion(tx: &mpsc::Sender<()>, iface: &str, health: &Arc<HealthMetrics>) {
    match tx.try_send(()) {
        Ok(()) => {}
        Err(TrySendError::Closed(())) => {
            debug!(interface = %iface, "aggregator stopped, completion signal discarded");
        }
        Err(TrySendError::Full(())) => {
            let tx = tx.clone();
            let iface = iface.to_string();
            let health = Arc::clone(health);
            tokio::spawn(async move {
                match tokio::time::timeout(SIGNAL_SEND_TIMEOUT, tx.send(())).await {
                    Ok(Ok(())) | Ok(Err(_)) => {}
                    Err(_) => {
                        health.signals_dropped.inc();
                        warn!(interface = %iface, "completion channel full, signal dropped");
                    }
                }
            });
        }
    }
}

/// Push the registry once per round of `expected` signals until cancelled.
pub async fn run_aggregator<P: MetricsPusher>(
    mut rx: mpsc::Receiver<()>,
    expected: usize,
    metrics: Arc<FlowMetrics>,
    pusher: P,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut barrier = RoundBarrier::new(expected);
    info!(
        expected = barrier.expected(),
        pusher = pusher.name(),
        "aggregator started",
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = rx.recv() => {
                if signal.is_none() {
                    break;
                }
                if !barrier.record() {
                    continue;
                }

                let families = metrics.gather();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("push abandoned on shutdown");
                        break;
                    }
                    result = pusher.push(&families) => match result {
                        Ok(()) => health.export_success.inc(),
                        Err(e) => {
                            health.export_errors.inc();
                            warn!(pusher = pusher.name(), error = %e, "metrics push failed");
                        }
                    },
                }

                metrics.reset_rates();
            }
        }
    }

    info!(pending = barrier.pending(), "aggregator stopped");
}
