use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::proto::MetricFamily;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use xtrace::agent::collector::{Collector, CollectorSettings, CollectorState};
use xtrace::export::health::HealthMetrics;
use xtrace::flow::classify::TrafficFilter;
use xtrace::sink::registry::{FlowMetrics, SeriesContext};
use xtrace::tracer::event::{FlowKey, FlowRecord, FlowStats};
use xtrace::tracer::{FlowTable, PollError};

/// Kernel table stand-in whose contents the test edits between ticks.
#[derive(Clone)]
struct SharedTable {
    iface: String,
    flows: Arc<Mutex<HashMap<FlowKey, FlowStats>>>,
    released: Arc<Mutex<u32>>,
}

impl SharedTable {
    fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            flows: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(Mutex::new(0)),
        }
    }

    fn set(&self, key: FlowKey, packets: u64, bytes: u64) {
        self.flows.lock().insert(key, FlowStats::new(packets, bytes));
    }

    fn remove(&self, key: &FlowKey) {
        self.flows.lock().remove(key);
    }
}

impl FlowTable for SharedTable {
    fn interface(&self) -> &str {
        &self.iface
    }

    fn poll(&mut self, out: &mut Vec<FlowRecord>) -> Result<(), PollError> {
        out.extend(
            self.flows
                .lock()
                .iter()
                .map(|(k, s)| FlowRecord::new(*k, *s)),
        );
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        *self.released.lock() += 1;
        Ok(())
    }
}

fn key(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, proto: u8) -> FlowKey {
    FlowKey::new(Ipv4Addr::from(src), Ipv4Addr::from(dst), sport, dport, proto)
}

fn ctx(iface: &str) -> SeriesContext {
    SeriesContext {
        interface: iface.to_string(),
        host_ip: "192.168.0.10".to_string(),
        collect_agg: "test".to_string(),
        direction: None,
    }
}

fn settings(filter: TrafficFilter) -> CollectorSettings {
    CollectorSettings {
        filter,
        exclude_dns: false,
        console: false,
    }
}

fn health() -> Arc<HealthMetrics> {
    Arc::new(HealthMetrics::new(":0").expect("health"))
}

fn sample(families: &[MetricFamily], name: &str, label: (&str, &str)) -> Option<f64> {
    let family = families.iter().find(|f| f.get_name() == name)?;
    family
        .get_metric()
        .iter()
        .find(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == label.0 && l.get_value() == label.1)
        })
        .map(|m| {
            if m.has_counter() {
                m.get_counter().get_value()
            } else {
                m.get_gauge().get_value()
            }
        })
}

#[test]
fn test_delta_and_rate_scenario() {
    let table = SharedTable::new("eth0");
    let flow = key([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 6);
    let metrics = Arc::new(FlowMetrics::new(false).expect("metrics"));
    let (tx, _rx) = mpsc::channel(8);

    let mut collector = Collector::new(
        Box::new(table.clone()),
        settings(TrafficFilter::All),
        ctx("eth0"),
        health(),
    )
    .with_export(Arc::clone(&metrics), tx);

    let start = Instant::now();
    collector.mark_running(start);

    table.set(flow, 100, 15_000);
    collector.tick(start + Duration::from_secs(5));
    let families = metrics.gather();
    assert_eq!(sample(&families, "xtrace_network_packets_total", ("dst_ip", "10.0.0.2")), Some(100.0));
    assert_eq!(sample(&families, "xtrace_network_bytes_total", ("dst_ip", "10.0.0.2")), Some(15_000.0));

    metrics.reset_rates();
    table.set(flow, 150, 20_000);
    collector.tick(start + Duration::from_secs(10));
    let families = metrics.gather();
    assert_eq!(sample(&families, "xtrace_network_packets_total", ("dst_ip", "10.0.0.2")), Some(150.0));
    assert_eq!(sample(&families, "xtrace_network_bytes_total", ("dst_ip", "10.0.0.2")), Some(20_000.0));
    assert_eq!(sample(&families, "xtrace_network_flow_bytes_rate", ("dst_ip", "10.0.0.2")), Some(1_000.0));
    assert_eq!(sample(&families, "xtrace_network_flow_bits_rate", ("dst_ip", "10.0.0.2")), Some(8_000.0));
    assert_eq!(sample(&families, "xtrace_network_flow_bits_rate", ("traffic_type", "TCP")), Some(8_000.0));
}

#[test]
fn test_counter_reset_counts_from_zero() {
    let table = SharedTable::new("eth0");
    let flow = key([10, 0, 0, 1], [10, 0, 0, 3], 50000, 4791, 17);
    let metrics = Arc::new(FlowMetrics::new(false).expect("metrics"));
    let (tx, _rx) = mpsc::channel(8);

    let mut collector = Collector::new(
        Box::new(table.clone()),
        settings(TrafficFilter::Roce),
        ctx("eth0"),
        health(),
    )
    .with_export(Arc::clone(&metrics), tx);

    let start = Instant::now();
    collector.mark_running(start);

    table.set(flow, 1_000, 1_000_000);
    collector.tick(start + Duration::from_secs(1));
    table.set(flow, 10, 4_000);
    collector.tick(start + Duration::from_secs(2));

    let families = metrics.gather();
    assert_eq!(
        sample(&families, "xtrace_network_bytes_total", ("traffic_type", "RoCE_v2_UDP")),
        Some(1_004_000.0)
    );
    assert_eq!(
        sample(&families, "xtrace_network_packets_total", ("dst_port", "4791")),
        Some(1_010.0)
    );
}

#[test]
fn test_vanished_flow_is_pruned_and_restarts() {
    let table = SharedTable::new("eth0");
    let a = key([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 6);
    let b = key([10, 0, 0, 1], [10, 0, 0, 4], 40001, 443, 6);

    let mut collector = Collector::new(
        Box::new(table.clone()),
        settings(TrafficFilter::All),
        ctx("eth0"),
        health(),
    );
    let start = Instant::now();
    collector.mark_running(start);

    table.set(a, 10, 1_000);
    table.set(b, 10, 1_000);
    let report = collector.tick(start + Duration::from_secs(1));
    assert_eq!(report.polled, 2);
    assert_eq!(collector.tracked_flows(), 2);

    table.remove(&b);
    let report = collector.tick(start + Duration::from_secs(2));
    assert_eq!(report.pruned, 1);
    assert_eq!(collector.tracked_flows(), 1);
}

#[test]
fn test_filtered_flows_still_tracked() {
    let table = SharedTable::new("ib0");
    table.set(key([10, 0, 0, 1], [10, 0, 0, 2], 0, 0, 0x14), 5, 500);
    table.set(key([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80, 6), 5, 500);
    table.set(key([0, 0, 0, 0], [0, 0, 0, 0], 0, 0, 0), 1, 64);

    let mut collector = Collector::new(
        Box::new(table.clone()),
        settings(TrafficFilter::Ib),
        ctx("ib0"),
        health(),
    );
    let start = Instant::now();
    collector.mark_running(start);
    let report = collector.tick(start + Duration::from_secs(1));

    assert_eq!(report.polled, 3);
    assert_eq!(report.reported, 1);
    assert_eq!(collector.tracked_flows(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_collection_stays_live_when_signals_drop() {
    let table = SharedTable::new("eth0");
    table.set(key([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 6), 1, 100);

    let health = health();
    let metrics = Arc::new(FlowMetrics::new(false).expect("metrics"));
    // Nobody drains this channel.
    let (tx, _rx) = mpsc::channel(1);

    let mut collector = Collector::new(
        Box::new(table.clone()),
        settings(TrafficFilter::All),
        ctx("eth0"),
        Arc::clone(&health),
    )
    .with_export(metrics, tx);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        stopper.cancel();
    });

    collector
        .run(cancel, Duration::from_millis(100))
        .await
        .expect("run");

    assert_eq!(collector.state(), CollectorState::Stopped);
    assert_eq!(*table.released.lock(), 1);
    assert_eq!(health.ticks_total.with_label_values(&["eth0"]).get(), 10.0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(health.signals_dropped.get() >= 1.0);
}
