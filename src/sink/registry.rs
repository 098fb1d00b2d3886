use anyhow::Result;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};

use crate::flow::classify::Category;
use crate::flow::nic::NicRates;
use crate::flow::{FlowDelta, FlowRate};
use crate::tracer::event::FlowKey;
use crate::tracer::Direction;

const FLOW_LABELS: [&str; 9] = [
    "src_ip",
    "dst_ip",
    "src_port",
    "dst_port",
    "protocol",
    "traffic_type",
    "interface",
    "host_ip",
    "collect_agg",
];

const NIC_LABELS: [&str; 7] = [
    "src_ip",
    "dst_ip",
    "protocol",
    "traffic_type",
    "interface",
    "host_ip",
    "collect_agg",
];

const DIRECTION_LABEL: &str = "direction";

/// Labels shared by every series one collection task writes.
#[derive(Debug, Clone)]
pub struct SeriesContext {
    pub interface: String,
    pub host_ip: String,
    pub collect_agg: String,
    /// Present in traffic-control mode only.
    pub direction: Option<Direction>,
}

/// Process-wide flow metrics exported to the remote store.
///
/// All updates go through prometheus' internal atomics; callers share this
/// behind an `Arc` without extra locking.
pub struct FlowMetrics {
    registry: Registry,
    include_direction: bool,

    /// Cumulative bytes per flow.
    pub bytes_total: CounterVec,
    /// Cumulative packets per flow.
    pub packets_total: CounterVec,
    /// Last interval throughput per flow, bytes/s.
    pub flow_bytes_rate: GaugeVec,
    /// Last interval throughput per flow, bits/s.
    pub flow_bits_rate: GaugeVec,
    /// Last interval throughput per address pair, bytes/s.
    pub nic_bytes_rate: GaugeVec,
    /// Last interval throughput per address pair, bits/s.
    pub nic_bits_rate: GaugeVec,
}

impl FlowMetrics {
    /// Creates the registry. `include_direction` adds the direction label to every series.
    pub fn new(include_direction: bool) -> Result<Self> {
        let registry = Registry::new();

        let flow_labels = label_names(&FLOW_LABELS, include_direction);
        let nic_labels = label_names(&NIC_LABELS, include_direction);

        let bytes_total = CounterVec::new(
            Opts::new("xtrace_network_bytes_total", "Total network traffic in bytes."),
            &flow_labels,
        )?;
        let packets_total = CounterVec::new(
            Opts::new("xtrace_network_packets_total", "Total network packets."),
            &flow_labels,
        )?;
        let flow_bytes_rate = GaugeVec::new(
            Opts::new(
                "xtrace_network_flow_bytes_rate",
                "Flow throughput over the last interval in bytes per second.",
            ),
            &flow_labels,
        )?;
        let flow_bits_rate = GaugeVec::new(
            Opts::new(
                "xtrace_network_flow_bits_rate",
                "Flow throughput over the last interval in bits per second.",
            ),
            &flow_labels,
        )?;
        let nic_bytes_rate = GaugeVec::new(
            Opts::new(
                "xtrace_network_nic_bytes_rate",
                "Address-pair throughput over the last interval in bytes per second.",
            ),
            &nic_labels,
        )?;
        let nic_bits_rate = GaugeVec::new(
            Opts::new(
                "xtrace_network_nic_bits_rate",
                "Address-pair throughput over the last interval in bits per second.",
            ),
            &nic_labels,
        )?;

        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(packets_total.clone()))?;
        registry.register(Box::new(flow_bytes_rate.clone()))?;
        registry.register(Box::new(flow_bits_rate.clone()))?;
        registry.register(Box::new(nic_bytes_rate.clone()))?;
        registry.register(Box::new(nic_bits_rate.clone()))?;

        Ok(Self {
            registry,
            include_direction,
            bytes_total,
            packets_total,
            flow_bytes_rate,
            flow_bits_rate,
            nic_bytes_rate,
            nic_bits_rate,
        })
    }

    /// Add a flow's interval delta to its counters and set its rate gauges.
    pub fn record_flow(
        &self,
        ctx: &SeriesContext,
        key: &FlowKey,
        category: Category,
        delta: FlowDelta,
        rate: FlowRate,
    ) {
        let src_ip = key.src_addr().to_string();
        let dst_ip = key.dst_addr().to_string();
        let src_port = key.src_port_host().to_string();
        let dst_port = key.dst_port_host().to_string();
        let protocol = key.proto.to_string();

        let mut values: Vec<&str> = vec![
            src_ip.as_str(),
            dst_ip.as_str(),
            src_port.as_str(),
            dst_port.as_str(),
            protocol.as_str(),
            category.as_str(),
            ctx.interface.as_str(),
            ctx.host_ip.as_str(),
            ctx.collect_agg.as_str(),
        ];
        self.push_direction(ctx, &mut values);

        self.bytes_total
            .with_label_values(&values)
            .inc_by(delta.bytes as f64);
        self.packets_total
            .with_label_values(&values)
            .inc_by(delta.packets as f64);
        self.flow_bytes_rate
            .with_label_values(&values)
            .set(rate.bytes_per_sec);
        self.flow_bits_rate
            .with_label_values(&values)
            .set(rate.bits_per_sec);
    }

    /// Set the address-pair rate gauges from one tick's aggregate.
    pub fn record_nic(&self, ctx: &SeriesContext, nic: &NicRates) {
        for (key, entry) in nic.iter() {
            let src_ip = key.src.to_string();
            let dst_ip = key.dst.to_string();
            let protocol = key.proto.to_string();

            let mut values: Vec<&str> = vec![
                src_ip.as_str(),
                dst_ip.as_str(),
                protocol.as_str(),
                entry.category.as_str(),
                ctx.interface.as_str(),
                ctx.host_ip.as_str(),
                ctx.collect_agg.as_str(),
            ];
            self.push_direction(ctx, &mut values);

            self.nic_bytes_rate
                .with_label_values(&values)
                .set(entry.rate.bytes_per_sec);
            self.nic_bits_rate
                .with_label_values(&values)
                .set(entry.rate.bits_per_sec);
        }
    }

    fn push_direction<'a>(&self, ctx: &'a SeriesContext, values: &mut Vec<&'a str>) {
        if self.include_direction {
            values.push(ctx.direction.map_or("", Direction::as_str));
        }
    }

    /// Drop every rate series so flows absent next round do not linger.
    /// Counters are kept.
    pub fn reset_rates(&self) {
        self.flow_bytes_rate.reset();
        self.flow_bits_rate.reset();
        self.nic_bytes_rate.reset();
        self.nic_bits_rate.reset();
    }

    /// Snapshot all metric families.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn label_names(base: &[&'static str], include_direction: bool) -> Vec<&'static str> {
    let mut names = base.to_vec();
    if include_direction {
        names.push(DIRECTION_LABEL);
    }
    names
}
