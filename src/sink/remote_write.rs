//! Wire encodings for gathered metric families.
//!
//! Two formats are supported: the line-oriented text exposition format and
//! the Prometheus remote-write protocol (protobuf, snappy block compressed).

use prometheus::proto::{Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use prost::Message;

use super::PushError;

/// Reserved label carrying the metric name in remote-write series.
pub const NAME_LABEL: &str = "__name__";

/// Remote-write protocol version sent with every request.
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

/// Value of one sample. Histogram and summary families are not produced by
/// this agent and map to zero.
fn sample_value(kind: MetricType, metric: &Metric) -> f64 {
    match kind {
        MetricType::COUNTER => metric.get_counter().get_value(),
        MetricType::GAUGE => metric.get_gauge().get_value(),
        MetricType::UNTYPED => metric.get_untyped().get_value(),
        _ => 0.0,
    }
}

/// One time series per sample, each stamped with `timestamp_ms`.
pub fn build_write_request(families: &[MetricFamily], timestamp_ms: i64) -> WriteRequest {
    let total: usize = families.iter().map(|f| f.get_metric().len()).sum();
    let mut timeseries = Vec::with_capacity(total);

    for family in families {
        let kind = family.get_field_type();
        for metric in family.get_metric() {
            let mut labels = Vec::with_capacity(metric.get_label().len() + 1);
            labels.push(Label {
                name: NAME_LABEL.to_string(),
                value: family.get_name().to_string(),
            });
            labels.extend(metric.get_label().iter().map(|pair| Label {
                name: pair.get_name().to_string(),
                value: pair.get_value().to_string(),
            }));

            timeseries.push(TimeSeries {
                labels,
                samples: vec![Sample {
                    value: sample_value(kind, metric),
                    timestamp: timestamp_ms,
                }],
            });
        }
    }

    WriteRequest { timeseries }
}

/// Remote-write body: protobuf-encoded request, snappy block compressed.
pub fn encode_remote_write(
    families: &[MetricFamily],
    timestamp_ms: i64,
) -> Result<Vec<u8>, PushError> {
    let request = build_write_request(families, timestamp_ms);

    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| PushError::Encode(Box::new(e)))?;

    compress_snappy(&buf)
}

/// Text exposition body.
pub fn encode_text(families: &[MetricFamily]) -> Result<Vec<u8>, PushError> {
    let mut buf = Vec::with_capacity(4096);
    TextEncoder::new()
        .encode(families, &mut buf)
        .map_err(|e| PushError::Encode(Box::new(e)))?;
    Ok(buf)
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>, PushError> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| PushError::Encode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use prometheus::{CounterVec, Gauge, Opts, Registry};

    use super::*;

    fn sample_families() -> Vec<MetricFamily> {
        let registry = Registry::new();
        let bytes = CounterVec::new(
            Opts::new("xtrace_network_bytes_total", "bytes"),
            &["src_ip", "interface"],
        )
        .expect("counter");
        let gauge = Gauge::new("xtrace_agent_up", "up").expect("gauge");
        registry.register(Box::new(bytes.clone())).expect("register");
        registry.register(Box::new(gauge.clone())).expect("register");

        bytes.with_label_values(&["10.0.0.1", "eth0"]).inc_by(1500.0);
        bytes.with_label_values(&["10.0.0.2", "eth1"]).inc_by(64.0);
        gauge.set(1.0);

        registry.gather()
    }

    #[test]
    fn test_build_write_request_one_series_per_sample() {
        let req = build_write_request(&sample_families(), 1_700_000_000_000);
        assert_eq!(req.timeseries.len(), 3);

        for ts in &req.timeseries {
            assert_eq!(ts.labels[0].name, NAME_LABEL);
            assert_eq!(ts.samples.len(), 1);
            assert_eq!(ts.samples[0].timestamp, 1_700_000_000_000);
        }

        let eth0 = req
            .timeseries
            .iter()
            .find(|ts| ts.labels.iter().any(|l| l.value == "eth0"))
            .expect("eth0 series");
        assert_eq!(eth0.labels[0].value, "xtrace_network_bytes_total");
        assert_eq!(eth0.samples[0].value, 1500.0);
        assert_eq!(eth0.labels.len(), 3);

        let up = req
            .timeseries
            .iter()
            .find(|ts| ts.labels[0].value == "xtrace_agent_up")
            .expect("gauge series");
        assert_eq!(up.labels.len(), 1);
        assert_eq!(up.samples[0].value, 1.0);
    }

    #[test]
    fn test_encode_remote_write_decodes() {
        let families = sample_families();
        let body = encode_remote_write(&families, 42).expect("encode");
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&body)
            .expect("snappy decompress");
        let decoded = WriteRequest::decode(raw.as_slice()).expect("protobuf decode");
        assert_eq!(decoded, build_write_request(&families, 42));
    }

    #[test]
    fn test_encode_text_lines() {
        let body = encode_text(&sample_families()).expect("encode");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("# TYPE xtrace_network_bytes_total counter"));
        let eth0 = text
            .lines()
            .find(|l| l.starts_with("xtrace_network_bytes_total{") && l.contains(r#"interface="eth0""#))
            .expect("eth0 sample line");
        assert!(eth0.contains(r#"src_ip="10.0.0.1""#));
        assert!(eth0.ends_with(" 1500"));
        assert!(text.lines().any(|l| l == "xtrace_agent_up 1"));
    }

    #[test]
    fn test_empty_families() {
        assert!(build_write_request(&[], 0).timeseries.is_empty());
        assert!(encode_text(&[]).expect("encode").is_empty());
    }
}
