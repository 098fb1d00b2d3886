use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::proto::MetricFamily;
use reqwest::StatusCode;

use super::remote_write::{encode_remote_write, encode_text, REMOTE_WRITE_VERSION};
use super::{MetricsPusher, PushError};

/// Path marker selecting the remote-write protocol.
pub const REMOTE_WRITE_PATH: &str = "/api/v1/write";

/// Path of the text import endpoint.
pub const TEXT_IMPORT_PATH: &str = "/api/v1/import/prometheus";

/// Body encoding used for a push destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Text exposition format.
    Text,
    /// Protobuf + snappy remote-write.
    RemoteWrite,
}

impl ExportFormat {
    /// Remote-write when the URL targets the write endpoint, text otherwise.
    pub fn from_url(url: &str) -> Self {
        if url.contains(REMOTE_WRITE_PATH) {
            Self::RemoteWrite
        } else {
            Self::Text
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::RemoteWrite => "remote_write",
        }
    }
}

/// Pushes gathered metrics to a remote store over HTTP.
pub struct HttpPusher {
    client: reqwest::Client,
    url: String,
    format: ExportFormat,
}

impl HttpPusher {
    /// Build a pusher for `url`; the format follows the URL path.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            format: ExportFormat::from_url(url),
        })
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, families: &[MetricFamily]) -> Result<(), PushError> {
        let request = match self.format {
            ExportFormat::RemoteWrite => {
                let ts_ms = chrono::Utc::now().timestamp_millis();
                let body = encode_remote_write(families, ts_ms)?;
                self.client
                    .post(&self.url)
                    .header("Content-Encoding", "snappy")
                    .header("Content-Type", "application/x-protobuf")
                    .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
                    .body(body)
            }
            ExportFormat::Text => {
                let body = encode_text(families)?;
                self.client
                    .post(&self.url)
                    .header("Content-Type", "text/plain")
                    .body(body)
            }
        };

        let resp = request.send().await?;
        let status = resp.status();

        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl MetricsPusher for HttpPusher {
    fn name(&self) -> &str {
        self.format.as_str()
    }

    async fn push(&self, families: &[MetricFamily]) -> Result<(), PushError> {
        let series: usize = families.iter().map(|f| f.get_metric().len()).sum();
        self.send(families).await?;
        tracing::debug!(
            url = %self.url,
            format = self.format.as_str(),
            series,
            "pushed metrics",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_url() {
        assert_eq!(
            ExportFormat::from_url("http://vm:8428/api/v1/write"),
            ExportFormat::RemoteWrite
        );
        assert_eq!(
            ExportFormat::from_url("http://vm:8428/api/v1/import/prometheus"),
            ExportFormat::Text
        );
        assert_eq!(
            ExportFormat::from_url("http://vm:8428/custom"),
            ExportFormat::Text
        );
    }

    #[test]
    fn test_pusher_reports_format() {
        let pusher =
            HttpPusher::new("http://127.0.0.1:1/api/v1/write", Duration::from_secs(1)).expect("client");
        assert_eq!(pusher.format(), ExportFormat::RemoteWrite);
        assert_eq!(pusher.name(), "remote_write");
        assert_eq!(pusher.url(), "http://127.0.0.1:1/api/v1/write");
    }

    #[tokio::test]
    async fn test_push_connection_refused_is_request_error() {
        let pusher = HttpPusher::new(
            "http://127.0.0.1:1/api/v1/import/prometheus",
            Duration::from_secs(2),
        )
        .expect("client");
        let err = pusher.push(&[]).await.unwrap_err();
        assert!(matches!(err, PushError::Request(_)));
    }
}
