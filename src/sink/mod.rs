pub mod http;
pub mod registry;
pub mod remote_write;

use prometheus::proto::MetricFamily;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Export failures. Logged by the caller; collection is never halted.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("encoding metrics: {0}")]
    Encode(#[source] BoxError),

    #[error("sending metrics: {0}")]
    Request(#[from] reqwest::Error),

    #[error("remote store returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Destination for gathered metric families.
pub trait MetricsPusher: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Encode and deliver one batch.
    fn push(
        &self,
        families: &[MetricFamily],
    ) -> impl std::future::Future<Output = Result<(), PushError>> + Send;
}
