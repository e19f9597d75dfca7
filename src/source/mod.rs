//! Where metric batches come from.

pub mod http;
pub mod replay;
pub mod resources;

use async_trait::async_trait;

use crate::detect::MetricBatch;

pub use self::http::HttpSource;
pub use self::replay::ReplaySource;
pub use self::resources::ResourceSampler;

/// Produces one batch per evaluation cycle.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<MetricBatch>;
}
