#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;

use async_trait::async_trait;
use journey_core::types::{JourneyId, ScanMarker};
use journey_core::JourneyResult;

pub use client::RedisMarkerStore;
pub use local::LocalMarkerStore;

/// Keyed storage of per-journey scan markers.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn get(&self, journey: JourneyId) -> JourneyResult<Option<ScanMarker>>;

    async fn put(&self, marker: &ScanMarker) -> JourneyResult<()>;

    async fn delete(&self, journey: JourneyId) -> JourneyResult<()>;
}
