//! In-process marker store backed by DashMap. Used by tests and by a worker
//! started without Redis.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use journey_core::types::{JourneyId, ScanMarker};
use journey_core::JourneyResult;

use crate::MarkerStore;

pub struct LocalMarkerStore {
    store: DashMap<JourneyId, ScanMarker>,
    ttl: Duration,
}

impl LocalMarkerStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            store: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn expired(&self, marker: &ScanMarker) -> bool {
        match (Utc::now() - marker.processed_date).to_std() {
            Ok(age) => age > self.ttl,
            Err(_) => false,
        }
    }

    /// Remove expired markers.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        let ttl = self.ttl;
        let now = Utc::now();
        self.store.retain(|_, marker| {
            (now - marker.processed_date)
                .to_std()
                .map_or(true, |age| age <= ttl)
        });
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for LocalMarkerStore {
    fn default() -> Self {
        Self::new(86_400)
    }
}

#[async_trait]
impl MarkerStore for LocalMarkerStore {
    async fn get(&self, journey: JourneyId) -> JourneyResult<Option<ScanMarker>> {
        let Some(entry) = self.store.get(&journey) else {
            return Ok(None);
        };
        if self.expired(&entry) {
            drop(entry);
            self.store.remove(&journey);
            return Ok(None);
        }
        Ok(Some(entry.clone()))
    }

    async fn put(&self, marker: &ScanMarker) -> JourneyResult<()> {
        self.store.insert(marker.journey_id, marker.clone());
        Ok(())
    }

    async fn delete(&self, journey: JourneyId) -> JourneyResult<()> {
        self.store.remove(&journey);
        Ok(())
    }
}
