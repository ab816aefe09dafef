//! Redis-backed scan marker store.

use std::time::Duration;

use async_trait::async_trait;
use journey_core::config::RedisConfig;
use journey_core::types::{scan_marker_key, JourneyId, ScanMarker};
use journey_core::{JourneyError, JourneyResult};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::MarkerStore;

/// Markers are stored as JSON under `journey-job:{id}` and expire after the
/// configured TTL.
pub struct RedisMarkerStore {
    client: redis::Client,
    ttl_secs: u64,
}

fn cache_err(err: redis::RedisError) -> JourneyError {
    JourneyError::Cache(err.to_string())
}

impl RedisMarkerStore {
    /// Connect to the first configured Redis node and verify it answers.
    pub async fn new(config: &RedisConfig) -> JourneyResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str()).map_err(cache_err)?;

        let ping = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        };
        let pong = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), ping)
            .await
            .map_err(|_| JourneyError::Cache(format!("Timed out connecting to {url}")))?
            .map_err(cache_err)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            client,
            ttl_secs: config.marker_ttl_secs,
        })
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn get(&self, journey: JourneyId) -> JourneyResult<Option<ScanMarker>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)?;
        let data: Option<String> = conn.get(scan_marker_key(journey)).await.map_err(cache_err)?;

        match data {
            Some(json) => match serde_json::from_str(&json) {
                Ok(marker) => {
                    metrics::counter!("cache.marker.hit").increment(1);
                    Ok(Some(marker))
                }
                Err(e) => {
                    // An unreadable marker is treated as absent; the next put overwrites it.
                    warn!(journey_id = journey, error = %e, "Discarding malformed scan marker");
                    Ok(None)
                }
            },
            None => {
                metrics::counter!("cache.marker.miss").increment(1);
                debug!(journey_id = journey, "No scan marker");
                Ok(None)
            }
        }
    }

    async fn put(&self, marker: &ScanMarker) -> JourneyResult<()> {
        let json = serde_json::to_string(marker)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)?;
        conn.set_ex::<_, _, ()>(scan_marker_key(marker.journey_id), json, self.ttl_secs)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn delete(&self, journey: JourneyId) -> JourneyResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)?;
        conn.del::<_, ()>(scan_marker_key(journey))
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

/// Integration tests requiring a running Redis.
///
/// Run with: REDIS_URL=redis://localhost:6379 cargo test -p journey-cache -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::Utc;

    async fn store() -> RedisMarkerStore {
        let config = RedisConfig {
            urls: vec![std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into())],
            ..RedisConfig::default()
        };
        RedisMarkerStore::new(&config).await.expect("connect")
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_marker_put_get_delete() {
        let store = store().await;
        let marker = ScanMarker {
            journey_id: 990_001,
            job_key: "journey-job:990001".into(),
            processed_date: Utc::now(),
        };

        store.put(&marker).await.unwrap();
        let loaded = store.get(990_001).await.unwrap().expect("marker");
        assert_eq!(loaded.job_key, marker.job_key);
        assert_eq!(loaded.processed_date.timestamp_millis(), marker.processed_date.timestamp_millis());

        store.delete(990_001).await.unwrap();
        assert!(store.get(990_001).await.unwrap().is_none());
    }
}
