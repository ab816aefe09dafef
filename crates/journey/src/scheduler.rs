//! Periodic journey scans, throttled per journey by a scan marker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use journey_cache::MarkerStore;
use journey_core::config::SchedulerConfig;
use journey_core::types::{scan_marker_key, JourneyId, ScanJob, ScanMarker};
use journey_core::JourneyResult;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::JourneyEngine;

/// Counts from one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scheduled: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    engine: Arc<JourneyEngine>,
    markers: Arc<dyn MarkerStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        engine: Arc<JourneyEngine>,
        markers: Arc<dyn MarkerStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            markers,
            config,
        }
    }

    /// Enqueues a scan for every active journey whose marker is missing or
    /// older than the check interval. A failing journey does not stop the
    /// others.
    pub async fn tick(&self, now: DateTime<Utc>) -> JourneyResult<TickReport> {
        let journeys = self.engine.store().list_active_journeys().await?;
        let mut report = TickReport::default();

        for journey in journeys {
            match self.schedule(journey.id, now).await {
                Ok(true) => report.scheduled += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(journey_id = journey.id, error = %e, "Failed to schedule journey scan");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Returns false when the journey's last scan is still fresh.
    async fn schedule(&self, journey: JourneyId, now: DateTime<Utc>) -> JourneyResult<bool> {
        if let Some(marker) = self.markers.get(journey).await? {
            if marker.is_fresh(now, self.config.check_interval()) {
                debug!(journey_id = journey, job_key = %marker.job_key, "Scan still fresh");
                metrics::counter!("journey.scheduler.skipped").increment(1);
                return Ok(false);
            }
        }

        // Unique per tick: two scans of one journey never share a message id.
        let job_key = format!("{}:{}", scan_marker_key(journey), now.timestamp_millis());
        self.markers.delete(journey).await?;
        self.markers
            .put(&ScanMarker {
                journey_id: journey,
                job_key: job_key.clone(),
                processed_date: now,
            })
            .await?;
        self.engine
            .dispatcher()
            .create_scan_job(&ScanJob {
                journey_id: journey,
                job_key,
                created_at: now,
            })
            .await?;

        metrics::counter!("journey.scheduler.scans").increment(1);
        Ok(true)
    }

    /// Ticks on the configured cadence until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.tick_interval().as_secs(),
            check_interval_secs = self.config.check_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => info!(
                            scheduled = report.scheduled,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Scheduler tick"
                        ),
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler stopped");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use journey_broker::{BrokerClient, MemoryBroker, Queue};
    use journey_cache::LocalMarkerStore;
    use journey_content::{MemoryContentStore, MemoryRuleEvaluator, MemorySender};
    use journey_core::event_bus::noop_sink;
    use journey_core::records::Journey;

    async fn scheduler() -> (Arc<MemoryContentStore>, Arc<MemoryBroker>, Scheduler) {
        let store = Arc::new(MemoryContentStore::new());
        let broker = Arc::new(MemoryBroker::new());
        broker.setup().await.unwrap();
        let engine = Arc::new(JourneyEngine::new(
            store.clone(),
            Arc::new(MemorySender::new()),
            Arc::new(MemoryRuleEvaluator::new()),
            broker.clone(),
            noop_sink(),
            EngineSettings::default(),
        ));
        let scheduler = Scheduler::new(
            engine,
            Arc::new(LocalMarkerStore::default()),
            SchedulerConfig::default(),
        );
        (store, broker, scheduler)
    }

    fn journey(id: JourneyId, active: bool) -> Journey {
        Journey {
            id,
            name: format!("journey {id}"),
            active,
            journey_steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_only_active_journeys_are_scanned() {
        let (store, broker, scheduler) = scheduler().await;
        store.insert_journey(journey(1, true));
        store.insert_journey(journey(2, false));

        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.scheduled, 1);

        let scans = broker.published_to(Queue::Journey);
        assert_eq!(scans.len(), 1);
        let scan: ScanJob = serde_json::from_slice(&scans[0].payload).unwrap();
        assert_eq!(scan.journey_id, 1);
        assert!(scan.job_key.starts_with("journey-job:1:"));
    }

    #[tokio::test]
    async fn test_fresh_marker_suppresses_rescan() {
        let (store, broker, scheduler) = scheduler().await;
        store.insert_journey(journey(1, true));
        let start = Utc::now();

        scheduler.tick(start).await.unwrap();
        let report = scheduler
            .tick(start + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(broker.published_to(Queue::Journey).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_marker_is_refreshed() {
        let (store, broker, scheduler) = scheduler().await;
        store.insert_journey(journey(1, true));
        let start = Utc::now() - chrono::Duration::seconds(301);

        scheduler.tick(start).await.unwrap();
        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.scheduled, 1);

        let scans = broker.published_to(Queue::Journey);
        assert_eq!(scans.len(), 2);
        assert_ne!(scans[0].message_id, scans[1].message_id);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_not_fatal() {
        let (store, broker, scheduler) = scheduler().await;
        store.insert_journey(journey(1, true));
        store.insert_journey(journey(2, true));
        broker.set_fail_on_publish(true);

        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.scheduled, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, _, scheduler) = scheduler().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
