use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::Queue;
use journey_core::types::JobMessage;
use journey_core::{JourneyError, JourneyResult};
use tracing::info;

use super::Consumer;
use crate::engine::JourneyEngine;
use crate::types::Handled;

/// Timed steps released by the delayed exchange, plus deferred rule checks.
pub struct DelayedConsumer {
    engine: Arc<JourneyEngine>,
}

impl DelayedConsumer {
    pub fn new(engine: Arc<JourneyEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Consumer for DelayedConsumer {
    type Message = JobMessage;

    fn queue(&self) -> Queue {
        Queue::Delayed
    }

    fn job_id(message: &JobMessage) -> String {
        message.job_id.clone()
    }

    async fn process(&self, job: JobMessage) -> JourneyResult<Handled> {
        if job.rule_check {
            info!(job_id = %job.job_id, attempt = job.attempt, "Re-checking rules");
            return self.engine.check_rules(&job).await;
        }
        if job.timing.is_none() {
            return Err(JourneyError::config(format!(
                "delayed job {} has no timing",
                job.job_id
            )));
        }
        info!(job_id = %job.job_id, step_type = %job.step_type(), "Processing delayed job");
        self.engine.run_step(&job).await
    }
}
