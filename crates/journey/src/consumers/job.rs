use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::Queue;
use journey_core::types::JobMessage;
use journey_core::JourneyResult;
use tracing::info;

use super::Consumer;
use crate::engine::JourneyEngine;
use crate::types::Handled;

/// Immediate step jobs: execute, close, then branch or finish.
pub struct JobConsumer {
    engine: Arc<JourneyEngine>,
}

impl JobConsumer {
    pub fn new(engine: Arc<JourneyEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Consumer for JobConsumer {
    type Message = JobMessage;

    fn queue(&self) -> Queue {
        Queue::Job
    }

    fn job_id(message: &JobMessage) -> String {
        message.job_id.clone()
    }

    async fn process(&self, job: JobMessage) -> JourneyResult<Handled> {
        info!(job_id = %job.job_id, step_type = %job.step_type(), "Processing job");
        self.engine.run_step(&job).await
    }
}
