use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::Queue;
use journey_core::types::JobMessage;
use journey_core::JourneyResult;
use tracing::info;

use super::Consumer;
use crate::engine::JourneyEngine;
use crate::types::Handled;

pub struct RuleCheckConsumer {
    engine: Arc<JourneyEngine>,
}

impl RuleCheckConsumer {
    pub fn new(engine: Arc<JourneyEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Consumer for RuleCheckConsumer {
    type Message = JobMessage;

    fn queue(&self) -> Queue {
        Queue::RuleCheck
    }

    fn job_id(message: &JobMessage) -> String {
        message.job_id.clone()
    }

    async fn process(&self, job: JobMessage) -> JourneyResult<Handled> {
        info!(job_id = %job.job_id, attempt = job.attempt, "Checking rules");
        self.engine.check_rules(&job).await
    }
}
