use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::Queue;
use journey_content::ContentStore;
use journey_core::records::StepReached;
use journey_core::types::{ScanJob, StepType};
use journey_core::JourneyResult;
use tracing::{debug, info};

use super::Consumer;
use crate::engine::JourneyEngine;
use crate::types::{Handled, NewJob, StepRef};

/// Re-queues every contact sitting on a step of one journey.
///
/// A contact whose latest `step_reached` action names a target is advanced
/// right away. A job for its current step is enqueued either way; the
/// passed-step check keeps the duplicate from sending twice.
pub struct JourneyScanConsumer {
    engine: Arc<JourneyEngine>,
}

impl JourneyScanConsumer {
    pub fn new(engine: Arc<JourneyEngine>) -> Self {
        Self { engine }
    }

    fn store(&self) -> &dyn ContentStore {
        self.engine.store().as_ref()
    }
}

#[async_trait]
impl Consumer for JourneyScanConsumer {
    type Message = ScanJob;

    fn queue(&self) -> Queue {
        Queue::Journey
    }

    fn job_id(message: &ScanJob) -> String {
        message.job_key.clone()
    }

    async fn process(&self, scan: ScanJob) -> JourneyResult<Handled> {
        let journey = self.store().get_journey(scan.journey_id).await?;
        if !journey.active {
            info!(journey_id = journey.id, "Journey inactive, scan skipped");
            return Ok(Handled::Skipped {
                reason: "journey inactive",
            });
        }
        info!(journey_id = journey.id, name = %journey.name, "Scanning journey");

        let mut contacts = 0;
        let mut advanced = 0;
        let occupied = journey
            .journey_steps
            .iter()
            .filter(|s| s.step_type != StepType::Trigger && !s.contacts.is_empty());

        for shallow in occupied {
            let step = self.store().get_journey_step(shallow.id).await?;
            for contact in &step.contacts {
                let at = StepRef {
                    contact: contact.id,
                    journey: journey.id,
                    step: step.id,
                };

                let reached = self.store().find_step_reached(step.id, contact.id).await?;
                if let Some(StepReached {
                    target_step: Some(target),
                }) = reached
                {
                    debug!(contact_id = contact.id, step_id = step.id, target, "Step already decided");
                    self.engine.create_next_job(at, Some(target)).await?;
                    advanced += 1;
                }

                self.engine
                    .dispatcher()
                    .create_job(NewJob::for_step(contact.id, journey.id, &step)?)
                    .await?;
                contacts += 1;
            }
        }

        info!(journey_id = journey.id, contacts, advanced, "Journey scanned");
        Ok(Handled::Scanned { contacts, advanced })
    }
}
