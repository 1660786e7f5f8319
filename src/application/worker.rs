use crate::application::processor::{OrderProcessor, ProcessOutcome};
use crate::application::settings::Settings;
use crate::domain::ports::{ProcessOrderJob, QueueRef};
use rand::Rng;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// `base * 2^attempt`, capped at `max`.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Adds a random extra of up to half the delay.
pub fn with_jitter(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    if half == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done(ProcessOutcome),
    Rescheduled { attempt: u32, delay: Duration },
    /// Retries ran out and the order was failed.
    Exhausted,
    /// A non-retryable error; the order status already reflects it.
    Failed { reason: String },
}

/// The background job that routes one order, with retry scheduling around it.
#[derive(Clone)]
pub struct ProcessOrderTask {
    processor: OrderProcessor,
    queue: QueueRef,
    settings: Settings,
}

impl ProcessOrderTask {
    pub fn new(processor: OrderProcessor, queue: QueueRef, settings: Settings) -> Self {
        Self {
            processor,
            queue,
            settings,
        }
    }

    async fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_delay().await;
        let max = self.settings.retry_delay_max().await;
        with_jitter(backoff(attempt, base, max))
    }

    async fn reschedule(&self, job: ProcessOrderJob, delay_attempt: u32) -> TaskOutcome {
        let next = job.next_attempt();
        let delay = self.delay_for(delay_attempt).await;
        if let Err(e) = self.queue.enqueue(next, delay).await {
            error!(
                alert = "critical",
                incoming_order_id = job.incoming_order_id,
                error = %e,
                "Could not reschedule order"
            );
            return TaskOutcome::Failed {
                reason: e.public_reason(),
            };
        }
        info!(
            incoming_order_id = job.incoming_order_id,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            "Order rescheduled"
        );
        TaskOutcome::Rescheduled {
            attempt: next.attempt,
            delay,
        }
    }

    #[instrument(skip(self), fields(incoming_order_id = job.incoming_order_id, attempt = job.attempt))]
    pub async fn run(&self, job: ProcessOrderJob) -> TaskOutcome {
        let id = job.incoming_order_id;
        match self.processor.process(id).await {
            Ok(ProcessOutcome::Retrying { retry_count }) => {
                self.reschedule(job, retry_count.saturating_sub(1)).await
            }
            Ok(outcome) => TaskOutcome::Done(outcome),
            Err(e) if e.is_retryable() => {
                let max_retries = self.settings.max_retries().await;
                if job.attempt + 1 < max_retries {
                    warn!(error = %e, "Retryable processing error");
                    return self.reschedule(job, job.attempt).await;
                }
                match self.processor.fail_exhausted(id).await {
                    Ok(_) => TaskOutcome::Exhausted,
                    Err(follow_up) => {
                        error!(
                            alert = "critical",
                            error = %e,
                            follow_up_error = %follow_up,
                            "Could not fail exhausted order"
                        );
                        TaskOutcome::Failed {
                            reason: follow_up.public_reason(),
                        }
                    }
                }
            }
            Err(e) => {
                error!(alert = "critical", error = %e, "Order processing failed");
                TaskOutcome::Failed {
                    reason: e.public_reason(),
                }
            }
        }
    }
}
