use crate::application::worker::ProcessOrderTask;
use crate::domain::ports::{ProcessOrderJob, TaskQueue};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// In-process task queue on a tokio channel.
///
/// Delayed jobs sleep on a spawned task before entering the channel. A job
/// stays pending from `enqueue` until its delivery is acknowledged, which is
/// what `drain` waits for.
#[derive(Clone)]
pub struct TokioTaskQueue {
    sender: mpsc::UnboundedSender<ProcessOrderJob>,
    pending: Arc<Pending>,
}

impl TokioTaskQueue {
    pub fn channel() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());
        let queue = Self {
            sender: sender.clone(),
            pending: pending.clone(),
        };
        let receiver = JobReceiver {
            receiver: Mutex::new(receiver),
            sender,
            pending,
        };
        (queue, receiver)
    }

    /// Resolves once every enqueued job, including delayed and re-enqueued
    /// ones, has been acknowledged.
    pub async fn drain(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for TokioTaskQueue {
    async fn enqueue(&self, job: ProcessOrderJob, delay: Duration) -> Result<()> {
        self.pending.add();
        if delay.is_zero() {
            if self.sender.send(job).is_err() {
                self.pending.done();
                return Err(PaymentError::StorageError("task queue is closed".into()));
            }
            return Ok(());
        }
        let sender = self.sender.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job).is_err() {
                warn!(
                    incoming_order_id = job.incoming_order_id,
                    "Task queue closed, delayed job dropped"
                );
                pending.done();
            }
        });
        Ok(())
    }
}

/// Consumer side of a `TokioTaskQueue`, shared by all workers.
pub struct JobReceiver {
    receiver: Mutex<mpsc::UnboundedReceiver<ProcessOrderJob>>,
    sender: mpsc::UnboundedSender<ProcessOrderJob>,
    pending: Arc<Pending>,
}

impl JobReceiver {
    pub async fn recv(&self) -> Option<Delivery> {
        let job = self.receiver.lock().await.recv().await?;
        Some(Delivery {
            job,
            sender: self.sender.clone(),
            pending: self.pending.clone(),
            acked: false,
        })
    }
}

/// A received job. Dropping it without `ack`, for example when the worker
/// panics, puts the job back on the queue.
pub struct Delivery {
    job: ProcessOrderJob,
    sender: mpsc::UnboundedSender<ProcessOrderJob>,
    pending: Arc<Pending>,
    acked: bool,
}

impl Delivery {
    pub fn job(&self) -> ProcessOrderJob {
        self.job
    }

    pub fn ack(mut self) {
        self.acked = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acked {
            self.pending.done();
        } else if self.sender.send(self.job).is_err() {
            self.pending.done();
        } else {
            debug!(incoming_order_id = self.job.incoming_order_id, "Job redelivered");
        }
    }
}

/// A fixed set of tokio tasks consuming a `JobReceiver`.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(workers: usize, receiver: JobReceiver, task: ProcessOrderTask) -> Self {
        let receiver = Arc::new(receiver);
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    while let Some(delivery) = receiver.recv().await {
                        let outcome = task.run(delivery.job()).await;
                        debug!(worker, ?outcome, "Job finished");
                        delivery.ack();
                    }
                })
            })
            .collect();
        Self { handles }
    }

    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_waits_for_ack() {
        let (queue, receiver) = TokioTaskQueue::channel();
        queue
            .enqueue(ProcessOrderJob::new(1), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queue.pending(), 1);

        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.job().incoming_order_id, 1);
        delivery.ack();
        queue.drain().await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered() {
        let (queue, receiver) = TokioTaskQueue::channel();
        queue
            .enqueue(ProcessOrderJob::new(5), Duration::ZERO)
            .await
            .unwrap();
        drop(receiver.recv().await.unwrap());
        let again = receiver.recv().await.unwrap();
        assert_eq!(again.job().incoming_order_id, 5);
        assert_eq!(queue.pending(), 1);
        again.ack();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_delayed_job_arrives_after_delay() {
        let (queue, receiver) = TokioTaskQueue::channel();
        let started = std::time::Instant::now();
        queue
            .enqueue(ProcessOrderJob::new(9), Duration::from_millis(30))
            .await
            .unwrap();
        let delivery = receiver.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(delivery.job().incoming_order_id, 9);
        delivery.ack();
    }
}
