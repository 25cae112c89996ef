//! Queued sync execution.
//!
//! The driver itself is a pure async function; this module is the thin
//! adapter that runs it on a worker task. Callers enqueue a job and get a
//! handle; the worker runs jobs strictly in order, re-runs deferred or
//! retryably-failed runs per the classifier's decision, and reports the
//! final result through the handle once.

use crate::result::SyncResult;
use crate::sync::{SyncDriver, SyncOptions};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use sync_core::EntityType;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Wait before resuming a run that deferred on rate budget.
const DEFER_RETRY_DELAY: Duration = Duration::from_secs(60);

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

struct Job {
    id: Uuid,
    entity_type: EntityType,
    options: SyncOptions,
    reply: oneshot::Sender<SyncResult>,
}

/// Handle to a queued run.
pub struct JobHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<SyncResult>,
}

impl JobHandle {
    /// Wait for the worker to report the final result.
    pub async fn result(self) -> anyhow::Result<SyncResult> {
        self.rx
            .await
            .context("worker stopped before reporting the job result")
    }
}

pub struct SyncWorker {
    tx: mpsc::Sender<Job>,
    handle: tokio::task::JoinHandle<()>,
}

impl SyncWorker {
    /// Spawn the worker loop. `max_attempts` bounds how many times one job
    /// is re-run across deferrals and retryable failures.
    pub fn spawn(driver: Arc<SyncDriver>, max_attempts: u32) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                tracing::info!(job_id = %job.id, entity_type = %job.entity_type, "job started");
                let result =
                    run_with_retries(&driver, job.entity_type, &job.options, max_attempts).await;
                if job.reply.send(result).is_err() {
                    tracing::debug!(job_id = %job.id, "job handle dropped before completion");
                }
            }
        });
        SyncWorker { tx, handle }
    }

    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        options: SyncOptions,
    ) -> anyhow::Result<JobHandle> {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job {
                id,
                entity_type,
                options,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("worker queue closed"))?;
        Ok(JobHandle { id, rx })
    }

    /// Stop accepting jobs and wait for the in-flight one to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        drop(self.tx);
        self.handle.await.context("worker task panicked")
    }
}

async fn run_with_retries(
    driver: &SyncDriver,
    entity_type: EntityType,
    options: &SyncOptions,
    max_attempts: u32,
) -> SyncResult {
    let mut partials: Vec<SyncResult> = Vec::new();
    let mut attempt = 1u32;

    loop {
        let result = driver.run(entity_type, options.clone()).await;

        if result.is_success() && result.deferred && attempt < max_attempts {
            tracing::info!(
                entity_type = %entity_type,
                attempt,
                "run deferred on rate budget, resuming later"
            );
            partials.push(result);
            tokio::time::sleep(DEFER_RETRY_DELAY).await;
            attempt += 1;
            continue;
        }

        if let Some(failure) = &result.failure {
            let budget = failure.max_retries.min(max_attempts);
            if failure.retryable && attempt < budget {
                let delay = failure
                    .retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_RETRY_DELAY);
                tracing::warn!(
                    entity_type = %entity_type,
                    attempt,
                    kind = %failure.kind,
                    delay_ms = delay.as_millis() as u64,
                    "run failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
        }

        // Final attempt: fold in the counts from earlier deferred spans
        // without letting their deferred marker mask the final state.
        let mut aggregate = result;
        let finally_deferred = aggregate.deferred;
        for partial in &partials {
            aggregate.merge(partial);
            aggregate.started_at = aggregate.started_at.min(partial.started_at);
        }
        aggregate.deferred = finally_deferred;
        return aggregate;
    }
}
