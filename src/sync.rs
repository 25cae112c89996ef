//! Paginated sync driver.
//!
//! One invocation synchronizes one entity type: fetch a page, bill the
//! rate budget, process records through the shared per-record step, adapt
//! the next page size to memory pressure, repeat until the remote signals
//! no further cursor or a termination condition fires (page safety cap,
//! memory critical, circuit open, run deadline).
//!
//! # Execution modes
//!
//! The same loop serves both execution shapes. A blocking run sleeps out
//! insufficient rate budget and returns the final result to the caller. A
//! deferred run never sleeps on budget: it ends early with a partial result
//! marked `deferred`, and the scheduling layer (see [`crate::worker`])
//! decides when to try again.
//!
//! # Ordering
//!
//! Pages are fetched and processed strictly in sequence; the continuation
//! cursor makes parallel page fetches incorrect. Runs for different entity
//! types are independent and may overlap freely.

use crate::client::{CrmClient, FetchedPage, PageRequest};
use crate::processor::RecordProcessor;
use crate::result::SyncResult;
use resilience::{
    classify, CircuitBreaker, CircuitError, ClassifiedError, EndpointClass, ErrorKind,
    HealthProbe, HealthStatus, MemoryGovernor, RateLimitError, RateLimiter,
};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{ApiError, EntityType, SortMode, SyncMode};

/// Operation kind under which sync fetches are circuit-tracked.
pub const SYNC_OP: &str = "sync";

/// Safety cap on incremental runs so a busy dataset cannot loop forever.
const INCREMENTAL_PAGE_CAP: u32 = 20;

/// How a caller wants rate-budget exhaustion handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Sleep out the recommended wait and continue.
    Blocking,
    /// End the run early with a partial, `deferred` result.
    Deferred,
}

/// Options for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Requested page size; the memory governor may shrink below this but
    /// never grows past it.
    pub page_size: usize,
    /// Page cap override; defaults to 20 for incremental, unbounded for
    /// full.
    pub max_pages: Option<u32>,
    pub execution: ExecutionMode,
    /// Run even when the health probe reports Unhealthy.
    pub force: bool,
    pub run_timeout: Duration,
    pub call_timeout: Duration,
}

impl SyncOptions {
    pub fn full() -> Self {
        SyncOptions {
            mode: SyncMode::Full,
            page_size: 100,
            max_pages: None,
            execution: ExecutionMode::Blocking,
            force: false,
            run_timeout: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn incremental() -> Self {
        SyncOptions {
            mode: SyncMode::Incremental,
            ..Self::full()
        }
    }

    /// Full syncs walk oldest-first so pagination stays stable while the
    /// dataset changes underneath; incremental syncs want the newest
    /// modifications first.
    pub fn sort(&self) -> SortMode {
        match self.mode {
            SyncMode::Full => SortMode::OldestFirst,
            SyncMode::Incremental => SortMode::RecentFirst,
        }
    }

    pub fn page_cap(&self) -> u32 {
        self.max_pages.unwrap_or(match self.mode {
            SyncMode::Full => u32::MAX,
            SyncMode::Incremental => INCREMENTAL_PAGE_CAP,
        })
    }

    pub fn validate(&self) -> Result<(), ClassifiedError> {
        if self.page_size == 0 || self.page_size > 500 {
            return Err(ClassifiedError::validation(format!(
                "page_size must be in 1..=500, got {}",
                self.page_size
            )));
        }
        if self.max_pages == Some(0) {
            return Err(ClassifiedError::validation("max_pages must be positive"));
        }
        if self.run_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(ClassifiedError::validation("timeouts must be positive"));
        }
        Ok(())
    }
}

pub struct SyncDriver {
    client: Arc<dyn CrmClient>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    governor: Arc<MemoryGovernor>,
    health: Arc<HealthProbe>,
    processor: RecordProcessor,
}

impl SyncDriver {
    pub fn new(
        client: Arc<dyn CrmClient>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        governor: Arc<MemoryGovernor>,
        health: Arc<HealthProbe>,
        processor: RecordProcessor,
    ) -> Self {
        SyncDriver {
            client,
            limiter,
            breaker,
            governor,
            health,
            processor,
        }
    }

    /// Run one sync for `entity_type`. Always returns a structured result;
    /// run-level failures are carried inside it.
    pub async fn run(&self, entity_type: EntityType, options: SyncOptions) -> SyncResult {
        let mut result = SyncResult::started(entity_type);

        if let Err(err) = options.validate() {
            result.fail(&err);
            return self.finish(result).await;
        }

        self.health.check().await;
        if !options.force && self.health.status().await == HealthStatus::Unhealthy {
            tracing::warn!(entity_type = %entity_type, "upstream unhealthy, skipping run");
            result.fail(&ClassifiedError {
                kind: ErrorKind::Connection,
                retryable: true,
                retry_after: Some(Duration::from_secs(60)),
                max_retries: 3,
                message: "upstream reported unhealthy and run was not forced".into(),
            });
            return self.finish(result).await;
        }

        tracing::info!(
            entity_type = %entity_type,
            mode = ?options.mode,
            page_size = options.page_size,
            "starting sync run"
        );

        let deadline = tokio::time::Instant::now() + options.run_timeout;
        let mut plan = self.governor.initial_plan(options.page_size);
        let mut cursor: Option<String> = None;
        let mut rate_wait_attempt = 0u32;
        let page_cap = options.page_cap();

        loop {
            if result.pages_fetched >= page_cap {
                tracing::info!(pages = result.pages_fetched, "page safety cap reached");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("run deadline exceeded, returning partial result");
                result.fail(&ClassifiedError::generic("run deadline exceeded"));
                break;
            }

            // Rate gate before touching the wire.
            match self.limiter.can_consume(EndpointClass::Read, 1).await {
                Err(err) => {
                    result.fail(&ClassifiedError::generic(format!(
                        "rate budget store failed: {err}"
                    )));
                    break;
                }
                Ok(false) => match options.execution {
                    ExecutionMode::Deferred => {
                        tracing::info!("rate budget exhausted, deferring remainder of run");
                        result.deferred = true;
                        break;
                    }
                    ExecutionMode::Blocking => {
                        rate_wait_attempt += 1;
                        let wait = self.limiter.wait_duration(rate_wait_attempt);
                        tracing::info!(wait_ms = wait.as_millis() as u64, "waiting out rate budget");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                },
                Ok(true) => {}
            }

            if let Err(err) = self.breaker.guard(SYNC_OP).await {
                result.fail(&circuit_to_classified(err));
                break;
            }

            let request = PageRequest {
                entity_type,
                cursor: cursor.clone(),
                page_size: plan.current_size,
                sort: options.sort(),
            };
            let page = match self.fetch_page(&request, &options, &mut result).await {
                Ok(page) => page,
                Err(err) => {
                    result.fail(&err);
                    break;
                }
            };
            result.pages_fetched += 1;
            self.governor.start_page();

            let FetchedPage {
                records,
                next_cursor,
                meta: _,
            } = page;

            let stats = self.processor.process(entity_type, &records).await;
            result.synced += stats.synced;
            result.updated += stats.updated;
            result.skipped += stats.skipped;
            result.errors += stats.errors;

            if self.governor.should_force_gc() {
                tracing::debug!("memory above alert level, releasing page buffers");
                drop(records);
            }

            let sample = self.governor.sample();
            if self.governor.is_critical(&sample) {
                result.fail(&ClassifiedError::memory(format!(
                    "memory usage at {:.0}% of limit, aborting run",
                    sample.usage_ratio * 100.0
                )));
                break;
            }

            plan = self.governor.plan_next_batch(&plan);

            match next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.finish(result).await
    }

    /// Fetch one page, billing the budget per attempt and retrying within
    /// the classifier's policy. The attempt count of the final page fetch is
    /// recorded on the result.
    async fn fetch_page(
        &self,
        request: &PageRequest,
        options: &SyncOptions,
        result: &mut SyncResult,
    ) -> Result<FetchedPage, ClassifiedError> {
        let mut attempt = 1u32;
        loop {
            if let Err(err) = self.limiter.consume(EndpointClass::Read, 1).await {
                match err {
                    RateLimitError::Exhausted { retry_in, .. } => {
                        result.last_fetch_attempts = attempt;
                        return Err(ClassifiedError {
                            kind: ErrorKind::RateLimit,
                            retryable: true,
                            retry_after: Some(retry_in.min(Duration::from_secs(300))),
                            max_retries: 3,
                            message: "daily budget exhausted mid-run".into(),
                        });
                    }
                    RateLimitError::Store(err) => {
                        result.last_fetch_attempts = attempt;
                        return Err(ClassifiedError::generic(format!(
                            "rate budget store failed: {err}"
                        )));
                    }
                }
            }

            let outcome =
                tokio::time::timeout(options.call_timeout, self.client.fetch_page(request)).await;
            let api_result =
                outcome.unwrap_or_else(|_| Err(ApiError::Timeout(options.call_timeout)));

            match api_result {
                Ok(page) => {
                    if let Err(err) = self.limiter.observe(EndpointClass::Read, &page.meta).await {
                        tracing::debug!(error = %err, "could not adopt provider rate headers");
                    }
                    if let Err(err) = self.breaker.record_success(SYNC_OP).await {
                        tracing::debug!(error = %err, "could not record circuit success");
                    }
                    result.last_fetch_attempts = attempt;
                    return Ok(page);
                }
                Err(api) => {
                    if let Some(meta) = api.rate_meta() {
                        let _ = self.limiter.observe(EndpointClass::Read, meta).await;
                    }
                    let opened = matches!(
                        self.breaker.record_failure(SYNC_OP).await,
                        Ok(resilience::CircuitState::Open)
                    );
                    let classified = classify(&api);
                    if opened || !classified.should_retry(attempt) {
                        result.last_fetch_attempts = attempt;
                        return Err(classified);
                    }
                    let delay = classified.retry_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = %classified.kind,
                        "page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Stamp completion and attach component snapshots, success or not.
    async fn finish(&self, mut result: SyncResult) -> SyncResult {
        result.completed_at = Some(chrono::Utc::now());
        result.rate = self.limiter.status(EndpointClass::Read).await.ok();
        result.memory = Some(self.governor.stats());
        result.health = Some(self.health.snapshot().await);

        tracing::info!(
            entity_type = %result.entity_type,
            synced = result.synced,
            errors = result.errors,
            pages = result.pages_fetched,
            success = result.is_success(),
            deferred = result.deferred,
            "sync run finished"
        );
        result
    }
}

pub(crate) fn circuit_to_classified(err: CircuitError) -> ClassifiedError {
    match err {
        CircuitError::Open { kind, retry_in } => ClassifiedError::generic(format!(
            "circuit open for {kind}, retry in {}s",
            retry_in.as_secs()
        )),
        CircuitError::Store(err) => {
            ClassifiedError::generic(format!("circuit state store failed: {err}"))
        }
    }
}
