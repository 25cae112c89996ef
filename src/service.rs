//! Assembled sync service.
//!
//! Wires the four resilience components, the shared per-record step, the
//! driver, and the webhook processor around caller-provided collaborators,
//! and exposes the operator surface: run a sync, apply a webhook event,
//! report status, reset a stateful component.

use crate::client::{ClientProbe, CrmClient};
use crate::migrator::MergeRelationMigrator;
use crate::processor::RecordProcessor;
use crate::result::SyncResult;
use crate::store::{EntityStore, LinkStore};
use crate::sync::{SyncDriver, SyncOptions, SYNC_OP};
use crate::webhook::{WebhookEvent, WebhookOptions, WebhookProcessor, WEBHOOK_OP};
use chrono::{DateTime, Utc};
use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CounterStore, EndpointClass,
    HealthProbe, HealthProbeConfig, HealthSnapshot, MemoryGovernor, MemoryGovernorConfig,
    MemorySampler, MemoryStats, RateLimiter, RateLimiterConfig, RateSnapshot, SystemSampler,
};
use serde::Serialize;
use std::sync::Arc;
use sync_core::{EntityType, TypeParseError};

/// Configuration for the assembled service; each section defaults to the
/// component's own defaults.
pub struct ServiceConfig {
    pub rate: RateLimiterConfig,
    pub circuit: CircuitBreakerConfig,
    pub memory: MemoryGovernorConfig,
    pub health: HealthProbeConfig,
    pub webhook: WebhookOptions,
    /// Override the memory sampler, e.g. with a fixed one for rehearsals.
    pub memory_sampler: Option<Box<dyn MemorySampler>>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            rate: RateLimiterConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            memory: MemoryGovernorConfig::default(),
            health: HealthProbeConfig::default(),
            webhook: WebhookOptions::default(),
            memory_sampler: None,
        }
    }
}

/// Aggregated component state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub rate: Vec<RateSnapshot>,
    pub circuits: Vec<CircuitSnapshot>,
    pub memory: MemoryStats,
    pub health: HealthSnapshot,
}

/// Stateful component targeted by an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    All,
    RateBudgets,
    Circuits,
    Health,
}

impl std::str::FromStr for ResetTarget {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(ResetTarget::All),
            "rate" | "rate-budgets" => Ok(ResetTarget::RateBudgets),
            "circuits" | "circuit" => Ok(ResetTarget::Circuits),
            "health" => Ok(ResetTarget::Health),
            other => Err(TypeParseError(format!("unknown reset target: {other}"))),
        }
    }
}

pub struct SyncService {
    driver: Arc<SyncDriver>,
    webhooks: WebhookProcessor,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    governor: Arc<MemoryGovernor>,
    health: Arc<HealthProbe>,
}

impl SyncService {
    pub fn new(
        client: Arc<dyn CrmClient>,
        entities: Arc<dyn EntityStore>,
        links: Arc<dyn LinkStore>,
        counters: Arc<dyn CounterStore>,
        config: ServiceConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(counters.clone(), config.rate));
        let breaker = Arc::new(CircuitBreaker::new(counters, config.circuit));
        let sampler = config
            .memory_sampler
            .unwrap_or_else(|| Box::new(SystemSampler::new()));
        let governor = Arc::new(MemoryGovernor::new(sampler, config.memory));
        let health = Arc::new(HealthProbe::new(
            Arc::new(ClientProbe::new(client.clone())),
            config.health,
        ));

        let processor = RecordProcessor::new(entities.clone());
        let driver = Arc::new(SyncDriver::new(
            client,
            limiter.clone(),
            breaker.clone(),
            governor.clone(),
            health.clone(),
            processor.clone(),
        ));
        let webhooks = WebhookProcessor::new(
            processor,
            entities,
            MergeRelationMigrator::new(links),
            limiter.clone(),
            breaker.clone(),
            config.webhook,
        );

        SyncService {
            driver,
            webhooks,
            limiter,
            breaker,
            governor,
            health,
        }
    }

    /// Run one sync inline and block on the result.
    pub async fn run_sync(&self, entity_type: EntityType, options: SyncOptions) -> SyncResult {
        self.driver.run(entity_type, options).await
    }

    /// Apply one webhook event.
    pub async fn apply_webhook(&self, event: WebhookEvent) -> SyncResult {
        self.webhooks.apply(event).await
    }

    /// The driver, for callers that schedule runs on a worker queue.
    pub fn driver(&self) -> Arc<SyncDriver> {
        self.driver.clone()
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        let mut rate = Vec::new();
        for class in EndpointClass::ALL {
            rate.push(self.limiter.status(class).await?);
        }
        let mut circuits = Vec::new();
        for kind in [SYNC_OP, WEBHOOK_OP] {
            circuits.push(self.breaker.status(kind).await?);
        }
        Ok(StatusReport {
            generated_at: Utc::now(),
            rate,
            circuits,
            memory: self.governor.stats(),
            health: self.health.snapshot().await,
        })
    }

    /// Administrative recovery for stateful components.
    pub async fn reset(&self, target: ResetTarget) -> anyhow::Result<()> {
        if matches!(target, ResetTarget::All | ResetTarget::RateBudgets) {
            for class in EndpointClass::ALL {
                self.limiter.reset(class).await?;
            }
        }
        if matches!(target, ResetTarget::All | ResetTarget::Circuits) {
            for kind in [SYNC_OP, WEBHOOK_OP] {
                self.breaker.reset(kind).await?;
            }
        }
        if matches!(target, ResetTarget::All | ResetTarget::Health) {
            self.health.reset().await;
        }
        Ok(())
    }
}
