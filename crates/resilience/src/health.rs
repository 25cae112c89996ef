//! Upstream health probing with a cached verdict.
//!
//! The probe issues one lightweight remote call per check, keeps a bounded
//! history of outcomes, and derives a verdict from the recent window:
//! consecutive failures past the threshold mean Unhealthy, elevated average
//! latency means Degraded, and a single acceptable success recovers to
//! Healthy. The verdict is advisory; the sync driver skips a run on
//! Unhealthy only when the run is not forced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
}

/// Upstream verdict derived from recent probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Degraded => f.write_str("degraded"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// The single lightweight remote call a check performs.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    /// Consecutive failed checks before the upstream is Unhealthy.
    pub failure_threshold: u32,
    /// Average latency past which the upstream is Degraded.
    pub degradation_threshold: Duration,
    /// How long a derived verdict is served from cache.
    pub status_ttl: Duration,
    /// Ring-buffer capacity for recent records.
    pub history: usize,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        HealthProbeConfig {
            failure_threshold: 3,
            degradation_threshold: Duration::from_millis(1500),
            status_ttl: Duration::from_secs(60),
            history: 20,
        }
    }
}

/// Point-in-time health view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub checks_recorded: usize,
    pub consecutive_failures: u32,
    pub average_latency_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

struct ProbeState {
    records: VecDeque<HealthRecord>,
    consecutive_failures: u32,
    cached: Option<(HealthStatus, Instant)>,
}

pub struct HealthProbe {
    transport: Arc<dyn ProbeTransport>,
    config: HealthProbeConfig,
    state: Mutex<ProbeState>,
}

impl HealthProbe {
    pub fn new(transport: Arc<dyn ProbeTransport>, config: HealthProbeConfig) -> Self {
        HealthProbe {
            transport,
            config,
            state: Mutex::new(ProbeState {
                records: VecDeque::new(),
                consecutive_failures: 0,
                cached: None,
            }),
        }
    }

    /// Perform one probe call and record its outcome.
    pub async fn check(&self) -> HealthRecord {
        let started = Instant::now();
        let outcome = self.transport.ping().await;
        let latency = started.elapsed();

        let record = HealthRecord {
            checked_at: Utc::now(),
            success: outcome.is_ok(),
            latency_ms: latency.as_millis() as u64,
        };
        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "health probe failed");
        }

        let mut state = self.state.lock().await;
        if record.success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
        state.records.push_back(record.clone());
        while state.records.len() > self.config.history {
            state.records.pop_front();
        }
        // A fresh observation always invalidates the cached verdict.
        state.cached = None;
        record
    }

    fn derive(&self, state: &ProbeState) -> HealthStatus {
        if state.consecutive_failures >= self.config.failure_threshold {
            return HealthStatus::Unhealthy;
        }
        match average_success_latency(&state.records) {
            Some(avg) if avg > self.config.degradation_threshold => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    /// Current verdict, served from cache within the TTL.
    pub async fn status(&self) -> HealthStatus {
        let mut state = self.state.lock().await;
        if let Some((status, at)) = state.cached {
            if at.elapsed() < self.config.status_ttl {
                return status;
            }
        }
        let status = self.derive(&state);
        state.cached = Some((status, Instant::now()));
        status
    }

    pub async fn is_healthy(&self) -> bool {
        self.status().await == HealthStatus::Healthy
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().await;
        HealthSnapshot {
            status: self.derive(&state),
            checks_recorded: state.records.len(),
            consecutive_failures: state.consecutive_failures,
            average_latency_ms: average_success_latency(&state.records)
                .map(|d| d.as_millis() as u64),
            last_checked_at: state.records.back().map(|r| r.checked_at),
        }
    }

    /// Administrative reset: drops history and the cached verdict.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.records.clear();
        state.consecutive_failures = 0;
        state.cached = None;
        tracing::info!("health probe reset");
    }
}

fn average_success_latency(records: &VecDeque<HealthRecord>) -> Option<Duration> {
    let latencies: Vec<u64> = records
        .iter()
        .filter(|r| r.success)
        .map(|r| r.latency_ms)
        .collect();
    if latencies.is_empty() {
        return None;
    }
    let avg = latencies.iter().sum::<u64>() / latencies.len() as u64;
    Some(Duration::from_millis(avg))
}
