//! Process memory sampling and adaptive batch planning.
//!
//! Large transfers are the third failure domain: a page of records that
//! fits comfortably at 500 rows can exhaust the process under field-heavy
//! entities. The governor samples process memory between pages and resizes
//! the next fetch accordingly; past the critical level it aborts the run
//! instead of shrinking forever.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use sysinfo::System;

/// One observation of process memory against its limit. Recomputed on
/// demand, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    /// used/limit as a fraction in 0.0..=1.0.
    pub usage_ratio: f64,
    pub sampled_at: DateTime<Utc>,
}

impl MemorySample {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        let usage_ratio = if limit_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / limit_bytes as f64
        };
        MemorySample {
            used_bytes,
            limit_bytes,
            usage_ratio,
            sampled_at: Utc::now(),
        }
    }
}

/// Source of memory observations, swappable for tests.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Samples the current process RSS from `/proc/self/status` and the memory
/// limit from the cgroup (when present) or total system memory via sysinfo.
pub struct SystemSampler {
    system: Mutex<System>,
    limit_override: Option<u64>,
}

impl SystemSampler {
    pub fn new() -> Self {
        SystemSampler {
            system: Mutex::new(System::new()),
            limit_override: None,
        }
    }

    /// Use a fixed memory limit instead of the detected one, e.g. when the
    /// operator knows the container allowance better than the host does.
    pub fn with_limit(limit_bytes: u64) -> Self {
        SystemSampler {
            system: Mutex::new(System::new()),
            limit_override: Some(limit_bytes),
        }
    }

    fn detect_limit(&self) -> u64 {
        if let Some(limit) = self.limit_override {
            return limit;
        }
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system
                    .cgroup_limits()
                    .map(|limits| limits.total_memory)
                    .filter(|total| *total > 0)
                    .unwrap_or_else(|| system.total_memory())
            }
            Err(_) => 0,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemSampler {
    fn sample(&self) -> MemorySample {
        MemorySample::new(read_rss_bytes(), self.detect_limit())
    }
}

/// Current process resident set size from /proc/self/status.
fn read_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .map(|kb| kb * 1024)
                })
        })
        .unwrap_or(0)
}

/// Sampler reporting a fixed usage ratio, for tests and rehearsal runs.
pub struct FixedSampler {
    pub usage_ratio: f64,
}

impl FixedSampler {
    pub fn new(usage_ratio: f64) -> Self {
        FixedSampler { usage_ratio }
    }
}

impl MemorySampler for FixedSampler {
    fn sample(&self) -> MemorySample {
        let limit = 1_000_000_000u64;
        MemorySample::new((limit as f64 * self.usage_ratio) as u64, limit)
    }
}

/// Page-size plan carried between pages of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub current_size: usize,
    pub min_size: usize,
    pub max_size: usize,
}

impl BatchPlan {
    fn clamped(current: usize, min: usize, max: usize) -> Self {
        BatchPlan {
            current_size: current.clamp(min, max),
            min_size: min,
            max_size: max,
        }
    }
}

/// Escalation level derived from a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLevel {
    Normal,
    Alert,
    Critical,
}

#[derive(Debug, Clone)]
pub struct MemoryGovernorConfig {
    /// Usage ratio above which the next batch is halved.
    pub shrink_threshold: f64,
    /// Usage ratio that triggers the force-GC hint.
    pub alert_threshold: f64,
    /// Usage ratio at which the run aborts.
    pub critical_threshold: f64,
    pub min_batch: usize,
    pub max_batch: usize,
    /// Multiplier applied when growing back after a comfortable page.
    pub grow_factor: f64,
}

impl Default for MemoryGovernorConfig {
    fn default() -> Self {
        MemoryGovernorConfig {
            shrink_threshold: 0.80,
            alert_threshold: 0.85,
            critical_threshold: 0.95,
            min_batch: 10,
            max_batch: 500,
            grow_factor: 1.25,
        }
    }
}

/// Stats view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub sample: MemorySample,
    pub level: MemoryLevel,
    pub shrink_threshold: f64,
    pub critical_threshold: f64,
}

pub struct MemoryGovernor {
    sampler: Box<dyn MemorySampler>,
    config: MemoryGovernorConfig,
    gc_hinted_this_page: AtomicBool,
}

impl MemoryGovernor {
    pub fn new(sampler: Box<dyn MemorySampler>, config: MemoryGovernorConfig) -> Self {
        MemoryGovernor {
            sampler,
            config,
            gc_hinted_this_page: AtomicBool::new(false),
        }
    }

    pub fn sample(&self) -> MemorySample {
        self.sampler.sample()
    }

    pub fn level(&self, sample: &MemorySample) -> MemoryLevel {
        if sample.usage_ratio >= self.config.critical_threshold {
            MemoryLevel::Critical
        } else if sample.usage_ratio >= self.config.alert_threshold {
            MemoryLevel::Alert
        } else {
            MemoryLevel::Normal
        }
    }

    /// Initial plan for a run: start at the requested page size, capped by
    /// the configured maximum.
    pub fn initial_plan(&self, requested: usize) -> BatchPlan {
        let max = self.config.max_batch.min(requested.max(self.config.min_batch));
        BatchPlan::clamped(requested, self.config.min_batch, max)
    }

    /// Recompute the page size for the next fetch. Called between pages
    /// only; size never changes mid-page.
    pub fn plan_next_batch(&self, plan: &BatchPlan) -> BatchPlan {
        let sample = self.sample();
        if sample.usage_ratio > self.config.shrink_threshold {
            let halved = (plan.current_size / 2).max(plan.min_size);
            if halved < plan.current_size {
                tracing::warn!(
                    usage_ratio = format!("{:.2}", sample.usage_ratio),
                    from = plan.current_size,
                    to = halved,
                    "memory pressure, shrinking next batch"
                );
            }
            BatchPlan::clamped(halved, plan.min_size, plan.max_size)
        } else {
            let grown = ((plan.current_size as f64 * self.config.grow_factor) as usize)
                .max(plan.current_size + 1)
                .min(plan.max_size);
            BatchPlan::clamped(grown, plan.min_size, plan.max_size)
        }
    }

    /// Mark the start of a page so the force-GC hint can fire again.
    pub fn start_page(&self) {
        self.gc_hinted_this_page.store(false, Ordering::Relaxed);
    }

    /// Whether the caller should release buffers explicitly. Fires at most
    /// once per page, and only above the alert threshold.
    pub fn should_force_gc(&self) -> bool {
        let sample = self.sample();
        if sample.usage_ratio < self.config.alert_threshold {
            return false;
        }
        !self.gc_hinted_this_page.swap(true, Ordering::Relaxed)
    }

    /// Whether the current sample is past the abort level.
    pub fn is_critical(&self, sample: &MemorySample) -> bool {
        self.level(sample) == MemoryLevel::Critical
    }

    pub fn stats(&self) -> MemoryStats {
        let sample = self.sample();
        let level = self.level(&sample);
        MemoryStats {
            sample,
            level,
            shrink_threshold: self.config.shrink_threshold,
            critical_threshold: self.config.critical_threshold,
        }
    }
}
