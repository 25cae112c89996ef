//! CLI option structs and duration parsing.

use crate::sync::{ExecutionMode, SyncOptions};
use anyhow::Context;
use clap::Parser;
use resilience::RateLimiterConfig;
use std::time::Duration;
use sync_core::SyncMode;

/// Parse a duration string like "1h", "30m", "300s", "300" into a
/// [`Duration`]. Plain numbers are seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid hours value: {num_str}"))?;
        return Ok(Duration::from_secs(hours * 3600));
    }
    if let Some(num_str) = s.strip_suffix('m') {
        let minutes: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid minutes value: {num_str}"))?;
        return Ok(Duration::from_secs(minutes * 60));
    }
    if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid seconds value: {num_str}"))?;
        return Ok(Duration::from_secs(secs));
    }

    let secs: u64 = s
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    Ok(Duration::from_secs(secs))
}

/// Per-run sync options.
#[derive(Parser, Clone)]
pub struct SyncOpts {
    /// Requested page size; memory pressure may shrink pages below this
    #[arg(long, default_value = "100", env = "CRM_SYNC_PAGE_SIZE")]
    pub page_size: usize,

    /// Page safety cap (defaults to 20 for incremental, unbounded for full)
    #[arg(long)]
    pub max_pages: Option<u32>,

    /// Run even when the upstream health probe reports unhealthy
    #[arg(long)]
    pub force: bool,

    /// Defer instead of blocking when the rate budget is exhausted
    #[arg(long)]
    pub deferred: bool,

    /// Run-level timeout, e.g. "1h" or "90m"
    #[arg(long, default_value = "1h")]
    pub run_timeout: String,

    /// Per-call timeout, e.g. "30s"
    #[arg(long, default_value = "30s")]
    pub call_timeout: String,
}

impl SyncOpts {
    pub fn to_options(&self, mode: SyncMode) -> anyhow::Result<SyncOptions> {
        let base = match mode {
            SyncMode::Full => SyncOptions::full(),
            SyncMode::Incremental => SyncOptions::incremental(),
        };
        Ok(SyncOptions {
            page_size: self.page_size,
            max_pages: self.max_pages,
            execution: if self.deferred {
                ExecutionMode::Deferred
            } else {
                ExecutionMode::Blocking
            },
            force: self.force,
            run_timeout: parse_duration(&self.run_timeout)?,
            call_timeout: parse_duration(&self.call_timeout)?,
            ..base
        })
    }
}

/// Daily budget options for the rate limiter.
#[derive(Parser, Clone)]
pub struct BudgetOpts {
    /// Daily budget for read endpoints
    #[arg(long, default_value = "10000", env = "CRM_SYNC_READ_BUDGET")]
    pub read_daily_budget: i64,

    /// Daily budget for write endpoints
    #[arg(long, default_value = "10000", env = "CRM_SYNC_WRITE_BUDGET")]
    pub write_daily_budget: i64,
}

impl From<&BudgetOpts> for RateLimiterConfig {
    fn from(opts: &BudgetOpts) -> Self {
        RateLimiterConfig {
            read_daily_limit: opts.read_daily_budget,
            write_daily_limit: opts.write_daily_budget,
            ..Default::default()
        }
    }
}
