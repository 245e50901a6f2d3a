//! CPU: `cpu.shares` weight and CFS bandwidth ceiling

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use corral_core::{
    ContainerSpec, ContainerStats, CpuCores, CpuSpec, CpuStats, Error, ErrorKind, Hierarchy,
    ResourceType, Result, StatsType, UpdatePolicy,
};

use super::{Change, Changes, Controller};
use crate::dir::CgroupDir;

const SHARES: &str = "cpu.shares";
const QUOTA: &str = "cpu.cfs_quota_us";
const PERIOD: &str = "cpu.cfs_period_us";
const STAT: &str = "cpu.stat";
const USAGE: &str = "cpuacct.usage";
const USAGE_PERCPU: &str = "cpuacct.usage_percpu";

/// Default relative weight
pub const DEFAULT_SHARES: u64 = 1024;
/// Smallest weight the kernel keeps
pub const MIN_SHARES: u64 = 2;
/// Largest weight the kernel keeps
pub const MAX_SHARES: u64 = 262_144;

/// Smallest CFS quota accepted, in microseconds
const MIN_QUOTA_US: i64 = 1000;

/// CPU controller
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuController;

#[async_trait]
impl Controller for CpuController {
    const RESOURCE: ResourceType = ResourceType::Cpu;
    const HIERARCHY: Hierarchy = Hierarchy::Cpu;

    fn validate(&self, spec: &ContainerSpec) -> Result<()> {
        let Some(cpu) = &spec.cpu else {
            return Ok(());
        };

        if let Some(shares) = cpu.shares {
            if !(MIN_SHARES..=MAX_SHARES).contains(&shares) {
                return Err(Error::invalid(format!(
                    "CPU shares must be within {MIN_SHARES}..={MAX_SHARES}, got {shares}"
                )));
            }
        }

        if let Some(cores) = cpu.max_limit {
            if !cores.as_f64().is_finite() || cores.to_quota().0 < MIN_QUOTA_US {
                return Err(Error::invalid(format!(
                    "CPU limit must be at least {:.2} cores, got {cores}",
                    CpuCores::from_quota(MIN_QUOTA_US, CpuCores::PERIOD_US)
                        .map_or(0.0, CpuCores::as_f64)
                )));
            }
        }

        Ok(())
    }

    async fn apply(&self, dir: &CgroupDir, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let cpu = spec.cpu.clone().unwrap_or_default();
        let mut changes = Changes::new(dir, Self::RESOURCE);

        match Change::of(cpu.shares, policy) {
            Change::Set(shares) => changes.write("shares", SHARES, shares).await?,
            Change::Reset => changes.write("shares", SHARES, DEFAULT_SHARES).await?,
            Change::Keep => {}
        }

        match Change::of(cpu.max_limit, policy) {
            Change::Set(cores) => {
                let (quota, period) = cores.to_quota();
                changes.write("max_limit", PERIOD, period).await?;
                changes.write("max_limit", QUOTA, quota).await?;
            }
            Change::Reset => changes.write("max_limit", QUOTA, -1).await?,
            Change::Keep => {}
        }

        Ok(())
    }

    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        let shares = dir.read_value(SHARES).await?;
        let quota: i64 = dir.read_value(QUOTA).await?;
        let period: i64 = dir.read_value(PERIOD).await?;

        spec.cpu = Some(CpuSpec {
            shares: Some(shares),
            max_limit: CpuCores::from_quota(quota, period),
        });
        Ok(())
    }

    /// Reads usage from cpuacct and throttling from cpu.stat
    ///
    /// Format of cpu.stat:
    /// ```text
    /// nr_periods 456
    /// nr_throttled 123
    /// throttled_time 45678000
    /// ```
    async fn read_stats(
        &self,
        dir: &CgroupDir,
        stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()> {
        let throttling = dir.read_keyed(STAT).await?;

        // cpuacct is usually co-mounted, but not guaranteed
        let usage = match dir.read_value::<u64>(USAGE).await {
            Ok(ns) => Duration::from_nanos(ns),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %dir.path().display(), "No cpuacct in this hierarchy");
                Duration::ZERO
            }
            Err(e) => return Err(e),
        };

        let per_cpu_usage = match stats_type {
            StatsType::Summary => Vec::new(),
            StatsType::Full => match dir.read(USAGE_PERCPU).await {
                Ok(raw) => raw
                    .split_whitespace()
                    .filter_map(|ns| ns.parse().ok())
                    .map(Duration::from_nanos)
                    .collect(),
                Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e),
            },
        };

        let stats = CpuStats {
            usage,
            throttled_periods: throttling.get("nr_throttled").copied().unwrap_or(0),
            throttled_time: Duration::from_nanos(
                throttling.get("throttled_time").copied().unwrap_or(0),
            ),
            per_cpu_usage,
        };

        debug!(
            usage_ns = stats.usage.as_nanos(),
            throttled_periods = stats.throttled_periods,
            "CPU stats"
        );

        output.cpu = Some(stats);
        Ok(())
    }
}
