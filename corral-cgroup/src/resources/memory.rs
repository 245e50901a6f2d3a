//! Memory: hard, soft and swap limits, plus OOM and usage threshold events

use async_trait::async_trait;
use tracing::debug;

use corral_core::{
    ContainerSpec, ContainerStats, Error, ErrorKind, EventKind, EventSpec, Hierarchy, MemorySize,
    MemorySpec, MemoryStats, ResourceType, Result, StatsType, UpdatePolicy,
};
use corral_resource::EventProbe;

use super::{Change, Changes, Controller};
use crate::dir::CgroupDir;
use crate::probe::{OomProbe, ThresholdProbe};

const LIMIT: &str = "memory.limit_in_bytes";
const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const SWAP_LIMIT: &str = "memory.memsw.limit_in_bytes";
const USAGE: &str = "memory.usage_in_bytes";
const MAX_USAGE: &str = "memory.max_usage_in_bytes";
pub(crate) const OOM_CONTROL: &str = "memory.oom_control";
const STAT: &str = "memory.stat";
const USE_HIERARCHY: &str = "memory.use_hierarchy";

/// Granularity the kernel rounds limits to
pub const PAGE_SIZE: u64 = 4096;

/// Value the kernel reports for an unlimited setting
pub const UNLIMITED_BYTES: u64 = 0x7FFF_FFFF_FFFF_F000;

/// Memory controller
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryController;

/// Kernel representation of an optional limit
fn limit_value(limit: Option<MemorySize>) -> i64 {
    limit.map_or(-1, |size| i64::try_from(size.as_bytes()).unwrap_or(-1))
}

fn limit_bytes(limit: Option<MemorySize>) -> u64 {
    limit.map_or(UNLIMITED_BYTES, MemorySize::as_bytes)
}

fn from_kernel(bytes: u64) -> Option<MemorySize> {
    (bytes < UNLIMITED_BYTES).then(|| MemorySize::from_bytes(bytes))
}

impl MemoryController {
    async fn read_limit(dir: &CgroupDir, file: &str) -> Result<Option<MemorySize>> {
        Ok(from_kernel(dir.read_value(file).await?))
    }
}

#[async_trait]
impl Controller for MemoryController {
    const RESOURCE: ResourceType = ResourceType::Memory;
    const HIERARCHY: Hierarchy = Hierarchy::Memory;

    fn validate(&self, spec: &ContainerSpec) -> Result<()> {
        let Some(memory) = &spec.memory else {
            return Ok(());
        };

        for (field, value) in [
            ("limit", memory.limit),
            ("reservation", memory.reservation),
            ("swap_limit", memory.swap_limit),
        ] {
            if value.is_some_and(|v| v.is_zero() || v.as_bytes() >= UNLIMITED_BYTES) {
                return Err(Error::invalid(format!(
                    "Memory {field} must be positive and below {UNLIMITED_BYTES} bytes"
                )));
            }
        }

        if let (Some(limit), Some(swap)) = (memory.limit, memory.swap_limit) {
            if swap < limit {
                return Err(Error::invalid(format!(
                    "Memory swap limit {swap} is below the memory limit {limit}"
                )));
            }
        }

        Ok(())
    }

    /// Writes the hard and swap limits in whichever order keeps
    /// `limit <= swap_limit` true after every step
    async fn apply(&self, dir: &CgroupDir, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let memory = spec.memory.clone().unwrap_or_default();
        let mut changes = Changes::new(dir, Self::RESOURCE);

        let limit = match Change::of(memory.limit, policy) {
            Change::Set(size) => Some(Some(size)),
            Change::Reset => Some(None),
            Change::Keep => None,
        };
        let swap = match Change::of(memory.swap_limit, policy) {
            Change::Set(size) => Some(Some(size)),
            Change::Reset => Some(None),
            Change::Keep => None,
        };

        let swap = match (swap, dir.has_file(SWAP_LIMIT).await?) {
            (swap, true) => swap,
            (Some(Some(_)), false) => {
                return Err(Error::invalid("Swap accounting is not enabled on this machine"));
            }
            (_, false) => None,
        };

        let swap_first = match swap {
            Some(new_swap) => {
                let current: u64 = dir.read_value(SWAP_LIMIT).await?;
                limit_bytes(new_swap) >= current
            }
            None => false,
        };

        if swap_first {
            if let Some(new_swap) = swap {
                changes
                    .write("swap_limit", SWAP_LIMIT, limit_value(new_swap))
                    .await?;
            }
        }
        if let Some(new_limit) = limit {
            changes.write("limit", LIMIT, limit_value(new_limit)).await?;
        }
        if !swap_first {
            if let Some(new_swap) = swap {
                changes
                    .write("swap_limit", SWAP_LIMIT, limit_value(new_swap))
                    .await?;
            }
        }

        match Change::of(memory.reservation, policy) {
            Change::Set(size) => {
                changes
                    .write("reservation", SOFT_LIMIT, limit_value(Some(size)))
                    .await?;
            }
            Change::Reset => changes.write("reservation", SOFT_LIMIT, -1).await?,
            Change::Keep => {}
        }

        Ok(())
    }

    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        let swap_limit = if dir.has_file(SWAP_LIMIT).await? {
            Self::read_limit(dir, SWAP_LIMIT).await?
        } else {
            None
        };

        spec.memory = Some(MemorySpec {
            limit: Self::read_limit(dir, LIMIT).await?,
            reservation: Self::read_limit(dir, SOFT_LIMIT).await?,
            swap_limit,
        });
        Ok(())
    }

    async fn read_stats(
        &self,
        dir: &CgroupDir,
        stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()> {
        let usage = MemorySize::from_bytes(dir.read_value(USAGE).await?);
        let max_usage = MemorySize::from_bytes(dir.read_value(MAX_USAGE).await?);
        let limit = Self::read_limit(dir, LIMIT).await?;

        let oom_kills = match dir.read_keyed(OOM_CONTROL).await {
            Ok(control) => control.get("oom_kill").copied().unwrap_or(0),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let detail = match stats_type {
            StatsType::Summary => Default::default(),
            StatsType::Full => dir.read_keyed(STAT).await?,
        };

        debug!(
            usage_mb = usage.as_mb(),
            max_usage_mb = max_usage.as_mb(),
            oom_kills,
            "Memory stats"
        );

        output.memory = Some(MemoryStats {
            usage,
            max_usage,
            limit,
            oom_kills,
            detail,
        });
        Ok(())
    }

    fn understands(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::Oom | EventKind::MemoryThreshold)
    }

    async fn probe(
        &self,
        dir: &CgroupDir,
        kind: EventKind,
        spec: &EventSpec,
    ) -> Result<Box<dyn EventProbe>> {
        match (kind, spec.memory_threshold) {
            (EventKind::Oom, _) => Ok(Box::new(OomProbe::start(dir.clone()).await?)),
            (EventKind::MemoryThreshold, Some(threshold)) => {
                if threshold.usage.is_zero() {
                    return Err(Error::invalid("Memory threshold must be positive"));
                }
                Ok(Box::new(
                    ThresholdProbe::start(dir.clone(), threshold.usage).await?,
                ))
            }
            _ => Err(Error::not_found(format!("memory does not handle {kind} events"))),
        }
    }

    async fn tune_root(&self, root: &CgroupDir) -> Result<()> {
        // Children are charged to their parents
        root.write(USE_HIERARCHY, 1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCgroupFs;
    use corral_core::InitSpec;
    use std::path::Path;
    use std::sync::Arc;

    const GROUP: &str = "/sys/fs/cgroup/memory/job";

    async fn setup() -> (MockCgroupFs, CgroupDir) {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = CgroupDir::new(Arc::new(fs.clone()), GROUP);
        dir.create().await.unwrap();
        (fs, dir)
    }

    fn spec(limit: Option<u64>, swap: Option<u64>) -> ContainerSpec {
        ContainerSpec {
            memory: Some(MemorySpec {
                limit: limit.map(MemorySize::from_mb),
                reservation: None,
                swap_limit: swap.map(MemorySize::from_mb),
            }),
            ..Default::default()
        }
    }

    async fn current(dir: &CgroupDir) -> MemorySpec {
        let mut out = ContainerSpec::default();
        MemoryController.read_spec(dir, &mut out).await.unwrap();
        out.memory.unwrap()
    }

    #[test]
    fn validation() {
        let memory = MemoryController;
        assert!(memory.validate(&spec(Some(100), Some(200))).is_ok());

        let err = memory.validate(&spec(Some(200), Some(100))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(memory.validate(&spec(Some(0), None)).is_err());
    }

    #[tokio::test]
    async fn raising_and_lowering_keep_swap_above_limit() {
        let (_fs, dir) = setup().await;

        MemoryController
            .apply(&dir, &spec(Some(100), Some(200)), UpdatePolicy::Diff)
            .await
            .unwrap();

        // Raise both past the old swap limit
        MemoryController
            .apply(&dir, &spec(Some(400), Some(500)), UpdatePolicy::Diff)
            .await
            .unwrap();
        let memory = current(&dir).await;
        assert_eq!(memory.limit, Some(MemorySize::from_mb(400)));
        assert_eq!(memory.swap_limit, Some(MemorySize::from_mb(500)));

        // Lower both below the old limit
        MemoryController
            .apply(&dir, &spec(Some(50), Some(60)), UpdatePolicy::Diff)
            .await
            .unwrap();
        let memory = current(&dir).await;
        assert_eq!(memory.limit, Some(MemorySize::from_mb(50)));
        assert_eq!(memory.swap_limit, Some(MemorySize::from_mb(60)));
    }

    #[tokio::test]
    async fn kernel_rounding_is_reported() {
        let (_fs, dir) = setup().await;
        let odd = ContainerSpec {
            memory: Some(MemorySpec {
                limit: Some(MemorySize::from_bytes(10_000)),
                ..Default::default()
            }),
            ..Default::default()
        };

        MemoryController
            .apply(&dir, &odd, UpdatePolicy::Diff)
            .await
            .unwrap();
        assert_eq!(
            current(&dir).await.limit,
            Some(MemorySize::from_bytes(3 * PAGE_SIZE))
        );
    }

    #[tokio::test]
    async fn replace_returns_to_unlimited() {
        let (_fs, dir) = setup().await;
        MemoryController
            .apply(&dir, &spec(Some(100), Some(200)), UpdatePolicy::Diff)
            .await
            .unwrap();

        MemoryController
            .apply(&dir, &ContainerSpec::default(), UpdatePolicy::Replace)
            .await
            .unwrap();
        assert_eq!(current(&dir).await, MemorySpec::default());
    }

    #[tokio::test]
    async fn stats_read_counters() {
        let (fs, dir) = setup().await;
        let group = Path::new(GROUP);
        fs.set_file(group.join(USAGE), "1048576\n").await;
        fs.set_file(group.join(MAX_USAGE), "2097152\n").await;
        fs.set_file(
            group.join(OOM_CONTROL),
            "oom_kill_disable 0\nunder_oom 0\noom_kill 3\n",
        )
        .await;

        let mut stats = ContainerStats::default();
        MemoryController
            .read_stats(&dir, StatsType::Summary, &mut stats)
            .await
            .unwrap();
        let memory = stats.memory.unwrap();
        assert_eq!(memory.usage, MemorySize::from_mb(1));
        assert_eq!(memory.max_usage, MemorySize::from_mb(2));
        assert_eq!(memory.limit, None);
        assert_eq!(memory.oom_kills, 3);
        assert!(memory.detail.is_empty());

        let mut stats = ContainerStats::default();
        MemoryController
            .read_stats(&dir, StatsType::Full, &mut stats)
            .await
            .unwrap();
        assert_eq!(stats.memory.unwrap().detail["rss"], 0);
    }

    #[tokio::test]
    async fn only_one_threshold_shape_is_accepted() {
        let (_fs, dir) = setup().await;
        let err = MemoryController
            .probe(&dir, EventKind::MemoryThreshold, &EventSpec::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(MemoryController.understands(EventKind::Oom));
        assert!(!MemoryController.understands(EventKind::ContainerEmpty));
    }
}
