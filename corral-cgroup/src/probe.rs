//! Event probes over cgroup control files
//!
//! Each probe remembers what it saw last and reports how many times its
//! condition fired since. Baselines are taken at registration, so
//! conditions that held before a subscription existed are not reported.

use async_trait::async_trait;
use tracing::debug;

use corral_core::{MemorySize, Result};
use corral_resource::EventProbe;

use crate::dir::CgroupDir;
use crate::resources::memory::OOM_CONTROL;

const MEMORY_USAGE: &str = "memory.usage_in_bytes";

/// Out-of-memory kills, from the `oom_kill` counter in `memory.oom_control`
#[derive(Debug)]
pub struct OomProbe {
    dir: CgroupDir,
    kills: u64,
}

impl OomProbe {
    /// Start counting from the current number of kills
    pub async fn start(dir: CgroupDir) -> Result<Self> {
        let kills = read_kills(&dir).await?;
        Ok(Self { dir, kills })
    }
}

async fn read_kills(dir: &CgroupDir) -> Result<u64> {
    Ok(dir
        .read_keyed(OOM_CONTROL)
        .await?
        .get("oom_kill")
        .copied()
        .unwrap_or(0))
}

#[async_trait]
impl EventProbe for OomProbe {
    async fn poll(&mut self) -> Result<u64> {
        let kills = read_kills(&self.dir).await?;
        let fired = kills.saturating_sub(self.kills);
        self.kills = kills;

        if fired > 0 {
            debug!(path = %self.dir.path().display(), fired, "OOM kills observed");
        }
        Ok(fired)
    }
}

/// Memory usage rising to or above a threshold
///
/// Fires once per upward crossing; usage has to drop below the threshold
/// again before the next event.
#[derive(Debug)]
pub struct ThresholdProbe {
    dir: CgroupDir,
    threshold: MemorySize,
    above: bool,
}

impl ThresholdProbe {
    /// Start watching; usage already above the threshold does not fire
    pub async fn start(dir: CgroupDir, threshold: MemorySize) -> Result<Self> {
        let usage = read_usage(&dir).await?;
        Ok(Self {
            dir,
            threshold,
            above: usage >= threshold,
        })
    }
}

async fn read_usage(dir: &CgroupDir) -> Result<MemorySize> {
    Ok(MemorySize::from_bytes(dir.read_value(MEMORY_USAGE).await?))
}

#[async_trait]
impl EventProbe for ThresholdProbe {
    async fn poll(&mut self) -> Result<u64> {
        let usage = read_usage(&self.dir).await?;
        let above = usage >= self.threshold;
        let crossed = above && !self.above;
        self.above = above;

        if crossed {
            debug!(
                path = %self.dir.path().display(),
                usage = %usage,
                threshold = %self.threshold,
                "Memory threshold crossed"
            );
        }
        Ok(u64::from(crossed))
    }
}

/// Last task leaving the group
///
/// Fires on every transition from populated to empty.
#[derive(Debug)]
pub struct EmptyProbe {
    dir: CgroupDir,
    populated: bool,
}

impl EmptyProbe {
    /// Start watching from the current membership
    pub async fn start(dir: CgroupDir) -> Result<Self> {
        let populated = !dir.tasks().await?.is_empty();
        Ok(Self { dir, populated })
    }
}

#[async_trait]
impl EventProbe for EmptyProbe {
    async fn poll(&mut self) -> Result<u64> {
        let populated = !self.dir.tasks().await?.is_empty();
        let emptied = self.populated && !populated;
        self.populated = populated;

        if emptied {
            debug!(path = %self.dir.path().display(), "Group became empty");
        }
        Ok(u64::from(emptied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCgroupFs;
    use corral_core::{ErrorKind, InitSpec, ThreadId};
    use std::path::Path;
    use std::sync::Arc;

    async fn group(fs: &MockCgroupFs, path: &str) -> CgroupDir {
        let dir = CgroupDir::new(Arc::new(fs.clone()), path);
        dir.create().await.unwrap();
        dir
    }

    fn oom_control(kills: u64) -> String {
        format!("oom_kill_disable 0\nunder_oom 0\noom_kill {kills}\n")
    }

    #[tokio::test]
    async fn oom_reports_new_kills_only() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let path = Path::new("/sys/fs/cgroup/memory/job");
        let dir = group(&fs, "/sys/fs/cgroup/memory/job").await;
        fs.set_file(path.join(OOM_CONTROL), oom_control(2)).await;

        let mut probe = OomProbe::start(dir).await.unwrap();
        assert_eq!(probe.poll().await.unwrap(), 0);

        fs.set_file(path.join(OOM_CONTROL), oom_control(5)).await;
        assert_eq!(probe.poll().await.unwrap(), 3);
        assert_eq!(probe.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn threshold_fires_per_crossing() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let usage = Path::new("/sys/fs/cgroup/memory/job").join(MEMORY_USAGE);
        let dir = group(&fs, "/sys/fs/cgroup/memory/job").await;

        let mut probe = ThresholdProbe::start(dir, MemorySize::from_mb(10))
            .await
            .unwrap();

        fs.set_file(&usage, MemorySize::from_mb(12).as_bytes().to_string())
            .await;
        assert_eq!(probe.poll().await.unwrap(), 1);
        assert_eq!(probe.poll().await.unwrap(), 0);

        fs.set_file(&usage, "0").await;
        assert_eq!(probe.poll().await.unwrap(), 0);
        fs.set_file(&usage, MemorySize::from_mb(10).as_bytes().to_string())
            .await;
        assert_eq!(probe.poll().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_fires_when_last_task_leaves() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = group(&fs, "/sys/fs/cgroup/perf_event/job").await;
        let tid = ThreadId::from_raw(77);
        fs.spawn_task(tid).await;
        dir.enter(&[tid]).await.unwrap();

        let mut probe = EmptyProbe::start(dir.clone()).await.unwrap();
        assert_eq!(probe.poll().await.unwrap(), 0);

        fs.exit_task(tid).await;
        assert_eq!(probe.poll().await.unwrap(), 1);
        assert_eq!(probe.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn removed_group_breaks_the_probe() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = group(&fs, "/sys/fs/cgroup/perf_event/job").await;

        let mut probe = EmptyProbe::start(dir.clone()).await.unwrap();
        dir.remove().await.unwrap();

        let err = probe.poll().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
