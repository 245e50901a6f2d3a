//! Container-wide limits through the `pids` hierarchy

use async_trait::async_trait;

use corral_core::{
    ContainerSpec, ContainerStats, Error, GlobalSpec, GlobalStats, Hierarchy, ResourceType,
    Result, StatsType, UpdatePolicy,
};

use super::{Change, Changes, Controller};
use crate::dir::CgroupDir;

const MAX: &str = "pids.max";
const CURRENT: &str = "pids.current";
const UNLIMITED: &str = "max";

/// Container-wide controller
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalController;

async fn read_max(dir: &CgroupDir) -> Result<Option<u64>> {
    let raw = dir.read(MAX).await?;
    match raw.trim() {
        UNLIMITED => Ok(None),
        value => value.parse().map(Some).map_err(|e| Error::CGroup {
            message: format!("Malformed {MAX} in {}: {e}", dir.path().display()),
        }),
    }
}

#[async_trait]
impl Controller for GlobalController {
    const RESOURCE: ResourceType = ResourceType::Global;
    const HIERARCHY: Hierarchy = Hierarchy::Pids;

    fn validate(&self, spec: &ContainerSpec) -> Result<()> {
        if spec
            .global
            .as_ref()
            .is_some_and(|g| g.max_tasks == Some(0))
        {
            return Err(Error::invalid("Task limit must be positive"));
        }
        Ok(())
    }

    async fn apply(&self, dir: &CgroupDir, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let global = spec.global.clone().unwrap_or_default();
        let mut changes = Changes::new(dir, Self::RESOURCE);

        match Change::of(global.max_tasks, policy) {
            Change::Set(max) => changes.write("max_tasks", MAX, max).await,
            Change::Reset => changes.write("max_tasks", MAX, UNLIMITED).await,
            Change::Keep => Ok(()),
        }
    }

    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        spec.global = Some(GlobalSpec {
            max_tasks: read_max(dir).await?,
        });
        Ok(())
    }

    async fn read_stats(
        &self,
        dir: &CgroupDir,
        _stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()> {
        output.global = Some(GlobalStats {
            task_count: dir.read_value(CURRENT).await?,
            max_tasks: read_max(dir).await?,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCgroupFs;
    use corral_core::{ErrorKind, InitSpec};
    use std::path::Path;
    use std::sync::Arc;

    const GROUP: &str = "/sys/fs/cgroup/pids/job";

    fn limit(max_tasks: Option<u64>) -> ContainerSpec {
        ContainerSpec {
            global: Some(GlobalSpec { max_tasks }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn limit_and_reset() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = CgroupDir::new(Arc::new(fs.clone()), GROUP);
        dir.create().await.unwrap();

        GlobalController
            .apply(&dir, &limit(Some(64)), UpdatePolicy::Diff)
            .await
            .unwrap();
        fs.set_file(Path::new(GROUP).join(CURRENT), "3\n").await;

        let mut stats = ContainerStats::default();
        GlobalController
            .read_stats(&dir, StatsType::Summary, &mut stats)
            .await
            .unwrap();
        assert_eq!(
            stats.global,
            Some(GlobalStats {
                task_count: 3,
                max_tasks: Some(64),
            })
        );

        GlobalController
            .apply(&dir, &limit(None), UpdatePolicy::Replace)
            .await
            .unwrap();
        let mut out = ContainerSpec::default();
        GlobalController.read_spec(&dir, &mut out).await.unwrap();
        assert_eq!(out.global, Some(GlobalSpec { max_tasks: None }));
    }

    #[test]
    fn zero_limit_is_invalid() {
        let err = GlobalController.validate(&limit(Some(0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
