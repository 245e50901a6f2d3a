//! Monitoring: group membership for perf counters, and the container-empty event

use async_trait::async_trait;

use corral_core::{
    ContainerSpec, ContainerStats, EventKind, EventSpec, Hierarchy, MonitoringSpec,
    MonitoringStats, ResourceType, Result, StatsType, UpdatePolicy,
};
use corral_resource::EventProbe;

use super::Controller;
use crate::dir::CgroupDir;
use crate::probe::EmptyProbe;

/// Monitoring controller
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitoringController;

#[async_trait]
impl Controller for MonitoringController {
    const RESOURCE: ResourceType = ResourceType::Monitoring;
    const HIERARCHY: Hierarchy = Hierarchy::PerfEvent;

    async fn apply(&self, _dir: &CgroupDir, _spec: &ContainerSpec, _policy: UpdatePolicy) -> Result<()> {
        Ok(())
    }

    async fn read_spec(&self, _dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        spec.monitoring = Some(MonitoringSpec {});
        Ok(())
    }

    async fn read_stats(
        &self,
        dir: &CgroupDir,
        stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()> {
        let tasks = dir.tasks().await?;
        output.monitoring = Some(MonitoringStats {
            task_count: tasks.len() as u64,
            tasks: match stats_type {
                StatsType::Summary => Vec::new(),
                StatsType::Full => tasks,
            },
        });
        Ok(())
    }

    fn understands(&self, kind: EventKind) -> bool {
        kind == EventKind::ContainerEmpty
    }

    async fn probe(
        &self,
        dir: &CgroupDir,
        _kind: EventKind,
        _spec: &EventSpec,
    ) -> Result<Box<dyn EventProbe>> {
        Ok(Box::new(EmptyProbe::start(dir.clone()).await?))
    }
}
