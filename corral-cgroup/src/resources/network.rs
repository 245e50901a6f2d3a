//! Network: traffic class tagging through `net_cls`

use async_trait::async_trait;

use corral_core::{
    ContainerSpec, ContainerStats, Hierarchy, NetworkSpec, ResourceType, Result, StatsType,
    UpdatePolicy,
};

use super::{Change, Changes, Controller};
use crate::dir::CgroupDir;

const CLASS_ID: &str = "net_cls.classid";

/// Network controller
///
/// Only tags traffic; shaping happens outside the container runtime, so
/// there is no network stats section.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkController;

#[async_trait]
impl Controller for NetworkController {
    const RESOURCE: ResourceType = ResourceType::Network;
    const HIERARCHY: Hierarchy = Hierarchy::NetCls;

    async fn apply(&self, dir: &CgroupDir, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let network = spec.network.clone().unwrap_or_default();
        let mut changes = Changes::new(dir, Self::RESOURCE);

        match Change::of(network.class_id, policy) {
            Change::Set(class_id) => changes.write("class_id", CLASS_ID, class_id).await,
            Change::Reset => changes.write("class_id", CLASS_ID, 0).await,
            Change::Keep => Ok(()),
        }
    }

    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        let class_id: u32 = dir.read_value(CLASS_ID).await?;
        spec.network = Some(NetworkSpec {
            class_id: (class_id != 0).then_some(class_id),
        });
        Ok(())
    }

    async fn read_stats(
        &self,
        _dir: &CgroupDir,
        _stats_type: StatsType,
        _output: &mut ContainerStats,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCgroupFs;
    use corral_core::InitSpec;
    use std::sync::Arc;

    #[tokio::test]
    async fn class_id_round_trip_and_reset() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = CgroupDir::new(Arc::new(fs.clone()), "/sys/fs/cgroup/net_cls/job");
        dir.create().await.unwrap();

        let tagged = ContainerSpec {
            network: Some(NetworkSpec {
                class_id: Some(0x0010_0001),
            }),
            ..Default::default()
        };
        NetworkController
            .apply(&dir, &tagged, UpdatePolicy::Diff)
            .await
            .unwrap();

        let mut out = ContainerSpec::default();
        NetworkController.read_spec(&dir, &mut out).await.unwrap();
        assert_eq!(out.network, tagged.network);

        NetworkController
            .apply(&dir, &ContainerSpec::default(), UpdatePolicy::Replace)
            .await
            .unwrap();
        let mut out = ContainerSpec::default();
        NetworkController.read_spec(&dir, &mut out).await.unwrap();
        assert_eq!(out.network, Some(NetworkSpec::default()));

        let mut stats = ContainerStats::default();
        NetworkController
            .read_stats(&dir, StatsType::Full, &mut stats)
            .await
            .unwrap();
        assert_eq!(stats, ContainerStats::default());
    }
}
