//! Per-resource-type cgroup controllers
//!
//! A [`Controller`] knows which hierarchy its resource lives in and how the
//! resource's sub-spec maps onto that hierarchy's control files. The generic
//! [`CgroupHandler`](crate::CgroupHandler) supplies everything else.

use async_trait::async_trait;
use std::fmt;

use corral_core::{
    ContainerSpec, ContainerStats, Error, EventKind, EventSpec, Hierarchy, ItemFailure,
    ResourceType, Result, StatsType, UpdatePolicy,
};
use corral_resource::EventProbe;

use crate::dir::CgroupDir;

pub mod cpu;
pub mod diskio;
pub mod global;
pub mod memory;
pub mod monitoring;
pub mod network;

pub use cpu::CpuController;
pub use diskio::DiskIoController;
pub use global::GlobalController;
pub use memory::MemoryController;
pub use monitoring::MonitoringController;
pub use network::NetworkController;

/// Resource-specific half of a cgroup-backed handler
#[async_trait]
pub trait Controller: Default + Send + Sync + fmt::Debug + 'static {
    /// Resource implemented
    const RESOURCE: ResourceType;

    /// Hierarchy holding this resource's groups
    const HIERARCHY: Hierarchy;

    /// Reject sub-specs the kernel would refuse, before anything is written
    fn validate(&self, _spec: &ContainerSpec) -> Result<()> {
        Ok(())
    }

    /// Write this resource's sub-spec to the group
    async fn apply(
        &self,
        dir: &CgroupDir,
        spec: &ContainerSpec,
        policy: UpdatePolicy,
    ) -> Result<()>;

    /// Fill this resource's sub-spec from the group's live settings
    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()>;

    /// Fill this resource's stats section
    async fn read_stats(
        &self,
        dir: &CgroupDir,
        stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()>;

    /// Whether events of `kind` can be watched for this resource
    fn understands(&self, _kind: EventKind) -> bool {
        false
    }

    /// Start watching for `kind`, described by `spec`
    ///
    /// Only called for kinds this controller [`understands`](Self::understands).
    async fn probe(
        &self,
        _dir: &CgroupDir,
        kind: EventKind,
        _spec: &EventSpec,
    ) -> Result<Box<dyn EventProbe>> {
        Err(Error::not_found(format!(
            "{} does not handle {kind} events",
            Self::RESOURCE
        )))
    }

    /// One-time tuning of the hierarchy root after mounting
    ///
    /// Best effort; failures are logged by the caller.
    async fn tune_root(&self, _root: &CgroupDir) -> Result<()> {
        Ok(())
    }
}

/// What an update does to one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change<T> {
    /// Write this value
    Set(T),
    /// Write the field's default
    Reset,
    /// Leave as is
    Keep,
}

impl<T> Change<T> {
    /// Resolve an optional spec field under `policy`
    pub(crate) fn of(field: Option<T>, policy: UpdatePolicy) -> Self {
        match (field, policy) {
            (Some(value), _) => Self::Set(value),
            (None, UpdatePolicy::Replace) => Self::Reset,
            (None, UpdatePolicy::Diff) => Self::Keep,
        }
    }
}

/// Ordered writes of one update, tracking what already went through
pub(crate) struct Changes<'a> {
    dir: &'a CgroupDir,
    resource: ResourceType,
    applied: Vec<&'static str>,
}

impl<'a> Changes<'a> {
    pub(crate) const fn new(dir: &'a CgroupDir, resource: ResourceType) -> Self {
        Self {
            dir,
            resource,
            applied: Vec::new(),
        }
    }

    /// Write `value` to `file` on behalf of spec field `field`
    ///
    /// A failure after earlier writes went through is reported as
    /// [`Error::Partial`], naming the applied fields.
    pub(crate) async fn write(
        &mut self,
        field: &'static str,
        file: &str,
        value: impl fmt::Display + Send,
    ) -> Result<()> {
        match self.dir.write(file, value).await {
            Ok(()) => {
                self.applied.push(field);
                Ok(())
            }
            Err(e) if self.applied.is_empty() => Err(e),
            Err(e) => {
                tracing::warn!(
                    resource = %self.resource,
                    path = %self.dir.path().display(),
                    field,
                    applied = ?self.applied,
                    error = %e,
                    "Update partially applied"
                );
                let mut failure = ItemFailure::new(field, &e);
                failure.message = format!(
                    "{}; already applied: {}",
                    failure.message,
                    self.applied.join(", ")
                );
                Err(Error::Partial {
                    kind: e.kind(),
                    failures: vec![failure],
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCgroupFs;
    use corral_core::{ErrorKind, InitSpec};
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn policy_decides_absent_fields() {
        assert_eq!(Change::of(Some(3), UpdatePolicy::Diff), Change::Set(3));
        assert_eq!(Change::of(Some(3), UpdatePolicy::Replace), Change::Set(3));
        assert_eq!(Change::<u32>::of(None, UpdatePolicy::Diff), Change::Keep);
        assert_eq!(Change::<u32>::of(None, UpdatePolicy::Replace), Change::Reset);
    }

    #[tokio::test]
    async fn failure_after_writes_lists_applied_fields() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let path = Path::new("/sys/fs/cgroup/cpu,cpuacct/job");
        let dir = CgroupDir::new(Arc::new(fs.clone()), path);
        dir.create().await.unwrap();
        fs.fail_writes(path.join("cpu.cfs_quota_us"), libc::EIO).await;

        let mut changes = Changes::new(&dir, ResourceType::Cpu);
        changes.write("shares", "cpu.shares", 100).await.unwrap();
        let err = changes
            .write("max_limit", "cpu.cfs_quota_us", 50_000)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.failures()[0].item, "max_limit");
        assert!(err.failures()[0].message.contains("already applied: shares"));
    }

    #[tokio::test]
    async fn first_failure_is_plain() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let dir = CgroupDir::new(
            Arc::new(fs.clone()),
            "/sys/fs/cgroup/cpu,cpuacct/missing",
        );

        let mut changes = Changes::new(&dir, ResourceType::Cpu);
        let err = changes.write("shares", "cpu.shares", 100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.failures().is_empty());
    }
}
