//! Cgroup-backed [`ResourceHandler`]

use async_trait::async_trait;
use std::fmt;
use std::time::SystemTime;

use corral_core::{
    ContainerName, ContainerSpec, ContainerStats, Error, ErrorKind, EventKind, EventSpec,
    HandlerEvent, NotificationId, ResourceType, Result, StatsType, ThreadId, UpdatePolicy,
};
use corral_resource::{
    DestroyError, HandlerState, Lifecycle, NotificationCallback, Notifier, NotifierConfig,
    ResourceHandler,
};

use crate::dir::CgroupDir;
use crate::resources::Controller;

/// Handler for one container's group in the hierarchy of controller `C`
pub struct CgroupHandler<C: Controller> {
    name: ContainerName,
    dir: CgroupDir,
    controller: C,
    lifecycle: Lifecycle,
    notifier: Notifier,
}

impl<C: Controller> CgroupHandler<C> {
    /// Handler for a freshly created group, pending [`create`](ResourceHandler::create)
    pub(crate) fn new(name: ContainerName, dir: CgroupDir, config: NotifierConfig) -> Self {
        Self::with_lifecycle(name, dir, config, Lifecycle::new())
    }

    /// Handler attached to an existing group
    pub(crate) fn attach(name: ContainerName, dir: CgroupDir, config: NotifierConfig) -> Self {
        let handler = Self::with_lifecycle(name, dir, config, Lifecycle::active());
        handler.emit(|container, resource, timestamp| HandlerEvent::Attached {
            container,
            resource,
            timestamp,
        });
        handler
    }

    fn with_lifecycle(
        name: ContainerName,
        dir: CgroupDir,
        config: NotifierConfig,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            name,
            dir,
            controller: C::default(),
            lifecycle,
            notifier: Notifier::new(config),
        }
    }

    /// The group this handler manages
    #[must_use]
    pub const fn dir(&self) -> &CgroupDir {
        &self.dir
    }

    fn emit(&self, event: impl FnOnce(ContainerName, ResourceType, SystemTime) -> HandlerEvent) {
        event(self.name.clone(), C::RESOURCE, SystemTime::now()).emit_trace();
    }

    /// The single event in `spec` this resource can watch
    fn watched_event(&self, spec: &EventSpec) -> Result<EventKind> {
        let handled: Vec<EventKind> = spec
            .kinds()
            .into_iter()
            .filter(|kind| self.controller.understands(*kind))
            .collect();

        match handled.as_slice() {
            [kind] => Ok(*kind),
            [] => Err(Error::not_found(format!(
                "No event in the spec is handled by {}",
                C::RESOURCE
            ))),
            _ => Err(Error::not_found(format!(
                "{} events handled by {} in one spec, expected exactly one",
                handled.len(),
                C::RESOURCE
            ))),
        }
    }

    /// Release the group; the handler stays usable if this fails
    async fn teardown(&self) -> Result<usize> {
        let transition = self
            .lifecycle
            .transition(HandlerState::Active, HandlerState::Destroyed)
            .await?;

        if self.name.is_root() {
            return Err(Error::invalid(format!(
                "The root container's {} state cannot be destroyed",
                C::RESOURCE
            )));
        }

        let paused = self.notifier.pause().await;
        self.dir.remove().await?;

        let cancelled = self.notifier.shutdown(paused).await;
        transition.commit();
        Ok(cancelled)
    }
}

impl<C: Controller> fmt::Debug for CgroupHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupHandler")
            .field("container", &self.name)
            .field("resource", &C::RESOURCE)
            .field("path", &self.dir.path())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: Controller> ResourceHandler for CgroupHandler<C> {
    fn container_name(&self) -> &ContainerName {
        &self.name
    }

    fn resource_type(&self) -> ResourceType {
        C::RESOURCE
    }

    async fn update(&self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let _active = self.lifecycle.enter().await?;
        self.controller.validate(spec)?;
        self.controller.apply(&self.dir, spec, policy).await?;

        self.emit(|container, resource, timestamp| HandlerEvent::Updated {
            container,
            resource,
            policy,
            timestamp,
        });
        Ok(())
    }

    async fn stats(&self, stats_type: StatsType, output: &mut ContainerStats) -> Result<()> {
        let _active = self.lifecycle.enter().await?;
        self.controller
            .read_stats(&self.dir, stats_type, output)
            .await
    }

    async fn spec(&self, spec: &mut ContainerSpec) -> Result<()> {
        let _active = self.lifecycle.enter().await?;
        self.controller.read_spec(&self.dir, spec).await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let transition = self
            .lifecycle
            .transition(HandlerState::Constructed, HandlerState::Active)
            .await?;

        self.controller.validate(spec)?;
        // A new group starts at kernel defaults, so only named fields matter
        self.controller
            .apply(&self.dir, spec, UpdatePolicy::Diff)
            .await?;

        transition.commit();
        self.emit(|container, resource, timestamp| HandlerEvent::Created {
            container,
            resource,
            timestamp,
        });
        Ok(())
    }

    async fn enter(&self, tids: &[ThreadId]) -> Result<()> {
        let _active = self.lifecycle.enter().await?;
        self.dir.enter(tids).await?;

        self.emit(|container, resource, timestamp| HandlerEvent::Entered {
            container,
            resource,
            tasks: tids.len(),
            timestamp,
        });
        Ok(())
    }

    async fn register_notification(
        &self,
        spec: &EventSpec,
        mut callback: NotificationCallback,
    ) -> Result<NotificationId> {
        let _active = self.lifecycle.enter().await?;
        let event = self.watched_event(spec)?;
        let probe = self.controller.probe(&self.dir, event, spec).await?;

        let id = NotificationId::next();
        let container = self.name.clone();
        let reporting: NotificationCallback = Box::new(move |status: Result<()>| {
            if let Err(e) = &status {
                if e.kind() != ErrorKind::Cancelled {
                    HandlerEvent::NotificationFailed {
                        container: container.clone(),
                        resource: C::RESOURCE,
                        id,
                        message: e.to_string(),
                        timestamp: SystemTime::now(),
                    }
                    .emit_trace();
                }
            }
            callback(status);
        });

        self.notifier.register(id, probe, reporting).await?;

        self.emit(|container, resource, timestamp| HandlerEvent::NotificationRegistered {
            container,
            resource,
            id,
            event,
            timestamp,
        });
        Ok(id)
    }

    async fn unregister_notification(&self, id: NotificationId) -> Result<()> {
        let _active = self.lifecycle.enter().await?;
        self.notifier.unregister(id).await
    }

    async fn destroy(self: Box<Self>) -> std::result::Result<(), DestroyError> {
        let outcome = self.teardown().await;
        match outcome {
            Ok(cancelled_notifications) => {
                self.emit(|container, resource, timestamp| HandlerEvent::Destroyed {
                    container,
                    resource,
                    cancelled_notifications,
                    timestamp,
                });
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    container = %self.name,
                    resource = %C::RESOURCE,
                    error = %error,
                    "Destroy failed, handler kept"
                );
                Err(DestroyError::new(self, error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{CpuController, MemoryController, MonitoringController};
    use crate::MockCgroupFs;
    use corral_core::{CpuSpec, InitSpec, MemoryThresholdEvent, MemorySize, OomEvent};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config() -> NotifierConfig {
        NotifierConfig::default().with_poll_interval(Duration::from_millis(5))
    }

    async fn active<C: Controller>(fs: &MockCgroupFs, mount: &str, name: &str) -> CgroupHandler<C> {
        let name = ContainerName::new(name).unwrap();
        let dir = CgroupDir::new(Arc::new(fs.clone()), name.resolve(mount.as_ref()));
        dir.create().await.unwrap();

        let handler = CgroupHandler::<C>::new(name, dir, config());
        handler.create(&ContainerSpec::default()).await.unwrap();
        handler
    }

    fn recorder() -> (NotificationCallback, mpsc::UnboundedReceiver<Result<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: NotificationCallback = Box::new(move |status: Result<()>| {
            let _ = tx.send(status);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn calls_before_create_are_rejected() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let name = ContainerName::new("/pending").unwrap();
        let dir = CgroupDir::new(
            Arc::new(fs.clone()),
            name.resolve("/sys/fs/cgroup/cpu,cpuacct".as_ref()),
        );
        let handler = CgroupHandler::<CpuController>::new(name, dir, config());

        let err = handler
            .update(&ContainerSpec::default(), UpdatePolicy::Diff)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn create_runs_once() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let handler = active::<CpuController>(&fs, "/sys/fs/cgroup/cpu,cpuacct", "/job").await;

        let err = handler.create(&ContainerSpec::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn invalid_update_changes_nothing() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let handler = active::<CpuController>(&fs, "/sys/fs/cgroup/cpu,cpuacct", "/job").await;
        let calls = fs.call_count().await;

        let bad = ContainerSpec {
            cpu: Some(CpuSpec {
                shares: Some(0),
                max_limit: None,
            }),
            ..Default::default()
        };
        let err = handler.update(&bad, UpdatePolicy::Diff).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(fs.call_count().await, calls);
    }

    #[tokio::test]
    async fn event_spec_must_name_one_handled_event() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let handler = active::<MemoryController>(&fs, "/sys/fs/cgroup/memory", "/job").await;

        let none = EventSpec::default();
        let (callback, _) = recorder();
        let err = handler
            .register_notification(&none, callback)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let two = EventSpec {
            oom: Some(OomEvent {}),
            memory_threshold: Some(MemoryThresholdEvent {
                usage: MemorySize::from_mb(1),
            }),
            container_empty: None,
        };
        let (callback, _) = recorder();
        let err = handler
            .register_notification(&two, callback)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let monitoring =
            active::<MonitoringController>(&fs, "/sys/fs/cgroup/perf_event", "/job").await;
        let oom = EventSpec {
            oom: Some(OomEvent {}),
            ..Default::default()
        };
        let (callback, _) = recorder();
        let err = monitoring
            .register_notification(&oom, callback)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn destroy_cancels_pending_notifications() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let handler = active::<MemoryController>(&fs, "/sys/fs/cgroup/memory", "/job").await;

        let oom = EventSpec {
            oom: Some(OomEvent {}),
            ..Default::default()
        };
        let (callback, mut rx) = recorder();
        handler.register_notification(&oom, callback).await.unwrap();

        Box::new(handler).destroy().await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(rx.recv().await.is_none());
        assert!(!fs.has_dir("/sys/fs/cgroup/memory/job").await);
    }

    #[tokio::test]
    async fn root_cannot_be_destroyed() {
        let fs = MockCgroupFs::mounted(&InitSpec::standard());
        let name = ContainerName::root();
        let dir = CgroupDir::new(
            Arc::new(fs.clone()),
            name.resolve("/sys/fs/cgroup/pids".as_ref()),
        );
        let handler: Box<dyn ResourceHandler> = Box::new(CgroupHandler::<
            crate::resources::GlobalController,
        >::attach(name, dir, config()));

        let err = handler.destroy().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Handed back intact
        let handler = err.into_handler();
        assert!(handler.container_name().is_root());
        assert!(handler.enter(&[]).await.is_ok());
    }
}
