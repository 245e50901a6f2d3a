//! Cgroup-backed [`ResourceHandlerFactory`] and the standard registry

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

use corral_core::{
    CgroupMount, ContainerName, ContainerSpec, Error, InitSpec, ResourceType, Result,
};
use corral_resource::{FactoryRegistry, NotifierConfig, ResourceHandler, ResourceHandlerFactory};

use crate::dir::CgroupDir;
use crate::fs::CgroupFs;
use crate::handler::CgroupHandler;
use crate::resources::{
    Controller, CpuController, DiskIoController, GlobalController, MemoryController,
    MonitoringController, NetworkController,
};

/// Settings shared by every cgroup factory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Notification delivery of the handlers produced
    pub notifier: NotifierConfig,
}

impl FactoryConfig {
    /// Set notification delivery settings
    #[must_use]
    pub const fn with_notifier(mut self, notifier: NotifierConfig) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Factory for the resource of controller `C`
///
/// Containers map onto directories of `C`'s hierarchy: `/a/b` lives at
/// `<mount>/a/b`, and the root container is the mount point itself.
pub struct CgroupFactory<C: Controller> {
    fs: Arc<dyn CgroupFs>,
    config: FactoryConfig,
    mount: OnceCell<CgroupMount>,
    /// Layout accepted by the first successful machine init
    init: OnceCell<CgroupMount>,
    _controller: PhantomData<fn() -> C>,
}

/// CPU factory
pub type CpuFactory = CgroupFactory<CpuController>;
/// Memory factory
pub type MemoryFactory = CgroupFactory<MemoryController>;
/// Block I/O factory
pub type DiskIoFactory = CgroupFactory<DiskIoController>;
/// Network factory
pub type NetworkFactory = CgroupFactory<NetworkController>;
/// Monitoring factory
pub type MonitoringFactory = CgroupFactory<MonitoringController>;
/// Container-wide factory
pub type GlobalFactory = CgroupFactory<GlobalController>;

impl<C: Controller> CgroupFactory<C> {
    /// Create a factory over `fs`
    #[must_use]
    pub fn new(fs: Arc<dyn CgroupFs>, config: FactoryConfig) -> Self {
        Self {
            fs,
            config,
            mount: OnceCell::new(),
            init: OnceCell::new(),
            _controller: PhantomData,
        }
    }

    /// Mount recorded by machine init or discovered on the host
    async fn discover(&self) -> Result<Option<CgroupMount>> {
        Ok(self
            .fs
            .mounts()
            .await?
            .into_iter()
            .find(|m| m.contains(C::HIERARCHY)))
    }

    /// Mount point of this factory's hierarchy
    async fn mount_path(&self) -> Result<PathBuf> {
        if let Some(mount) = self.mount.get() {
            return Ok(mount.mount_path.clone());
        }

        let mount = self
            .mount
            .get_or_try_init(|| async {
                self.discover().await?.ok_or_else(|| {
                    Error::unavailable(format!(
                        "The {} hierarchy is not mounted; run machine init first",
                        C::HIERARCHY
                    ))
                })
            })
            .await?;
        Ok(mount.mount_path.clone())
    }

    async fn dir_for(&self, name: &ContainerName) -> Result<CgroupDir> {
        let mount = self.mount_path().await?;
        Ok(CgroupDir::new(Arc::clone(&self.fs), name.resolve(&mount)))
    }

    /// Mount (or adopt) the hierarchy and tune its root
    async fn bootstrap(&self, wanted: &CgroupMount) -> Result<CgroupMount> {
        let mount = match self.discover().await? {
            Some(existing) if existing.is_equivalent(wanted) => {
                tracing::debug!(
                    resource = %C::RESOURCE,
                    path = %existing.mount_path.display(),
                    "Hierarchy already mounted"
                );
                existing
            }
            Some(existing) => {
                // e.g. net_cls co-mounted with net_prio under a combined name
                tracing::info!(
                    resource = %C::RESOURCE,
                    path = %existing.mount_path.display(),
                    requested = %wanted.mount_path.display(),
                    "Adopting hierarchy mounted elsewhere"
                );
                existing
            }
            None => {
                self.fs.mount(wanted).await?;
                wanted.clone()
            }
        };

        let root = CgroupDir::new(Arc::clone(&self.fs), mount.mount_path.clone());
        if let Err(e) = C::default().tune_root(&root).await {
            tracing::debug!(
                resource = %C::RESOURCE,
                error = %e,
                "Could not tune hierarchy root (may be OK)"
            );
        }

        Ok(mount)
    }
}

impl<C: Controller> fmt::Debug for CgroupFactory<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupFactory")
            .field("resource", &C::RESOURCE)
            .field("mount", &self.mount.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: Controller> ResourceHandlerFactory for CgroupFactory<C> {
    fn resource_type(&self) -> ResourceType {
        C::RESOURCE
    }

    async fn get(&self, container_name: &ContainerName) -> Result<Box<dyn ResourceHandler>> {
        let dir = self.dir_for(container_name).await?;
        if !dir.is_group().await? {
            return Err(Error::not_found(format!(
                "{container_name} has no {} state",
                C::RESOURCE
            )));
        }

        Ok(Box::new(CgroupHandler::<C>::attach(
            container_name.clone(),
            dir,
            self.config.notifier,
        )))
    }

    async fn create(
        &self,
        container_name: &ContainerName,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>> {
        C::default().validate(spec)?;

        let dir = self.dir_for(container_name).await?;
        dir.create().await?;

        let handler = CgroupHandler::<C>::new(container_name.clone(), dir, self.config.notifier);
        if let Err(e) = handler.create(spec).await {
            // Leave nothing behind
            if let Err(cleanup) = handler.dir().remove().await {
                tracing::warn!(
                    container = %container_name,
                    resource = %C::RESOURCE,
                    error = %cleanup,
                    "Could not roll back failed create"
                );
            }
            return Err(e);
        }

        Ok(Box::new(handler))
    }

    async fn init_machine(&self, spec: &InitSpec) -> Result<()> {
        let wanted = spec.mount_for(C::HIERARCHY).ok_or_else(|| {
            Error::invalid(format!(
                "Machine spec has no mount for the {} hierarchy",
                C::HIERARCHY
            ))
        })?;

        let accepted = self
            .init
            .get_or_try_init(|| async {
                let mount = self.bootstrap(wanted).await?;
                let active = self.mount.get_or_init(|| async { mount }).await;
                tracing::info!(
                    resource = %C::RESOURCE,
                    path = %active.mount_path.display(),
                    "Machine initialized"
                );
                Ok::<_, Error>(wanted.clone())
            })
            .await?;

        if !accepted.is_equivalent(wanted) {
            return Err(Error::already_exists(format!(
                "The {} hierarchy was initialized for {} ({}), not {} ({})",
                C::HIERARCHY,
                accepted.mount_path.display(),
                accepted.options(),
                wanted.mount_path.display(),
                wanted.options()
            )));
        }
        Ok(())
    }
}

/// Registry holding a cgroup factory for every resource type
pub fn standard_registry(fs: &Arc<dyn CgroupFs>, config: FactoryConfig) -> Result<FactoryRegistry> {
    FactoryRegistry::new()
        .with(Arc::new(CpuFactory::new(Arc::clone(fs), config)))?
        .with(Arc::new(MemoryFactory::new(Arc::clone(fs), config)))?
        .with(Arc::new(DiskIoFactory::new(Arc::clone(fs), config)))?
        .with(Arc::new(NetworkFactory::new(Arc::clone(fs), config)))?
        .with(Arc::new(MonitoringFactory::new(Arc::clone(fs), config)))?
        .with(Arc::new(GlobalFactory::new(Arc::clone(fs), config)))
}
