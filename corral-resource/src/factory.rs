//! Per-resource-type handler factory contract

use async_trait::async_trait;

use corral_core::{ContainerName, ContainerSpec, InitSpec, ResourceType, Result};

use crate::handler::ResourceHandler;

/// Creates and looks up [`ResourceHandler`]s for one resource type
///
/// Exactly one factory exists per resource type per runtime; the
/// [`FactoryRegistry`](crate::FactoryRegistry) enforces this. Factories hold
/// any resource-wide logic, including one-time machine setup.
///
/// # Thread Safety
/// `get` and `create` for different containers may run concurrently and must
/// not block each other. `init_machine` may race with itself and converges
/// to a single initialization.
#[async_trait]
pub trait ResourceHandlerFactory: Send + Sync {
    /// Resource implemented by this factory
    fn resource_type(&self) -> ResourceType;

    /// Attach to the resource state of an existing container
    ///
    /// # Errors
    /// [`ErrorKind::NotFound`](corral_core::ErrorKind::NotFound) if the
    /// container has no state for this resource.
    async fn get(&self, container_name: &ContainerName) -> Result<Box<dyn ResourceHandler>>;

    /// Provision this resource for a new container
    ///
    /// Only this resource's part of `spec` is used. Either a fully usable
    /// handler is returned, or nothing is left behind.
    ///
    /// # Errors
    /// [`ErrorKind::AlreadyExists`](corral_core::ErrorKind::AlreadyExists) if
    /// the container already has state for this resource.
    async fn create(
        &self,
        container_name: &ContainerName,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn ResourceHandler>>;

    /// Idempotent machine bootstrap for this resource
    ///
    /// Repeating it with an equivalent spec is a no-op; an incompatible spec
    /// after a successful init is an error.
    async fn init_machine(&self, spec: &InitSpec) -> Result<()>;
}
