//! Process-wide map from resource type to its single factory

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use corral_core::{Error, InitSpec, ItemFailure, ResourceType, Result};

use crate::factory::ResourceHandlerFactory;

static GLOBAL: OnceLock<FactoryRegistry> = OnceLock::new();

/// One [`ResourceHandlerFactory`] per [`ResourceType`]
///
/// Built once at startup, then shared read-only. [`install`](Self::install)
/// publishes a registry process-wide exactly once.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: BTreeMap<ResourceType, Arc<dyn ResourceHandlerFactory>>,
}

impl FactoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the factory for its resource type
    ///
    /// # Errors
    /// [`ErrorKind::AlreadyExists`](corral_core::ErrorKind::AlreadyExists) if
    /// that type already has a factory.
    pub fn register(&mut self, factory: Arc<dyn ResourceHandlerFactory>) -> Result<()> {
        let resource = factory.resource_type();
        if self.factories.contains_key(&resource) {
            return Err(Error::already_exists(format!(
                "A {resource} factory is already registered"
            )));
        }

        tracing::debug!(resource = %resource, "Registered factory");
        self.factories.insert(resource, factory);
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, factory: Arc<dyn ResourceHandlerFactory>) -> Result<Self> {
        self.register(factory)?;
        Ok(self)
    }

    /// Factory for `resource`
    ///
    /// # Errors
    /// [`ErrorKind::NotFound`](corral_core::ErrorKind::NotFound) if none is
    /// registered.
    pub fn get(&self, resource: ResourceType) -> Result<Arc<dyn ResourceHandlerFactory>> {
        self.factories
            .get(&resource)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No {resource} factory registered")))
    }

    /// Registered resource types, in a stable order
    #[must_use]
    pub fn resource_types(&self) -> Vec<ResourceType> {
        self.factories.keys().copied().collect()
    }

    /// Run machine bootstrap on every factory
    ///
    /// All factories are attempted; failures are reported together.
    pub async fn init_machine(&self, spec: &InitSpec) -> Result<()> {
        let mut failures = Vec::new();
        for (resource, factory) in &self.factories {
            if let Err(e) = factory.init_machine(spec).await {
                tracing::warn!(resource = %resource, error = %e, "Machine init failed");
                failures.push(ItemFailure::new(resource.as_str(), &e));
            }
        }

        Error::partial(failures).map_or(Ok(()), Err)
    }

    /// Publish this registry process-wide
    ///
    /// # Errors
    /// [`ErrorKind::AlreadyExists`](corral_core::ErrorKind::AlreadyExists) if a
    /// registry was installed before.
    pub fn install(self) -> Result<&'static Self> {
        GLOBAL
            .set(self)
            .map_err(|_| Error::already_exists("A factory registry is already installed"))?;
        Self::global()
    }

    /// The installed registry
    ///
    /// # Errors
    /// [`ErrorKind::Unavailable`](corral_core::ErrorKind::Unavailable) before
    /// [`install`](Self::install).
    pub fn global() -> Result<&'static Self> {
        GLOBAL
            .get()
            .ok_or_else(|| Error::unavailable("No factory registry installed"))
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("resources", &self.resource_types())
            .finish()
    }
}
