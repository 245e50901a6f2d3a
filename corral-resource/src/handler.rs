//! Per-container, per-resource controller contract

use async_trait::async_trait;
use std::fmt;

use corral_core::{
    ContainerName, ContainerSpec, ContainerStats, Error, ErrorKind, EventSpec, NotificationId,
    ResourceType, Result, StatsType, ThreadId, UpdatePolicy,
};

use crate::notification::NotificationCallback;

/// Resource-specific logic bound to one (container, resource type) pair
///
/// Handlers are produced by a [`ResourceHandlerFactory`](crate::ResourceHandlerFactory)
/// and owned by the caller. They are the sole authority over their pair's
/// resource state while they exist.
///
/// # Thread Safety
/// Every `&self` operation may be called concurrently from multiple tasks.
/// [`destroy`](Self::destroy) consumes the handler, so no call can start
/// after it; implementations additionally wait for in-flight calls before
/// releasing backend state.
#[async_trait]
pub trait ResourceHandler: Send + Sync + fmt::Debug {
    /// Absolute name of the container this handler pertains to
    fn container_name(&self) -> &ContainerName;

    /// Resource managed by this handler
    fn resource_type(&self) -> ResourceType;

    /// Apply this resource's part of `spec`
    ///
    /// [`UpdatePolicy::Diff`] only touches fields present in the spec;
    /// [`UpdatePolicy::Replace`] resets every absent field to its default.
    async fn update(&self, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()>;

    /// Populate this resource's section of `output`
    ///
    /// Sections of other resources are left untouched. `Full` may be much
    /// more expensive than `Summary`.
    async fn stats(&self, stats_type: StatsType, output: &mut ContainerStats) -> Result<()>;

    /// Populate this resource's part of `spec` from the live configuration
    ///
    /// The backend's canonical values are reported, which may differ from
    /// what was last applied (e.g. kernel rounding).
    async fn spec(&self, spec: &mut ContainerSpec) -> Result<()>;

    /// Configure a freshly allocated handler; only called during creation
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Move the given tasks into this resource's control domain
    ///
    /// Tasks already inside are left as they are.
    async fn enter(&self, tids: &[ThreadId]) -> Result<()>;

    /// Watch for the single event named by `spec`
    ///
    /// The handler takes ownership of `callback` and invokes it from a
    /// separate task: `Ok(())` per event, an error if delivery breaks down,
    /// and a cancellation error once when the subscription ends early.
    ///
    /// # Errors
    /// [`ErrorKind::NotFound`] unless `spec` names exactly one event this
    /// resource understands.
    async fn register_notification(
        &self,
        spec: &EventSpec,
        callback: NotificationCallback,
    ) -> Result<NotificationId>;

    /// End a subscription, invoking its callback once with a cancellation
    async fn unregister_notification(&self, id: NotificationId) -> Result<()>;

    /// Release all backend state and consume the handler
    ///
    /// On failure the handler is handed back inside [`DestroyError`],
    /// still fully usable.
    async fn destroy(self: Box<Self>) -> std::result::Result<(), DestroyError>;
}

/// Failed teardown, carrying the still-live handler back to the caller
pub struct DestroyError {
    handler: Box<dyn ResourceHandler>,
    error: Error,
}

impl DestroyError {
    /// Pair a handler with the error that kept it alive
    #[must_use]
    pub fn new(handler: Box<dyn ResourceHandler>, error: Error) -> Self {
        Self { handler, error }
    }

    /// Category of the underlying error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// The underlying error
    #[must_use]
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Take back the handler and the error
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn ResourceHandler>, Error) {
        (self.handler, self.error)
    }

    /// Take back the handler, dropping the error
    #[must_use]
    pub fn into_handler(self) -> Box<dyn ResourceHandler> {
        self.handler
    }
}

impl fmt::Debug for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("container", self.handler.container_name())
            .field("resource", &self.handler.resource_type())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to destroy {} for {}: {}",
            self.handler.resource_type(),
            self.handler.container_name(),
            self.error
        )
    }
}

impl std::error::Error for DestroyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<DestroyError> for Error {
    fn from(err: DestroyError) -> Self {
        err.error
    }
}
