//! Resource handler contract for container resource isolation
//!
//! Defines the traits every resource backend implements, the per-handler
//! lifecycle gate, the notification subsystem, and the process-wide
//! registry of factories.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod factory;
pub mod handler;
pub mod lifecycle;
pub mod notification;
pub mod registry;

pub use factory::ResourceHandlerFactory;
pub use handler::{DestroyError, ResourceHandler};
pub use lifecycle::{HandlerState, Lifecycle, Transition};
pub use notification::{EventProbe, NotificationCallback, Notifier, NotifierConfig, Paused};
pub use registry::FactoryRegistry;

// Re-export commonly used types
pub use corral_core::{
    ContainerName, ContainerSpec, ContainerStats, Error, ErrorKind, EventSpec, InitSpec,
    NotificationId, ResourceType, Result, StatsType, ThreadId, UpdatePolicy,
};
