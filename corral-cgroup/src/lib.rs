//! Cgroup v1 resource handlers with pluggable filesystem backends
//!
//! Each resource type lives in its own hierarchy (cpu, memory, blkio,
//! net_cls, perf_event, pids). A container's state for a resource is its
//! directory in that hierarchy, so resources are created, updated and
//! destroyed independently.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod dir;
pub mod factory;
pub mod fs;
pub mod handler;
pub mod mock;
pub mod probe;
pub mod resources;

pub use dir::CgroupDir;
pub use factory::{
    standard_registry, CgroupFactory, CpuFactory, DiskIoFactory, FactoryConfig, GlobalFactory,
    MemoryFactory, MonitoringFactory, NetworkFactory,
};
pub use fs::{CgroupFs, HostCgroupFs};
pub use handler::CgroupHandler;
pub use mock::MockCgroupFs;
pub use resources::Controller;

// Re-export commonly used types
pub use corral_core::{ContainerName, ContainerSpec, InitSpec, ResourceType};
pub use corral_resource::{FactoryRegistry, ResourceHandler, ResourceHandlerFactory};
