//! Corral Core - payload types, identities, and errors
//!
//! This crate provides the data model shared by resource handlers, their
//! factories, and the orchestration layer driving them.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod resources;
pub mod spec;
pub mod stats;
pub mod types;

pub use error::{Error, ErrorKind, ItemFailure, Result};
pub use events::HandlerEvent;
pub use resources::{CpuCores, MemorySize};
pub use spec::{
    CgroupMount, ContainerEmptyEvent, ContainerSpec, CpuSpec, DeviceNumber, DeviceThrottle,
    DiskIoSpec, EventKind, EventSpec, GlobalSpec, Hierarchy, InitSpec, MemorySpec,
    MemoryThresholdEvent, MonitoringSpec, NetworkSpec, OomEvent,
};
pub use stats::{
    ContainerStats, CpuStats, DiskIoStats, GlobalStats, MemoryStats, MonitoringStats,
};
pub use types::{
    ContainerName, NotificationId, ResourceType, StatsType, ThreadId, UpdatePolicy,
};
