//! Specification payloads exchanged with the orchestration layer
//!
//! [`ContainerSpec`] is a union over every resource type. A handler reads
//! and writes only its own sub-spec and leaves the others alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::{CpuCores, MemorySize, ResourceType};

/// Resource-union container specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// CPU settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    /// Memory settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    /// Block I/O settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diskio: Option<DiskIoSpec>,
    /// Network settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
    /// Monitoring settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,
    /// Container-wide settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalSpec>,
}

impl ContainerSpec {
    /// Whether the sub-spec for `resource` is present
    #[must_use]
    pub const fn has(&self, resource: ResourceType) -> bool {
        match resource {
            ResourceType::Cpu => self.cpu.is_some(),
            ResourceType::Memory => self.memory.is_some(),
            ResourceType::DiskIo => self.diskio.is_some(),
            ResourceType::Network => self.network.is_some(),
            ResourceType::Monitoring => self.monitoring.is_some(),
            ResourceType::Global => self.global.is_some(),
        }
    }

    /// Resource types with a sub-spec present
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|r| self.has(*r))
            .collect()
    }
}

/// CPU settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSpec {
    /// Relative CPU weight (`cpu.shares`, 2..=262144, default 1024)
    pub shares: Option<u64>,
    /// Hard ceiling in cores, enforced through CFS quota
    pub max_limit: Option<CpuCores>,
}

/// Memory settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySpec {
    /// Hard limit, `None` for unlimited
    pub limit: Option<MemorySize>,
    /// Soft limit reclaimed towards under pressure
    pub reservation: Option<MemorySize>,
    /// Memory plus swap limit, must not be below `limit`
    pub swap_limit: Option<MemorySize>,
}

/// Block device major/minor pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceNumber {
    /// Major number
    pub major: u32,
    /// Minor number
    pub minor: u32,
}

impl DeviceNumber {
    /// Create a device number
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Per-device bandwidth ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceThrottle {
    /// Device the ceiling applies to
    pub device: DeviceNumber,
    /// Read bytes per second, `None` to leave unthrottled
    #[serde(default)]
    pub read_bps: Option<u64>,
    /// Write bytes per second, `None` to leave unthrottled
    #[serde(default)]
    pub write_bps: Option<u64>,
}

/// Block I/O settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskIoSpec {
    /// Proportional weight (10..=1000, default 500)
    pub weight: Option<u32>,
    /// Per-device ceilings
    pub throttles: Vec<DeviceThrottle>,
}

/// Network settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Traffic class tagged on the container's packets (`net_cls.classid`)
    pub class_id: Option<u32>,
}

/// Monitoring settings
///
/// Presence alone places the container under the monitoring hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSpec {}

/// Container-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSpec {
    /// Maximum number of tasks, `None` for unlimited
    pub max_tasks: Option<u64>,
}

/// Kernel cgroup hierarchy (controller) name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hierarchy {
    /// `cpu`
    Cpu,
    /// `cpuacct`
    Cpuacct,
    /// `cpuset`
    Cpuset,
    /// `memory`
    Memory,
    /// `blkio`
    Blkio,
    /// `net_cls`
    NetCls,
    /// `perf_event`
    PerfEvent,
    /// `pids`
    Pids,
    /// `freezer`
    Freezer,
}

impl Hierarchy {
    /// Kernel name, as used in mount options
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
            Self::Blkio => "blkio",
            Self::NetCls => "net_cls",
            Self::PerfEvent => "perf_event",
            Self::Pids => "pids",
            Self::Freezer => "freezer",
        }
    }

    /// Parse a kernel name
    #[must_use]
    pub fn from_kernel_name(name: &str) -> Option<Self> {
        [
            Self::Cpu,
            Self::Cpuacct,
            Self::Cpuset,
            Self::Memory,
            Self::Blkio,
            Self::NetCls,
            Self::PerfEvent,
            Self::Pids,
            Self::Freezer,
        ]
        .into_iter()
        .find(|h| h.as_str() == name)
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cgroup filesystem mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupMount {
    /// Where the hierarchy is (or will be) mounted
    pub mount_path: PathBuf,
    /// Hierarchies co-mounted at this path
    pub hierarchies: Vec<Hierarchy>,
}

impl CgroupMount {
    /// Create a mount entry
    #[must_use]
    pub fn new(mount_path: impl Into<PathBuf>, hierarchies: impl Into<Vec<Hierarchy>>) -> Self {
        Self {
            mount_path: mount_path.into(),
            hierarchies: hierarchies.into(),
        }
    }

    /// Whether `hierarchy` is attached to this mount
    #[must_use]
    pub fn contains(&self, hierarchy: Hierarchy) -> bool {
        self.hierarchies.contains(&hierarchy)
    }

    /// Same path and same hierarchy set, ignoring order
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let mut ours = self.hierarchies.clone();
        let mut theirs = other.hierarchies.clone();
        ours.sort_unstable();
        ours.dedup();
        theirs.sort_unstable();
        theirs.dedup();
        self.mount_path == other.mount_path && ours == theirs
    }

    /// Comma separated hierarchy list, as passed to mount(2)
    #[must_use]
    pub fn options(&self) -> String {
        self.hierarchies
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Machine-wide bootstrap configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitSpec {
    /// Cgroup mounts to establish
    pub mounts: Vec<CgroupMount>,
}

impl InitSpec {
    /// Conventional layout under `/sys/fs/cgroup`
    #[must_use]
    pub fn standard() -> Self {
        let root = PathBuf::from("/sys/fs/cgroup");
        Self {
            mounts: vec![
                CgroupMount::new(root.join("cpu,cpuacct"), [Hierarchy::Cpu, Hierarchy::Cpuacct]),
                CgroupMount::new(root.join("memory"), [Hierarchy::Memory]),
                CgroupMount::new(root.join("blkio"), [Hierarchy::Blkio]),
                CgroupMount::new(root.join("net_cls"), [Hierarchy::NetCls]),
                CgroupMount::new(root.join("perf_event"), [Hierarchy::PerfEvent]),
                CgroupMount::new(root.join("pids"), [Hierarchy::Pids]),
            ],
        }
    }

    /// Mount entry carrying `hierarchy`, if any
    #[must_use]
    pub fn mount_for(&self, hierarchy: Hierarchy) -> Option<&CgroupMount> {
        self.mounts.iter().find(|m| m.contains(hierarchy))
    }
}

/// Out-of-memory condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OomEvent {}

/// Memory usage crossing a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryThresholdEvent {
    /// Usage at or above which the event fires
    pub usage: MemorySize,
}

/// Last task leaving the container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEmptyEvent {}

/// Event identifier, one per [`EventSpec`] field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// See [`OomEvent`]
    Oom,
    /// See [`MemoryThresholdEvent`]
    MemoryThreshold,
    /// See [`ContainerEmptyEvent`]
    ContainerEmpty,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Oom => "oom",
            Self::MemoryThreshold => "memory_threshold",
            Self::ContainerEmpty => "container_empty",
        };
        f.write_str(name)
    }
}

/// Event condition to watch for
///
/// A valid registration names exactly one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSpec {
    /// Out-of-memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom: Option<OomEvent>,
    /// Memory usage threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_threshold: Option<MemoryThresholdEvent>,
    /// Container became empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_empty: Option<ContainerEmptyEvent>,
}

impl EventSpec {
    /// Events named by this spec
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        if self.oom.is_some() {
            kinds.push(EventKind::Oom);
        }
        if self.memory_threshold.is_some() {
            kinds.push(EventKind::MemoryThreshold);
        }
        if self.container_empty.is_some() {
            kinds.push(EventKind::ContainerEmpty);
        }
        kinds
    }
}
