//! Core type definitions with strong typing and validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};

/// Absolute container name, e.g. `/` or `/batch/job-7`
///
/// Equality is exact string equality; no normalization is applied beyond
/// rejecting malformed names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    /// Maximum length for container names
    pub const MAX_LENGTH: usize = 4096;

    /// Create a new `ContainerName` with validation
    ///
    /// # Errors
    /// Returns error if the name is not absolute, has empty or dot
    /// components, a trailing slash, or invalid characters
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// The root container `/`
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    fn validate(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(Error::invalid(format!(
                "Container name must be absolute: {name:?}"
            )));
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(Error::invalid(format!(
                "Container name too long (max {} chars)",
                Self::MAX_LENGTH
            )));
        }

        if name == "/" {
            return Ok(());
        }

        for component in name[1..].split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::invalid(format!(
                    "Container name has an invalid component: {name:?}"
                )));
            }

            if !component
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
            {
                return Err(Error::invalid(
                    "Container name components can only contain alphanumeric, dash, underscore, and dot",
                ));
            }
        }

        Ok(())
    }

    /// Get the container name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root container
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent container, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Resolve this name under a hierarchy mount point
    #[must_use]
    pub fn resolve(&self, mount: &Path) -> PathBuf {
        if self.is_root() {
            mount.to_path_buf()
        } else {
            mount.join(&self.0[1..])
        }
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<ContainerName> for String {
    fn from(name: ContainerName) -> Self {
        name.0
    }
}

/// Thread or process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ThreadId(i32);

impl ThreadId {
    /// Create from raw TID
    #[must_use]
    pub const fn from_raw(tid: i32) -> Self {
        Self(tid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        Self(std::process::id() as i32)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw TID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ThreadId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ThreadId> for nix::unistd::Pid {
    fn from(tid: ThreadId) -> Self {
        Self::from_raw(tid.0)
    }
}

/// Category of isolable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// CPU time
    Cpu,
    /// Memory
    Memory,
    /// Block device I/O
    DiskIo,
    /// Network traffic classification
    Network,
    /// Monitoring counters
    Monitoring,
    /// Container-wide settings
    Global,
}

impl ResourceType {
    /// Every resource type, in a stable order
    pub const ALL: [Self; 6] = [
        Self::Cpu,
        Self::Memory,
        Self::DiskIo,
        Self::Network,
        Self::Monitoring,
        Self::Global,
    ];

    /// Lowercase name used in logs and on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::DiskIo => "diskio",
            Self::Network => "network",
            Self::Monitoring => "monitoring",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid(format!("Unknown resource type: {s}")))
    }
}

/// How an update is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Apply only the fields present in the spec
    #[default]
    Diff,
    /// Converge the live configuration to exactly the spec
    Replace,
}

/// Cost level of statistics collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsType {
    /// Cheap counters only
    #[default]
    Summary,
    /// Deep backend queries
    Full,
}

/// Opaque handle of one active event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct NotificationId(u64);

static NEXT_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(1);

impl NotificationId {
    /// Allocate a process-unique id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_NOTIFICATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get raw id value
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
