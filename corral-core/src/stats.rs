//! Resource usage statistics, one optional section per resource type

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{MemorySize, ThreadId};

/// Resource-union statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStats {
    /// CPU usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    /// Memory usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    /// Block I/O usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diskio: Option<DiskIoStats>,
    /// Monitoring counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringStats>,
    /// Container-wide counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalStats>,
}

/// CPU usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    /// Total CPU time consumed
    #[serde(with = "duration_serde")]
    pub usage: Duration,
    /// Enforcement periods in which the container was throttled
    pub throttled_periods: u64,
    /// Total time spent throttled
    #[serde(with = "duration_serde")]
    pub throttled_time: Duration,
    /// CPU time per CPU, only collected for full stats
    #[serde(with = "duration_vec_serde")]
    pub per_cpu_usage: Vec<Duration>,
}

/// Memory usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    /// Current usage
    pub usage: MemorySize,
    /// Peak usage
    pub max_usage: MemorySize,
    /// Effective hard limit, `None` when unlimited
    pub limit: Option<MemorySize>,
    /// Number of OOM kills in the container
    pub oom_kills: u64,
    /// Raw `memory.stat` counters, only collected for full stats
    pub detail: BTreeMap<String, u64>,
}

/// Block I/O usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskIoStats {
    /// Total bytes read across devices
    pub read_bytes: u64,
    /// Total bytes written across devices
    pub write_bytes: u64,
}

/// Monitoring counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringStats {
    /// Tasks currently in the container
    pub task_count: u64,
    /// Task ids, only collected for full stats
    pub tasks: Vec<ThreadId>,
}

/// Container-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStats {
    /// Tasks currently charged to the container
    pub task_count: u64,
    /// Task ceiling, `None` when unlimited
    pub max_tasks: Option<u64>,
}

// Custom Duration serialization (serde_json doesn't handle Duration well)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

mod duration_vec_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(durations.iter().map(|d| d.as_nanos() as u64))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = Vec::<u64>::deserialize(deserializer)?;
        Ok(nanos.into_iter().map(Duration::from_nanos).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_serde() {
        let stats = ContainerStats {
            cpu: Some(CpuStats {
                usage: Duration::from_secs(10),
                throttled_time: Duration::from_millis(500),
                per_cpu_usage: vec![Duration::from_secs(4), Duration::from_secs(6)],
                ..Default::default()
            }),
            memory: Some(MemoryStats {
                usage: MemorySize::from_mb(100),
                max_usage: MemorySize::from_mb(150),
                ..Default::default()
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(!json.contains("diskio"));

        let deserialized: ContainerStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, deserialized);
    }
}
