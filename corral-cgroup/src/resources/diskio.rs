//! Block I/O: proportional weight and per-device bandwidth ceilings

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use corral_core::{
    ContainerSpec, ContainerStats, DeviceNumber, DeviceThrottle, DiskIoSpec, DiskIoStats, Error,
    Hierarchy, ResourceType, Result, StatsType, UpdatePolicy,
};

use super::{Change, Changes, Controller};
use crate::dir::CgroupDir;

const WEIGHT: &str = "blkio.weight";
const READ_BPS: &str = "blkio.throttle.read_bps_device";
const WRITE_BPS: &str = "blkio.throttle.write_bps_device";
const SERVICE_BYTES: &str = "blkio.throttle.io_service_bytes";

/// Default proportional weight
pub const DEFAULT_WEIGHT: u32 = 500;
/// Smallest weight accepted by the kernel
pub const MIN_WEIGHT: u32 = 10;
/// Largest weight accepted by the kernel
pub const MAX_WEIGHT: u32 = 1000;

/// Block I/O controller
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskIoController;

/// `major:minor value` lines of a per-device file
fn parse_device_file(raw: &str) -> BTreeMap<DeviceNumber, u64> {
    raw.lines()
        .filter_map(|line| {
            let (device, value) = line.split_once(char::is_whitespace)?;
            let (major, minor) = device.split_once(':')?;
            Some((
                DeviceNumber::new(major.parse().ok()?, minor.parse().ok()?),
                value.trim().parse().ok()?,
            ))
        })
        .collect()
}

async fn read_device_file(dir: &CgroupDir, file: &str) -> Result<BTreeMap<DeviceNumber, u64>> {
    Ok(parse_device_file(&dir.read(file).await?))
}

impl DiskIoController {
    /// Set or clear one direction's ceilings
    async fn apply_throttles(
        changes: &mut Changes<'_>,
        dir: &CgroupDir,
        file: &str,
        wanted: BTreeMap<DeviceNumber, Change<u64>>,
    ) -> Result<()> {
        let current = read_device_file(dir, file).await?;

        for (device, change) in &wanted {
            match change {
                Change::Set(bps) => {
                    changes
                        .write("throttles", file, format!("{device} {bps}"))
                        .await?;
                }
                Change::Reset if current.contains_key(device) => {
                    changes.write("throttles", file, format!("{device} 0")).await?;
                }
                Change::Reset | Change::Keep => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for DiskIoController {
    const RESOURCE: ResourceType = ResourceType::DiskIo;
    const HIERARCHY: Hierarchy = Hierarchy::Blkio;

    fn validate(&self, spec: &ContainerSpec) -> Result<()> {
        let Some(diskio) = &spec.diskio else {
            return Ok(());
        };

        if let Some(weight) = diskio.weight {
            if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
                return Err(Error::invalid(format!(
                    "Disk I/O weight must be within {MIN_WEIGHT}..={MAX_WEIGHT}, got {weight}"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for throttle in &diskio.throttles {
            if !seen.insert(throttle.device) {
                return Err(Error::invalid(format!(
                    "Device {} is throttled more than once",
                    throttle.device
                )));
            }
            if throttle.read_bps == Some(0) || throttle.write_bps == Some(0) {
                return Err(Error::invalid(format!(
                    "Bandwidth ceiling for device {} must be positive",
                    throttle.device
                )));
            }
        }

        Ok(())
    }

    async fn apply(&self, dir: &CgroupDir, spec: &ContainerSpec, policy: UpdatePolicy) -> Result<()> {
        let diskio = spec.diskio.clone().unwrap_or_default();
        let mut changes = Changes::new(dir, Self::RESOURCE);

        match Change::of(diskio.weight, policy) {
            Change::Set(weight) => changes.write("weight", WEIGHT, weight).await?,
            Change::Reset => changes.write("weight", WEIGHT, DEFAULT_WEIGHT).await?,
            Change::Keep => {}
        }

        for (file, writes) in [(READ_BPS, false), (WRITE_BPS, true)] {
            let mut wanted: BTreeMap<DeviceNumber, Change<u64>> = diskio
                .throttles
                .iter()
                .map(|t| {
                    let bps = if writes { t.write_bps } else { t.read_bps };
                    (t.device, Change::of(bps, policy))
                })
                .collect();

            // Replace also clears devices the spec no longer names
            if policy == UpdatePolicy::Replace {
                for device in read_device_file(dir, file).await?.into_keys() {
                    wanted.entry(device).or_insert(Change::Reset);
                }
            }

            Self::apply_throttles(&mut changes, dir, file, wanted).await?;
        }

        Ok(())
    }

    async fn read_spec(&self, dir: &CgroupDir, spec: &mut ContainerSpec) -> Result<()> {
        let weight = dir.read_value(WEIGHT).await?;
        let reads = read_device_file(dir, READ_BPS).await?;
        let writes = read_device_file(dir, WRITE_BPS).await?;

        let devices: BTreeSet<DeviceNumber> = reads.keys().chain(writes.keys()).copied().collect();
        let throttles = devices
            .into_iter()
            .map(|device| DeviceThrottle {
                device,
                read_bps: reads.get(&device).copied(),
                write_bps: writes.get(&device).copied(),
            })
            .collect();

        spec.diskio = Some(DiskIoSpec {
            weight: Some(weight),
            throttles,
        });
        Ok(())
    }

    /// Sums bytes across devices from io_service_bytes
    ///
    /// Format:
    /// ```text
    /// 8:0 Read 4096
    /// 8:0 Write 8192
    /// 8:0 Total 12288
    /// Total 12288
    /// ```
    async fn read_stats(
        &self,
        dir: &CgroupDir,
        _stats_type: StatsType,
        output: &mut ContainerStats,
    ) -> Result<()> {
        let raw = dir.read(SERVICE_BYTES).await?;

        let mut stats = DiskIoStats::default();
        for line in raw.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 {
                continue;
            }
            let bytes: u64 = parts[2].parse().unwrap_or(0);
            match parts[1] {
                "Read" => stats.read_bytes = stats.read_bytes.saturating_add(bytes),
                "Write" => stats.write_bytes = stats.write_bytes.saturating_add(bytes),
                _ => {}
            }
        }

        output.diskio = Some(stats);
        Ok(())
    }
}
