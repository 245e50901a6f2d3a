//! Resource value objects with compile-time unit safety

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Memory size value object with compile-time unit safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MemorySize(u64); // bytes

impl MemorySize {
    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kilobytes
    #[must_use]
    pub const fn from_kb(kb: u64) -> Self {
        Self(kb.saturating_mul(1024))
    }

    /// Create from megabytes
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb.saturating_mul(1024).saturating_mul(1024))
    }

    /// Create from gigabytes
    #[must_use]
    pub const fn from_gb(gb: u64) -> Self {
        Self(
            gb.saturating_mul(1024)
                .saturating_mul(1024)
                .saturating_mul(1024),
        )
    }

    /// Get value in bytes
    #[must_use]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get value in megabytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_mb(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }

    /// Get value in gigabytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_gb(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Whether this is zero bytes
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for MemorySize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MemorySize {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GB: u64 = 1024 * 1024 * 1024;
        const MB: u64 = 1024 * 1024;
        const KB: u64 = 1024;

        if self.0 >= GB {
            write!(f, "{:.2} GB", self.as_gb())
        } else if self.0 >= MB {
            write!(f, "{:.2} MB", self.as_mb())
        } else if self.0 >= KB {
            #[allow(clippy::cast_precision_loss)]
            let kb = self.0 as f64 / 1024.0;
            write!(f, "{kb:.2} KB")
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// CPU cores value object
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct CpuCores(f64);

impl CpuCores {
    /// CFS period used for quota conversion, in microseconds
    pub const PERIOD_US: i64 = 100_000;

    /// Create new CPU cores value
    #[must_use]
    pub const fn new(cores: f64) -> Self {
        Self(cores)
    }

    /// Get value as f64
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        self.0
    }

    /// Convert to CFS quota/period format
    ///
    /// Returns (quota, period) in microseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn to_quota(self) -> (i64, i64) {
        let quota = (self.0 * Self::PERIOD_US as f64) as i64;
        (quota, Self::PERIOD_US)
    }

    /// Convert back from a CFS quota/period pair
    ///
    /// A negative quota means unlimited and yields `None`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_quota(quota: i64, period: i64) -> Option<Self> {
        if quota < 0 || period <= 0 {
            return None;
        }
        Some(Self(quota as f64 / period as f64))
    }
}

impl fmt::Display for CpuCores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} cores", self.0)
    }
}
