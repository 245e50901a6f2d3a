//! Filesystem seam between handlers and the cgroup hierarchies
//!
//! Every kernel interaction goes through [`CgroupFs`], so handlers can run
//! against the host's cgroupfs or an in-memory [`MockCgroupFs`](crate::MockCgroupFs).

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use corral_core::{CgroupMount, Error, Hierarchy, Result};

/// Access to cgroup hierarchies
///
/// # Thread Safety
/// All implementations must be `Send + Sync`; handlers for different
/// containers share one instance.
#[async_trait]
pub trait CgroupFs: Send + Sync + fmt::Debug {
    /// Cgroup hierarchies currently mounted on the machine
    async fn mounts(&self) -> Result<Vec<CgroupMount>>;

    /// Mount a cgroup hierarchy, creating the mount point if needed
    async fn mount(&self, mount: &CgroupMount) -> Result<()>;

    /// Whether a cgroup directory or control file exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Create one cgroup directory; the parent must exist
    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Remove one empty cgroup directory
    async fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Read a control file
    async fn read(&self, path: &Path) -> Result<String>;

    /// Write a control file
    async fn write(&self, path: &Path, contents: &str) -> Result<()>;
}

/// Host cgroupfs
#[derive(Debug, Clone)]
pub struct HostCgroupFs {
    mount_table: PathBuf,
}

impl HostCgroupFs {
    /// Use the running kernel's mount table
    #[must_use]
    pub fn new() -> Self {
        Self {
            mount_table: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl Default for HostCgroupFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CgroupFs for HostCgroupFs {
    async fn mounts(&self) -> Result<Vec<CgroupMount>> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|e| Error::from_io(format!("read {}", self.mount_table.display()), &e))?;
        Ok(parse_mount_table(&table))
    }

    async fn mount(&self, mount: &CgroupMount) -> Result<()> {
        let target = mount.mount_path.clone();
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| Error::from_io(format!("create {}", target.display()), &e))?;

        let options = mount.options();
        tracing::info!(
            path = %target.display(),
            hierarchies = %options,
            "Mounting cgroup hierarchy"
        );

        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                Some("cgroup"),
                &target,
                Some("cgroup"),
                nix::mount::MsFlags::empty(),
                Some(options.as_str()),
            )
            .map_err(|errno| {
                Error::from_io(
                    format!("mount {}", target.display()),
                    &std::io::Error::from(errno),
                )
            })
        })
        .await?
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| Error::from_io(format!("stat {}", path.display()), &e))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| Error::from_io(format!("create {}", path.display()), &e))
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir(path)
            .await
            .map_err(|e| Error::from_io(format!("remove {}", path.display()), &e))
    }

    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::from_io(format!("read {}", path.display()), &e))
    }

    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        // Control files exist already; never create or truncate them
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| Error::from_io(format!("open {}", path.display()), &e))?;

        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| Error::from_io(format!("write {}", path.display()), &e))
    }
}

/// Extract cgroup v1 mounts from a `/proc/mounts` style table
///
/// ```text
/// cgroup /sys/fs/cgroup/cpu,cpuacct cgroup rw,nosuid,nodev,noexec,relatime,cpu,cpuacct 0 0
/// ```
pub(crate) fn parse_mount_table(table: &str) -> Vec<CgroupMount> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[2] != "cgroup" {
                return None;
            }

            let hierarchies: Vec<Hierarchy> = fields[3]
                .split(',')
                .filter_map(Hierarchy::from_kernel_name)
                .collect();
            if hierarchies.is_empty() {
                return None;
            }

            Some(CgroupMount::new(unescape(fields[1]), hierarchies))
        })
        .collect()
}

/// Undo the octal escaping the kernel applies to mount points
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let byte = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(byte) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
