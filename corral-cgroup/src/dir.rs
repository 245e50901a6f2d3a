//! One container's group directory within one hierarchy

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use corral_core::{Error, ItemFailure, Result, ThreadId};

use crate::fs::CgroupFs;

/// Task membership file present in every group
pub const TASKS: &str = "tasks";

/// Handle on a cgroup directory
///
/// Provides typed access to its control files:
/// - Reading scalars and keyed counter files
/// - Writing settings
/// - Moving tasks in
#[derive(Clone)]
pub struct CgroupDir {
    fs: Arc<dyn CgroupFs>,
    path: PathBuf,
}

impl CgroupDir {
    /// Wrap an existing or to-be-created directory
    #[must_use]
    pub fn new(fs: Arc<dyn CgroupFs>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    /// Full path of this group
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Whether the directory exists
    pub async fn exists(&self) -> Result<bool> {
        self.fs.exists(&self.path).await
    }

    /// Whether the path is a group rather than a control file
    ///
    /// Every group carries a `tasks` file; control files never do.
    pub async fn is_group(&self) -> Result<bool> {
        self.has_file(TASKS).await
    }

    /// Whether the directory exposes control file `name`
    pub async fn has_file(&self, name: &str) -> Result<bool> {
        self.fs.exists(&self.file(name)).await
    }

    /// Create the directory; the parent group must exist
    pub async fn create(&self) -> Result<()> {
        debug!(path = %self.path.display(), "Creating cgroup directory");
        self.fs.create_dir(&self.path).await
    }

    /// Remove the directory
    ///
    /// Fails while it still has tasks or child groups.
    pub async fn remove(&self) -> Result<()> {
        debug!(path = %self.path.display(), "Removing cgroup directory");
        self.fs.remove_dir(&self.path).await
    }

    /// Raw contents of a control file
    pub async fn read(&self, name: &str) -> Result<String> {
        self.fs.read(&self.file(name)).await
    }

    /// Parse a single-value control file
    pub async fn read_value<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.read(name).await?;
        raw.trim().parse().map_err(|e| Error::CGroup {
            message: format!("Malformed {name} in {}: {e}", self.path.display()),
        })
    }

    /// Parse a `key value` per line counter file
    ///
    /// Format (e.g. memory.stat):
    /// ```text
    /// cache 1234
    /// rss 5678
    /// ```
    pub async fn read_keyed(&self, name: &str) -> Result<BTreeMap<String, u64>> {
        let raw = self.read(name).await?;
        Ok(parse_keyed(&raw))
    }

    /// Write a setting
    pub async fn write(&self, name: &str, value: impl fmt::Display + Send) -> Result<()> {
        let value = value.to_string();
        debug!(
            path = %self.path.display(),
            file = name,
            value = %value,
            "Writing control file"
        );
        self.fs.write(&self.file(name), &value).await
    }

    /// Tasks currently in this group
    pub async fn tasks(&self) -> Result<Vec<ThreadId>> {
        let raw = self.read(TASKS).await?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .map(ThreadId::from_raw)
            .collect())
    }

    /// Move tasks into this group
    ///
    /// Tasks already inside are skipped. Every task is attempted; failures
    /// are reported together.
    pub async fn enter(&self, tids: &[ThreadId]) -> Result<()> {
        let present: BTreeSet<ThreadId> = self.tasks().await?.into_iter().collect();

        let mut failures = Vec::new();
        for tid in tids {
            if present.contains(tid) {
                debug!(tid = tid.as_raw(), "Task already in group");
                continue;
            }
            if let Err(e) = self.write(TASKS, tid.as_raw()).await {
                failures.push(ItemFailure::new(format!("tid {tid}"), &e));
            }
        }

        Error::partial(failures).map_or(Ok(()), Err)
    }
}

impl fmt::Debug for CgroupDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupDir")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse_keyed(raw: &str) -> BTreeMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}
