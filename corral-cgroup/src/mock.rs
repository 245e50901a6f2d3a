//! In-memory cgroupfs for tests
//!
//! Emulates the kernel behaviors handlers depend on: default control files
//! per hierarchy, value clamping and page rounding, task migration between
//! sibling groups, and refusing to remove busy groups.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use corral_core::{CgroupMount, Error, Hierarchy, InitSpec, Result, ThreadId};

use crate::fs::CgroupFs;
use crate::resources::memory::{PAGE_SIZE, UNLIMITED_BYTES};

/// Mock cgroupfs (doesn't touch the filesystem)
///
/// # Example
/// ```
/// use std::path::Path;
/// use corral_cgroup::{CgroupFs, MockCgroupFs};
/// use corral_core::InitSpec;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let fs = MockCgroupFs::mounted(&InitSpec::standard());
///
/// let dir = Path::new("/sys/fs/cgroup/memory/job");
/// fs.create_dir(dir).await.unwrap();
/// fs.write(&dir.join("memory.limit_in_bytes"), "1000").await.unwrap();
///
/// // Rounded up to a whole page, like the kernel does
/// let limit = fs.read(&dir.join("memory.limit_in_bytes")).await.unwrap();
/// assert_eq!(limit.trim(), "4096");
/// # });
/// ```
#[derive(Clone)]
pub struct MockCgroupFs {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    mounts: Vec<CgroupMount>,
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
    live_tasks: BTreeSet<ThreadId>,
    protected_tasks: BTreeSet<ThreadId>,
    failing_writes: BTreeMap<PathBuf, i32>,
    mount_calls: usize,
    call_count: usize,
}

impl MockCgroupFs {
    /// Machine with nothing mounted
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Machine on which `spec` is already mounted
    #[must_use]
    pub fn mounted(spec: &InitSpec) -> Self {
        let mut state = MockState::default();
        for mount in &spec.mounts {
            state.attach(mount);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make a task exist so it can be moved between groups
    pub async fn spawn_task(&self, tid: ThreadId) {
        self.state.lock().await.live_tasks.insert(tid);
    }

    /// Make a task exist but refuse to move it, as for another user's task
    pub async fn spawn_protected_task(&self, tid: ThreadId) {
        let mut state = self.state.lock().await;
        state.live_tasks.insert(tid);
        state.protected_tasks.insert(tid);
    }

    /// End a task, removing it from every group
    pub async fn exit_task(&self, tid: ThreadId) {
        let mut state = self.state.lock().await;
        state.live_tasks.remove(&tid);
        state.protected_tasks.remove(&tid);

        let needle = tid.to_string();
        for (path, contents) in &mut state.files {
            if path.file_name().is_some_and(|n| n == "tasks") {
                *contents = remove_line(contents, &needle);
            }
        }
    }

    /// Overwrite a control file without kernel checks, e.g. a counter
    pub async fn set_file(&self, path: impl AsRef<Path>, contents: impl Into<String>) {
        self.state
            .lock()
            .await
            .files
            .insert(path.as_ref().to_path_buf(), contents.into());
    }

    /// Raw contents of a control file
    pub async fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().await.files.get(path.as_ref()).cloned()
    }

    /// Whether a cgroup directory exists
    pub async fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.state.lock().await.dirs.contains(path.as_ref())
    }

    /// Fail every later write to `path` with `errno`
    pub async fn fail_writes(&self, path: impl AsRef<Path>, errno: i32) {
        self.state
            .lock()
            .await
            .failing_writes
            .insert(path.as_ref().to_path_buf(), errno);
    }

    /// Number of successful `mount` calls (for testing)
    pub async fn mount_calls(&self) -> usize {
        self.state.lock().await.mount_calls
    }

    /// Get the number of filesystem calls made (for testing)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.call_count
    }
}

impl Default for MockCgroupFs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockCgroupFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCgroupFs").finish_non_exhaustive()
    }
}

fn os_error(operation: &str, path: &Path, errno: i32) -> Error {
    Error::from_io(
        format!("{operation} {}", path.display()),
        &std::io::Error::from_raw_os_error(errno),
    )
}

fn remove_line(contents: &str, needle: &str) -> String {
    contents
        .lines()
        .filter(|line| line.trim() != needle)
        .map(|line| format!("{line}\n"))
        .collect()
}

impl MockState {
    fn attach(&mut self, mount: &CgroupMount) {
        self.mounts.push(mount.clone());
        self.populate(&mount.mount_path, &mount.hierarchies, true);
    }

    fn mount_of(&self, path: &Path) -> Option<&CgroupMount> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.mount_path))
            .max_by_key(|m| m.mount_path.components().count())
    }

    /// Create a group directory with the files its hierarchies expose
    fn populate(&mut self, dir: &Path, hierarchies: &[Hierarchy], root: bool) {
        self.dirs.insert(dir.to_path_buf());

        let mut files: Vec<(&str, String)> = vec![("tasks", String::new())];
        for hierarchy in hierarchies {
            match hierarchy {
                Hierarchy::Cpu => files.extend([
                    ("cpu.shares", "1024\n".to_string()),
                    ("cpu.cfs_quota_us", "-1\n".to_string()),
                    ("cpu.cfs_period_us", "100000\n".to_string()),
                    (
                        "cpu.stat",
                        "nr_periods 0\nnr_throttled 0\nthrottled_time 0\n".to_string(),
                    ),
                ]),
                Hierarchy::Cpuacct => files.extend([
                    ("cpuacct.usage", "0\n".to_string()),
                    ("cpuacct.usage_percpu", "0 0 \n".to_string()),
                ]),
                Hierarchy::Memory => files.extend([
                    ("memory.limit_in_bytes", format!("{UNLIMITED_BYTES}\n")),
                    ("memory.soft_limit_in_bytes", format!("{UNLIMITED_BYTES}\n")),
                    ("memory.memsw.limit_in_bytes", format!("{UNLIMITED_BYTES}\n")),
                    ("memory.usage_in_bytes", "0\n".to_string()),
                    ("memory.max_usage_in_bytes", "0\n".to_string()),
                    (
                        "memory.oom_control",
                        "oom_kill_disable 0\nunder_oom 0\noom_kill 0\n".to_string(),
                    ),
                    ("memory.stat", "cache 0\nrss 0\nmapped_file 0\n".to_string()),
                    (
                        "memory.use_hierarchy",
                        if root { "0\n" } else { "1\n" }.to_string(),
                    ),
                ]),
                Hierarchy::Blkio => files.extend([
                    ("blkio.weight", "500\n".to_string()),
                    ("blkio.throttle.read_bps_device", String::new()),
                    ("blkio.throttle.write_bps_device", String::new()),
                    ("blkio.throttle.io_service_bytes", "Total 0\n".to_string()),
                ]),
                Hierarchy::NetCls => files.push(("net_cls.classid", "0\n".to_string())),
                Hierarchy::Pids if !root => files.extend([
                    ("pids.max", "max\n".to_string()),
                    ("pids.current", "0\n".to_string()),
                ]),
                Hierarchy::Pids
                | Hierarchy::PerfEvent
                | Hierarchy::Cpuset
                | Hierarchy::Freezer => {}
            }
        }

        for (name, contents) in files {
            self.files.insert(dir.join(name), contents);
        }
    }

    fn write(&mut self, path: &Path, contents: &str) -> Result<()> {
        if !self.files.contains_key(path) {
            return Err(os_error("open", path, libc::ENOENT));
        }
        if let Some(errno) = self.failing_writes.get(path) {
            return Err(os_error("write", path, *errno));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let value = contents.trim();
        let invalid = || os_error("write", path, libc::EINVAL);

        let stored = match name.as_str() {
            "tasks" => return self.move_task(path, value),
            "cpu.shares" => {
                let shares: u64 = value.parse().map_err(|_| invalid())?;
                shares.clamp(2, 262_144).to_string()
            }
            "cpu.cfs_quota_us" => {
                let quota: i64 = value.parse().map_err(|_| invalid())?;
                if quota != -1 && quota < 1000 {
                    return Err(invalid());
                }
                quota.to_string()
            }
            "cpu.cfs_period_us" => {
                let period: u64 = value.parse().map_err(|_| invalid())?;
                if !(1000..=1_000_000).contains(&period) {
                    return Err(invalid());
                }
                period.to_string()
            }
            "memory.limit_in_bytes"
            | "memory.soft_limit_in_bytes"
            | "memory.memsw.limit_in_bytes" => {
                let bytes = page_round(value).ok_or_else(invalid)?;
                let dir = path.parent().unwrap_or(path);
                let read = |file: &str| {
                    self.files
                        .get(&dir.join(file))
                        .and_then(|v| v.trim().parse::<u64>().ok())
                };
                match name.as_str() {
                    "memory.limit_in_bytes" => {
                        if read("memory.memsw.limit_in_bytes").is_some_and(|sw| bytes > sw) {
                            return Err(invalid());
                        }
                    }
                    "memory.memsw.limit_in_bytes" => {
                        if read("memory.limit_in_bytes").is_some_and(|limit| bytes < limit) {
                            return Err(invalid());
                        }
                    }
                    _ => {}
                }
                bytes.to_string()
            }
            "memory.use_hierarchy" => match value {
                "0" | "1" => value.to_string(),
                _ => return Err(invalid()),
            },
            "blkio.weight" => {
                let weight: u32 = value.parse().map_err(|_| invalid())?;
                if !(10..=1000).contains(&weight) {
                    return Err(os_error("write", path, libc::ERANGE));
                }
                weight.to_string()
            }
            device if device.ends_with("_device") => {
                let current = self.files.get(path).cloned().unwrap_or_default();
                update_device_line(&current, value).ok_or_else(invalid)?
            }
            "net_cls.classid" => value.parse::<u32>().map_err(|_| invalid())?.to_string(),
            "pids.max" => {
                if value != "max" && value.parse::<u64>().map_err(|_| invalid())? == 0 {
                    return Err(invalid());
                }
                value.to_string()
            }
            _ => value.to_string(),
        };

        let stored = if stored.is_empty() || stored.ends_with('\n') {
            stored
        } else {
            format!("{stored}\n")
        };
        self.files.insert(path.to_path_buf(), stored);
        Ok(())
    }

    /// Attach a task to the group, detaching it from its siblings
    fn move_task(&mut self, path: &Path, value: &str) -> Result<()> {
        let tid = value
            .parse::<i32>()
            .map(ThreadId::from_raw)
            .map_err(|_| os_error("write", path, libc::EINVAL))?;
        if !self.live_tasks.contains(&tid) {
            return Err(os_error("write", path, libc::ESRCH));
        }
        if self.protected_tasks.contains(&tid) {
            return Err(os_error("write", path, libc::EPERM));
        }

        let mount = self
            .mount_of(path)
            .map(|m| m.mount_path.clone())
            .ok_or_else(|| os_error("write", path, libc::ENODEV))?;

        let needle = tid.to_string();
        for (file, contents) in &mut self.files {
            if file.starts_with(&mount) && file.file_name().is_some_and(|n| n == "tasks") {
                *contents = remove_line(contents, &needle);
            }
        }
        if let Some(tasks) = self.files.get_mut(path) {
            tasks.push_str(&needle);
            tasks.push('\n');
        }
        Ok(())
    }
}

/// Parse a memory value as the kernel does: `-1` is unlimited, everything
/// else is rounded up to a whole page
fn page_round(value: &str) -> Option<u64> {
    let bytes: i64 = value.parse().ok()?;
    if bytes == -1 {
        return Some(UNLIMITED_BYTES);
    }
    let bytes = u64::try_from(bytes).ok()?;
    Some(bytes.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE).min(UNLIMITED_BYTES))
}

/// Apply a `major:minor value` write to a per-device file; zero removes
fn update_device_line(current: &str, write: &str) -> Option<String> {
    let (device, value) = write.split_once(' ')?;
    let value: u64 = value.trim().parse().ok()?;
    let (major, minor) = device.split_once(':')?;
    major.parse::<u32>().ok()?;
    minor.parse::<u32>().ok()?;

    let mut lines: BTreeMap<String, u64> = current
        .lines()
        .filter_map(|line| {
            let (dev, v) = line.split_once(' ')?;
            Some((dev.to_string(), v.trim().parse().ok()?))
        })
        .collect();

    if value == 0 {
        lines.remove(device);
    } else {
        lines.insert(device.to_string(), value);
    }

    Some(
        lines
            .into_iter()
            .map(|(dev, v)| format!("{dev} {v}\n"))
            .collect(),
    )
}

#[async_trait]
impl CgroupFs for MockCgroupFs {
    async fn mounts(&self) -> Result<Vec<CgroupMount>> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        Ok(state.mounts.clone())
    }

    async fn mount(&self, mount: &CgroupMount) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        // A hierarchy can only be attached once, in one combination
        if let Some(existing) = state
            .mounts
            .iter()
            .find(|m| m.hierarchies.iter().any(|h| mount.contains(*h)))
        {
            if existing.is_equivalent(mount) {
                return Ok(());
            }
            return Err(os_error("mount", &mount.mount_path, libc::EBUSY));
        }

        state.attach(mount);
        state.mount_calls += 1;

        tracing::debug!(
            path = %mount.mount_path.display(),
            hierarchies = %mount.options(),
            "Mock: Mounted hierarchy"
        );
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        Ok(state.dirs.contains(path) || state.files.contains_key(path))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.dirs.contains(path) || state.files.contains_key(path) {
            return Err(os_error("create", path, libc::EEXIST));
        }
        if !path.parent().is_some_and(|p| state.dirs.contains(p)) {
            return Err(os_error("create", path, libc::ENOENT));
        }
        let hierarchies = state
            .mount_of(path)
            .map(|m| m.hierarchies.clone())
            .ok_or_else(|| os_error("create", path, libc::ENOENT))?;

        state.populate(path, &hierarchies, false);
        tracing::debug!(path = %path.display(), "Mock: Created group");
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if !state.dirs.contains(path) {
            return Err(os_error("remove", path, libc::ENOENT));
        }
        if state.mounts.iter().any(|m| m.mount_path == path) {
            return Err(os_error("remove", path, libc::EBUSY));
        }
        if state
            .dirs
            .iter()
            .any(|d| d.parent().is_some_and(|p| p == path))
        {
            return Err(os_error("remove", path, libc::EBUSY));
        }
        if state
            .files
            .get(&path.join("tasks"))
            .is_some_and(|t| !t.trim().is_empty())
        {
            return Err(os_error("remove", path, libc::EBUSY));
        }

        state.dirs.remove(path);
        state.files.retain(|f, _| f.parent() != Some(path));
        tracing::debug!(path = %path.display(), "Mock: Removed group");
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.dirs.contains(path) {
            return Err(os_error("read", path, libc::EISDIR));
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| os_error("read", path, libc::ENOENT))
    }

    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        state.write(path, contents)
    }
}
