//! Mounted hierarchy listing

use anyhow::{Context, Result};

use corral_cgroup::{CgroupFs, HostCgroupFs};

pub async fn execute() -> Result<()> {
    let mounts = HostCgroupFs::new()
        .mounts()
        .await
        .context("Failed to read the mount table")?;

    println!("\n📋 Cgroup mounts");
    println!("{:-<60}", "");

    if mounts.is_empty() {
        println!("No cgroup v1 hierarchies mounted (run `corral init-machine`)");
        return Ok(());
    }

    for mount in &mounts {
        println!("  {:<40} {}", mount.mount_path.display(), mount.options());
    }
    println!("{:-<60}", "");
    println!("Total: {} mount(s)", mounts.len());

    Ok(())
}
