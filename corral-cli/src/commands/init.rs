//! Machine bootstrap

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use corral_core::InitSpec;

use super::host_registry;

pub async fn execute(config: Option<&Path>) -> Result<()> {
    let spec = match config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<InitSpec>(&raw).context("Malformed machine layout")?
        }
        None => InitSpec::standard(),
    };

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("Must run as root. Try: sudo corral init-machine");
    }

    info!(mounts = spec.mounts.len(), "Initializing machine");
    host_registry()?
        .init_machine(&spec)
        .await
        .context("Machine initialization failed")?;

    println!("✅ Machine initialized");
    for mount in &spec.mounts {
        println!("  {} ({})", mount.mount_path.display(), mount.options());
    }
    Ok(())
}
