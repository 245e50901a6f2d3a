//! Destroy command implementation

use anyhow::Result;
use tracing::warn;

use super::{attach, host_registry};
use crate::cli::Target;

/// Every resource is attempted, so one busy resource does not keep the
/// others alive.
pub async fn execute(target: &Target) -> Result<()> {
    let registry = host_registry()?;
    let (name, handlers) = attach(&registry, target).await?;

    let mut failed = Vec::new();
    for handler in handlers {
        let resource = handler.resource_type();
        if let Err(e) = handler.destroy().await {
            warn!(container = %name, resource = %resource, error = %e.error(), "Destroy failed");
            failed.push(format!("{resource} ({})", e.kind()));
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Failed to destroy {name}: {}", failed.join(", "));
    }

    println!("✅ Destroyed {name}");
    Ok(())
}
