//! Update command implementation

use anyhow::{Context, Result};
use tracing::info;

use corral_core::{ContainerSpec, UpdatePolicy};

use super::{attach, host_registry, load_json};
use crate::cli::Target;

pub async fn execute(target: &Target, raw_spec: &str, replace: bool) -> Result<()> {
    let spec: ContainerSpec = load_json(raw_spec).await.context("Invalid container spec")?;
    let policy = if replace {
        UpdatePolicy::Replace
    } else {
        UpdatePolicy::Diff
    };

    let registry = host_registry()?;
    let (name, handlers) = attach(&registry, target).await?;

    for handler in &handlers {
        let resource = handler.resource_type();
        handler
            .update(&spec, policy)
            .await
            .with_context(|| format!("Failed to update {resource} of {name}"))?;
        info!(container = %name, resource = %resource, policy = ?policy, "Updated");
    }

    println!("✅ Updated {name}");
    Ok(())
}
