//! Create command implementation

use anyhow::{Context, Result};
use tracing::{info, warn};

use corral_core::ContainerSpec;

use super::{creation_order, host_registry, load_json, parse_name};
use crate::cli::Target;

/// Create every requested resource; already created ones are rolled back
/// if a later one fails.
pub async fn execute(target: &Target, raw_spec: &str) -> Result<()> {
    let name = parse_name(&target.name)?;
    let spec: ContainerSpec = load_json(raw_spec).await.context("Invalid container spec")?;
    let registry = host_registry()?;

    let mut created = Vec::new();
    for resource in creation_order(target, spec.resources()) {
        let factory = registry.get(resource)?;
        match factory.create(&name, &spec).await {
            Ok(handler) => {
                info!(container = %name, resource = %resource, "Created");
                created.push(handler);
            }
            Err(e) => {
                for handler in created.into_iter().rev() {
                    if let Err(err) = handler.destroy().await {
                        warn!(container = %name, error = %err, "Rollback failed");
                    }
                }
                return Err(e).with_context(|| format!("Failed to create {resource} for {name}"));
            }
        }
    }

    println!("✅ Created {name}");
    Ok(())
}
