//! Spec command implementation

use anyhow::{Context, Result};

use corral_core::ContainerSpec;

use super::{attach, host_registry};
use crate::cli::Target;

pub async fn execute(target: &Target) -> Result<()> {
    let registry = host_registry()?;
    let (name, handlers) = attach(&registry, target).await?;

    let mut spec = ContainerSpec::default();
    for handler in &handlers {
        handler
            .spec(&mut spec)
            .await
            .with_context(|| format!("Failed to read {} of {name}", handler.resource_type()))?;
    }

    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
