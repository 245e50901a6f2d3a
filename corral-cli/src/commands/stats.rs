//! Stats command implementation

use anyhow::{Context, Result};

use corral_core::{ContainerStats, StatsType};

use super::{attach, host_registry};
use crate::cli::Target;

pub async fn execute(target: &Target, full: bool) -> Result<()> {
    tracing::info!(container = %target.name, full, "Getting stats");

    let stats_type = if full {
        StatsType::Full
    } else {
        StatsType::Summary
    };

    let registry = host_registry()?;
    let (name, handlers) = attach(&registry, target).await?;

    let mut stats = ContainerStats::default();
    for handler in &handlers {
        handler
            .stats(stats_type, &mut stats)
            .await
            .with_context(|| format!("Failed to read {} stats of {name}", handler.resource_type()))?;
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
