//! Enter command implementation

use anyhow::{Context, Result};
use tracing::info;

use corral_core::ThreadId;

use super::{attach, host_registry};
use crate::cli::Target;

pub async fn execute(target: &Target, raw_tids: &[i32]) -> Result<()> {
    let tids: Vec<ThreadId> = if raw_tids.is_empty() {
        vec![ThreadId::current()]
    } else {
        raw_tids.iter().copied().map(ThreadId::from_raw).collect()
    };

    let registry = host_registry()?;
    let (name, handlers) = attach(&registry, target).await?;

    for handler in &handlers {
        let resource = handler.resource_type();
        handler
            .enter(&tids)
            .await
            .with_context(|| format!("Failed to enter {resource} of {name}"))?;
        info!(container = %name, resource = %resource, count = tids.len(), "Entered");
    }

    println!("✅ Moved {} thread(s) into {name}", tids.len());
    Ok(())
}
