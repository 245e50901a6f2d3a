use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use corral_cgroup::{CgroupFs, FactoryConfig, HostCgroupFs, standard_registry};
use corral_core::{ContainerName, ErrorKind, ResourceType};
use corral_resource::{FactoryRegistry, ResourceHandler};

use crate::cli::{Cli, Commands, Target};

pub mod create;
pub mod destroy;
pub mod enter;
pub mod init;
pub mod mounts;
pub mod spec;
pub mod stats;
pub mod update;
pub mod watch;

/// Dispatch command to appropriate handler
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::InitMachine { config } => init::execute(config.as_deref()).await,

        Commands::Mounts => mounts::execute().await,

        Commands::Create { target, spec } => create::execute(&target, &spec).await,

        Commands::Update {
            target,
            spec,
            replace,
        } => update::execute(&target, &spec, replace).await,

        Commands::Spec { target } => spec::execute(&target).await,

        Commands::Stats { target, full } => stats::execute(&target, full).await,

        Commands::Enter { target, tids } => enter::execute(&target, &tids).await,

        Commands::Destroy { target } => destroy::execute(&target).await,

        Commands::Watch(args) => watch::execute(&args).await,
    }
}

/// Factories for every resource, backed by the host cgroup filesystem
pub fn host_registry() -> Result<FactoryRegistry> {
    let fs: Arc<dyn CgroupFs> = Arc::new(HostCgroupFs::new());
    standard_registry(&fs, FactoryConfig::default()).context("Failed to set up resource factories")
}

pub fn parse_name(raw: &str) -> Result<ContainerName> {
    ContainerName::new(raw).with_context(|| format!("Invalid container name {raw:?}"))
}

/// Parse inline JSON, or the contents of a file given as `@path`
pub async fn load_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let text = match raw.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {path}"))?,
        None => raw.to_string(),
    };

    serde_json::from_str(&text).context("Malformed JSON")
}

/// Handlers for the resources named by `target`
///
/// With no explicit resource list, every resource the container exists
/// for is returned; an explicit list must exist in full.
pub async fn attach(
    registry: &FactoryRegistry,
    target: &Target,
) -> Result<(ContainerName, Vec<Box<dyn ResourceHandler>>)> {
    let name = parse_name(&target.name)?;
    let explicit = !target.resources.is_empty();
    let resources = if explicit {
        target.resources.clone()
    } else {
        registry.resource_types()
    };

    let mut handlers = Vec::with_capacity(resources.len());
    for resource in resources {
        let factory = registry.get(resource)?;
        match factory.get(&name).await {
            Ok(handler) => handlers.push(handler),
            Err(e) if !explicit && e.kind() == ErrorKind::NotFound => {
                tracing::debug!(container = %name, resource = %resource, "Skipping absent resource");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to attach to {resource} of {name}"));
            }
        }
    }

    if handlers.is_empty() {
        anyhow::bail!("Container {name} does not exist");
    }
    Ok((name, handlers))
}

/// Resources to create for a new container
pub fn creation_order(target: &Target, requested: Vec<ResourceType>) -> Vec<ResourceType> {
    if !target.resources.is_empty() {
        return target.resources.clone();
    }
    if requested.is_empty() {
        ResourceType::ALL.to_vec()
    } else {
        requested
    }
}
