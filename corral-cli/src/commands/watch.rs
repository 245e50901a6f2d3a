//! Watch command implementation

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use corral_core::{
    ContainerEmptyEvent, ErrorKind, EventSpec, MemorySize, MemoryThresholdEvent, OomEvent,
    ResourceType,
};
use corral_resource::NotificationCallback;

use super::{host_registry, parse_name};
use crate::cli::WatchArgs;

fn event_spec(args: &WatchArgs) -> (ResourceType, EventSpec) {
    if let Some(mb) = args.threshold_mb {
        let spec = EventSpec {
            memory_threshold: Some(MemoryThresholdEvent {
                usage: MemorySize::from_mb(mb),
            }),
            ..Default::default()
        };
        (ResourceType::Memory, spec)
    } else if args.oom {
        let spec = EventSpec {
            oom: Some(OomEvent {}),
            ..Default::default()
        };
        (ResourceType::Memory, spec)
    } else {
        let spec = EventSpec {
            container_empty: Some(ContainerEmptyEvent {}),
            ..Default::default()
        };
        (ResourceType::Monitoring, spec)
    }
}

pub async fn execute(args: &WatchArgs) -> Result<()> {
    let name = parse_name(&args.name)?;
    let (resource, spec) = event_spec(args);

    let registry = host_registry()?;
    let handler = registry
        .get(resource)?
        .get(&name)
        .await
        .with_context(|| format!("Failed to attach to {resource} of {name}"))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: NotificationCallback = Box::new(move |status: corral_core::Result<()>| {
        let _ = tx.send(status);
    });
    let id = handler
        .register_notification(&spec, callback)
        .await
        .context("Failed to register for events")?;

    info!(container = %name, notification = %id, "Watching");
    println!("👀 Watching {name} (Ctrl+C to stop)");

    let mut seen = 0;
    let mut ended = false;
    while seen < args.count {
        tokio::select! {
            status = rx.recv() => match status {
                Some(Ok(())) => {
                    seen += 1;
                    println!("🔔 Event {seen} on {name}");
                }
                Some(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                    ended = true;
                    break;
                }
                Some(Err(e)) => {
                    return Err(e).context("Event delivery failed");
                }
                None => {
                    ended = true;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if !ended {
        handler.unregister_notification(id).await?;
    }
    Ok(())
}
