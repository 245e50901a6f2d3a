//! Handler lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::{ContainerName, EventKind, NotificationId, ResourceType, UpdatePolicy};

/// Events emitted as a resource handler moves through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerEvent {
    /// Resource provisioned for a new container
    Created {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Handler attached to an existing container
    Attached {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Configuration updated
    Updated {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Policy the update was applied with
        policy: UpdatePolicy,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Tasks moved into the container
    Entered {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Number of tasks requested
        tasks: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Notification registered
    NotificationRegistered {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Subscription id
        id: NotificationId,
        /// Watched event
        event: EventKind,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Notification delivery broke down
    NotificationFailed {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Subscription id
        id: NotificationId,
        /// Error message
        message: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Resource released and handler gone
    Destroyed {
        /// Container name
        container: ContainerName,
        /// Resource type
        resource: ResourceType,
        /// Subscriptions cancelled by the teardown
        cancelled_notifications: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl HandlerEvent {
    /// Get the container name from any event
    #[must_use]
    pub const fn container(&self) -> &ContainerName {
        match self {
            Self::Created { container, .. }
            | Self::Attached { container, .. }
            | Self::Updated { container, .. }
            | Self::Entered { container, .. }
            | Self::NotificationRegistered { container, .. }
            | Self::NotificationFailed { container, .. }
            | Self::Destroyed { container, .. } => container,
        }
    }

    /// Get the resource type from any event
    #[must_use]
    pub const fn resource(&self) -> ResourceType {
        match self {
            Self::Created { resource, .. }
            | Self::Attached { resource, .. }
            | Self::Updated { resource, .. }
            | Self::Entered { resource, .. }
            | Self::NotificationRegistered { resource, .. }
            | Self::NotificationFailed { resource, .. }
            | Self::Destroyed { resource, .. } => *resource,
        }
    }

    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::Created { timestamp, .. }
            | Self::Attached { timestamp, .. }
            | Self::Updated { timestamp, .. }
            | Self::Entered { timestamp, .. }
            | Self::NotificationRegistered { timestamp, .. }
            | Self::NotificationFailed { timestamp, .. }
            | Self::Destroyed { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this is a critical event
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::NotificationFailed { .. })
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        let container = self.container();
        let resource = self.resource();
        match self {
            Self::Created { .. } => {
                tracing::info!(
                    container = %container,
                    resource = %resource,
                    event = "created",
                    "Resource created"
                );
            }
            Self::Attached { .. } => {
                tracing::debug!(
                    container = %container,
                    resource = %resource,
                    event = "attached",
                    "Attached to existing resource"
                );
            }
            Self::Updated { policy, .. } => {
                tracing::info!(
                    container = %container,
                    resource = %resource,
                    policy = ?policy,
                    event = "updated",
                    "Resource updated"
                );
            }
            Self::Entered { tasks, .. } => {
                tracing::debug!(
                    container = %container,
                    resource = %resource,
                    tasks,
                    event = "entered",
                    "Tasks entered"
                );
            }
            Self::NotificationRegistered { id, event, .. } => {
                tracing::debug!(
                    container = %container,
                    resource = %resource,
                    notification = %id,
                    watched = %event,
                    event = "notification_registered",
                    "Notification registered"
                );
            }
            Self::NotificationFailed { id, message, .. } => {
                tracing::error!(
                    container = %container,
                    resource = %resource,
                    notification = %id,
                    message = %message,
                    event = "notification_failed",
                    "Notification delivery failed"
                );
            }
            Self::Destroyed {
                cancelled_notifications,
                ..
            } => {
                tracing::info!(
                    container = %container,
                    resource = %resource,
                    cancelled_notifications,
                    event = "destroyed",
                    "Resource destroyed"
                );
            }
        }
    }
}

impl fmt::Display for HandlerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let container = self.container();
        let resource = self.resource();
        match self {
            Self::Created { .. } => write!(f, "{resource} for {container} created"),
            Self::Attached { .. } => write!(f, "{resource} for {container} attached"),
            Self::Updated { policy, .. } => {
                write!(f, "{resource} for {container} updated ({policy:?})")
            }
            Self::Entered { tasks, .. } => {
                write!(f, "{tasks} task(s) entered {resource} of {container}")
            }
            Self::NotificationRegistered { id, event, .. } => {
                write!(f, "notification {id} on {resource} of {container} watches {event}")
            }
            Self::NotificationFailed { id, message, .. } => {
                write!(f, "notification {id} on {resource} of {container} failed: {message}")
            }
            Self::Destroyed { .. } => write!(f, "{resource} for {container} destroyed"),
        }
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
