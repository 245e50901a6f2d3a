//! Handler state machine
//!
//! ```text
//! Constructed --create--> Active --destroy--> Destroyed
//!                           ^ (get attaches here directly)
//! ```
//!
//! Ordinary operations hold a shared guard for their whole duration; state
//! transitions take the exclusive side, so a teardown waits for every call
//! that started before it and every later call observes the new state.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use corral_core::{Error, Result};

/// Lifecycle position of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Allocated, not yet configured
    Constructed,
    /// Configured and serving calls
    Active,
    /// Backend state released; terminal
    Destroyed,
}

impl HandlerState {
    fn reject(self) -> Error {
        match self {
            Self::Constructed => Error::unavailable("handler has not been created yet"),
            Self::Active => Error::already_exists("handler is already active"),
            Self::Destroyed => Error::not_found("handler has been destroyed"),
        }
    }
}

/// Gate serializing state transitions against in-flight operations
#[derive(Debug)]
pub struct Lifecycle {
    state: RwLock<HandlerState>,
}

impl Lifecycle {
    /// Gate for a handler that still needs `create`
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(HandlerState::Constructed)
    }

    /// Gate for a handler attached to existing state
    #[must_use]
    pub fn active() -> Self {
        Self::starting_at(HandlerState::Active)
    }

    fn starting_at(state: HandlerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Current state
    pub async fn state(&self) -> HandlerState {
        *self.state.read().await
    }

    /// Admit an ordinary operation
    ///
    /// The returned guard must be held until the operation finishes.
    ///
    /// # Errors
    /// Rejects the call unless the handler is active.
    pub async fn enter(&self) -> Result<RwLockReadGuard<'_, HandlerState>> {
        let guard = self.state.read().await;
        match *guard {
            HandlerState::Active => Ok(guard),
            other => Err(other.reject()),
        }
    }

    /// Start a transition out of `from`
    ///
    /// Waits for in-flight operations. The transition only takes effect on
    /// [`Transition::commit`]; dropping it leaves the state unchanged.
    pub async fn transition(&self, from: HandlerState, to: HandlerState) -> Result<Transition<'_>> {
        let guard = self.state.write().await;
        if *guard != from {
            return Err(guard.reject());
        }
        Ok(Transition { guard, to })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a handler's state during a transition
#[derive(Debug)]
pub struct Transition<'a> {
    guard: RwLockWriteGuard<'a, HandlerState>,
    to: HandlerState,
}

impl Transition<'_> {
    /// Target state
    #[must_use]
    pub const fn target(&self) -> HandlerState {
        self.to
    }

    /// Make the transition visible
    pub fn commit(mut self) {
        *self.guard = self.to;
    }
}
