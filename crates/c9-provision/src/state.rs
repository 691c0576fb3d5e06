//! Provisioning run state machine.
//!
//! A run moves forward through a fixed chain of states and ends either in
//! [`ProvisionState::BootstrapDispatched`] or in [`ProvisionState::Failed`].
//! `InstancePending` is the only optional state: an instance that is already
//! running when first discovered goes straight to `InstanceRunning`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::obs::emit_state_transition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "state", content = "reason")]
pub enum ProvisionState {
    Init,
    EnvCreating,
    /// Environment id known; role and instance profile are set up here.
    EnvCreated,
    InstanceDiscovering,
    InstancePending,
    InstanceRunning,
    ProfileAttached,
    EnvValidating,
    EnvReady,
    BootstrapDispatched,
    Failed(String),
}

impl ProvisionState {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionState::Init => "INIT",
            ProvisionState::EnvCreating => "ENV_CREATING",
            ProvisionState::EnvCreated => "ENV_CREATED",
            ProvisionState::InstanceDiscovering => "INSTANCE_DISCOVERING",
            ProvisionState::InstancePending => "INSTANCE_PENDING",
            ProvisionState::InstanceRunning => "INSTANCE_RUNNING",
            ProvisionState::ProfileAttached => "PROFILE_ATTACHED",
            ProvisionState::EnvValidating => "ENV_VALIDATING",
            ProvisionState::EnvReady => "ENV_READY",
            ProvisionState::BootstrapDispatched => "BOOTSTRAP_DISPATCHED",
            ProvisionState::Failed(_) => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionState::BootstrapDispatched | ProvisionState::Failed(_)
        )
    }

    /// Whether `next` may follow `self`.
    ///
    /// Every non-terminal state may fail; terminal states accept nothing.
    pub fn can_transition_to(&self, next: &ProvisionState) -> bool {
        use ProvisionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }

        matches!(
            (self, next),
            (Init, EnvCreating)
                | (EnvCreating, EnvCreated)
                | (EnvCreated, InstanceDiscovering)
                | (InstanceDiscovering, InstancePending)
                | (InstanceDiscovering, InstanceRunning)
                | (InstancePending, InstanceRunning)
                | (InstanceRunning, ProfileAttached)
                | (ProfileAttached, EnvValidating)
                | (EnvValidating, EnvReady)
                | (EnvReady, BootstrapDispatched)
        )
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::Failed(reason) => write!(f, "FAILED({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// A state entered during a run, with the time it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: ProvisionState,
    pub entered_at: DateTime<Utc>,
}

/// Tracks the current state of one run and the history that led to it.
#[derive(Debug, Clone)]
pub struct StateTracker {
    run_id: String,
    current: ProvisionState,
    history: Vec<StateTransition>,
}

impl StateTracker {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current: ProvisionState::Init,
            history: vec![StateTransition {
                state: ProvisionState::Init,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> &ProvisionState {
        &self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn into_history(self) -> Vec<StateTransition> {
        self.history
    }

    /// Move to `next`.
    ///
    /// Illegal transitions are a programming error in the workflow and are
    /// ignored (with a warning) rather than corrupting the history.
    pub fn advance(&mut self, next: ProvisionState) -> bool {
        if !self.current.can_transition_to(&next) {
            tracing::warn!(
                run_id = %self.run_id,
                from = %self.current,
                to = %next,
                "ignoring illegal state transition"
            );
            return false;
        }

        emit_state_transition(&self.run_id, &self.current, &next);
        self.current = next.clone();
        self.history.push(StateTransition {
            state: next,
            entered_at: Utc::now(),
        });
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.advance(ProvisionState::Failed(reason.into()))
    }
}
