//! Coordinator error types.

use cosim_core::{ConfigurationError, SimId};
use cosim_env::CallError;
use serde::Serialize;
use thiserror::Error;

/// A simulator failed during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("Simulator {sid} failed at t={time}: {reason}")]
pub struct SimulationError {
    pub sid: SimId,
    pub time: u64,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    /// A setup call (`init`, `create`, `setup_done`) failed
    #[error("Call to {sid} failed: {source}")]
    Call {
        sid: SimId,
        #[source]
        source: CallError,
    },

    #[error("Failed to launch {sid}: {reason}")]
    Launch { sid: String, reason: String },

    /// Simulators are due but none can be dispatched
    #[error("Scheduler stalled at t={0}")]
    Stalled(u64),

    #[error("Invalid operation: {0}")]
    InvalidState(String),
}

impl WorldError {
    pub(crate) fn call(sid: &SimId, source: CallError) -> Self {
        Self::Call {
            sid: sid.clone(),
            source,
        }
    }

    pub(crate) fn launch(sid: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Launch {
            sid: sid.into(),
            reason: reason.to_string(),
        }
    }
}
