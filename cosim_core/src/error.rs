//! Scenario configuration errors.

use thiserror::Error;

/// An invalid scenario. Always fatal at setup and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Simulator {sid} speaks API version {found}, expected {expected}")]
    ApiVersion {
        sid: String,
        expected: String,
        found: String,
    },

    #[error("Unknown simulator: {0}")]
    UnknownSimulator(String),

    #[error("Simulator {sid} has no model {model}")]
    UnknownModel { sid: String, model: String },

    #[error("Model {model} of simulator {sid} is not public")]
    ModelNotPublic { sid: String, model: String },

    #[error("Model {model} has no parameter {param}")]
    UnknownParam { model: String, param: String },

    #[error("Entity {0} already exists")]
    DuplicateEntity(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid full id {0:?} (expected \"sid.eid\")")]
    InvalidFullId(String),

    #[error("Entity {entity} has no {role} attribute {attr}")]
    UnknownAttribute {
        entity: String,
        attr: String,
        role: &'static str,
    },

    #[error("Cannot connect {src} to {dst}: both belong to the same simulator")]
    SameSimulator { src: String, dst: String },

    #[error("Connection {src} -> {dst} names no attributes")]
    EmptyConnection { src: String, dst: String },

    #[error("Connections cannot be added once stepping has begun")]
    GraphFrozen,

    #[error("Undecidable stepping order: immediate cycle through {}", .0.join(" -> "))]
    ImmediateCycle(Vec<String>),

    #[error("Invalid run window: until {until} is not after start {start}")]
    InvalidRunWindow { start: u64, until: u64 },

    #[error("Simulator {0} has no launch configuration")]
    UnknownLaunch(String),

    #[error("Simulator {0}: fixed step size must be positive")]
    ZeroStepSize(String),
}
