//! Cosim World - Co-simulation Coordinator
//!
//! The world drives independently implemented simulators through a shared
//! discrete timeline and moves data between them along declared
//! connections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            World                             │
//! │  EntityGraph ──► DataflowGraph ──► scheduler (step slots)    │
//! │                                        │          ▲          │
//! │                              step/get_data   reverse calls   │
//! │  ┌──────────┐   ┌──────────┐   ┌───────▼──┐       │          │
//! │  │ SimProxy │   │ SimProxy │   │ SimProxy │ ──────┘          │
//! │  └────┬─────┘   └────┬─────┘   └────┬─────┘                  │
//! └───────┼──────────────┼──────────────┼────────────────────────┘
//!         │ in-process   │ cmd (TCP)    │ connect (TCP)
//!     Simulator       process         remote server
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cosim_world::{SimulatorSpec, StartParams, World, WorldConfig};
//! use cosim_core::DelayKind;
//!
//! let config = WorldConfig::default()
//!     .with_simulator("Grid", SimulatorSpec::cmd("grid-sim %(addr)s"))
//!     .with_simulator("Load", SimulatorSpec::connect("10.0.0.7:5678"));
//!
//! let mut world = World::new(config);
//! let grid = world.start("Grid", StartParams::new().fixed_step(60)).await?;
//! let load = world.start("Load", StartParams::new().fixed_step(15)).await?;
//! let bus = world.create(&grid, "Bus", 1, Default::default()).await?;
//! let house = world.create(&load, "House", 1, Default::default()).await?;
//! world.connect(&house[0], &bus[0], [("p_out", "p")], DelayKind::Immediate)?;
//! world.run(3600).await?;
//! world.shutdown().await;
//! ```

mod callbacks;
pub mod config;
pub mod error;
pub mod probe;
pub mod proxy;
pub mod runner;
mod scheduler;
pub mod scenarios;
mod starter;
pub mod world;

pub use config::{
    FailurePolicy, SimulatorSpec, StartParams, StepMode, StepTimePolicy, WorldConfig,
    ADDR_PLACEHOLDER,
};
pub use error::{SimulationError, WorldError};
pub use probe::{ObservedStep, ProbeSim, StepLog, PROBE_MODEL};
pub use proxy::{resolve_next_step, SimProxy, SimState};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use world::{same_attrs, RunReport, StepRecord, World};

