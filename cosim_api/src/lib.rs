//! Cosim API - Simulator-side Protocol Binding
//!
//! Implement [`Simulator`] and hand it to [`start_simulation`] (or to
//! [`serve`] for an in-process transport):
//!
//! ```text
//! world ──init/create/step/get_data/stop──► SimulatorServer ──► Simulator
//!       ◄──get_progress/get_data/set_data── WorldHandle ◄──────┘ (during step)
//! ```

pub mod cli;
pub mod error;
pub mod handle;
pub mod server;
pub mod simulator;

pub use cli::{init_logging, run_simulation, start_simulation, ApiArgs};
pub use error::ApiError;
pub use handle::{Related, WorldHandle};
pub use server::{serve, serve_connect, serve_listener, SimulatorServer};
pub use simulator::{Params, Simulator};
