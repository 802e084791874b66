//! Cosim Core - Scenario Model for Co-Simulation Orchestration
//!
//! This library holds the coordinator's view of a scenario:
//! 1. **Metadata**: what each simulator declares it can model (`meta`)
//! 2. **Entity Graph**: model instances and their attribute connections
//! 3. **Dataflow Graph**: the simulator-level projection used to order steps
//! 4. **Input Buffers**: values waiting to be delivered with the next step

pub mod buffer;
pub mod data;
pub mod dataflow;
pub mod entity_graph;
pub mod error;
pub mod ids;
pub mod meta;

// Re-export key types for convenience
pub use buffer::InputBuffer;
pub use data::{Inputs, OutputData, OutputRequest, RemoteDataRequest, SetData};
pub use dataflow::DataflowGraph;
pub use entity_graph::{Connection, DelayKind, Entity, EntityGraph, EntityInfo, GraphSnapshot};
pub use error::ConfigurationError;
pub use ids::{FullId, SimId};
pub use meta::{EntityDescriptor, MetaBuilder, ModelMeta, SimMeta, API_VERSION};
