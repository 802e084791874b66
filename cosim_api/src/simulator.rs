//! The trait a simulator implements to be driven by the world.

use crate::error::ApiError;
use crate::handle::WorldHandle;
use async_trait::async_trait;
use cosim_core::{EntityDescriptor, Inputs, OutputData, OutputRequest, SimMeta};
use serde_json::{Map, Value};

/// Keyword arguments as received on the wire.
pub type Params = Map<String, Value>;

/// A simulator as seen from its own process.
///
/// Calls arrive strictly one at a time. During [`step`](Simulator::step) the
/// simulator may call back into the world through the [`WorldHandle`].
#[async_trait]
pub trait Simulator: Send + 'static {
    /// Called once with the simulator id and start parameters; returns the
    /// simulator's metadata.
    async fn init(&mut self, sid: &str, params: Params) -> Result<SimMeta, ApiError>;

    /// Instantiates `num` entities of `model`.
    async fn create(
        &mut self,
        num: usize,
        model: &str,
        params: Params,
    ) -> Result<Vec<EntityDescriptor>, ApiError>;

    /// All entities and connections are known; stepping begins next.
    async fn setup_done(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Advances to `time` with the given inputs. Returns the next time this
    /// simulator wants to step, or `None` for no further step.
    async fn step(
        &mut self,
        time: u64,
        inputs: Inputs,
        world: &WorldHandle,
    ) -> Result<Option<u64>, ApiError>;

    /// Returns the requested attribute values.
    async fn get_data(&mut self, outputs: OutputRequest) -> Result<OutputData, ApiError>;

    /// The world is shutting down.
    async fn stop(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Handles a method listed in `SimMeta::extra_methods`.
    async fn extra(&mut self, method: &str, _args: Vec<Value>, _kwargs: Params) -> Result<Value, ApiError> {
        Err(ApiError::UnknownMethod(method.to_string()))
    }
}
