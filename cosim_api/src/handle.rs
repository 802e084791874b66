//! Reverse calls from a stepping simulator into the world.

use crate::error::ApiError;
use cosim_core::{EntityInfo, FullId, GraphSnapshot, OutputData, RemoteDataRequest, SetData};
use cosim_env::{Call, Endpoint};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entities related to one queried entity, keyed by full id.
pub type Related = BTreeMap<String, EntityInfo>;

/// Handle to the world, valid on the connection the simulator was served on.
///
/// Every call requires the world to have granted this simulator
/// `async_requests`; otherwise the world answers with a failure.
#[derive(Clone)]
pub struct WorldHandle {
    endpoint: Arc<Endpoint>,
}

impl WorldHandle {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    async fn invoke<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, ApiError> {
        let value = self.endpoint.call(Call::new(method, args)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run progress as a fraction in `[0, 1]`.
    pub async fn get_progress(&self) -> Result<f64, ApiError> {
        self.invoke("get_progress", Vec::new()).await
    }

    /// The whole entity graph.
    pub async fn get_related_entities(&self) -> Result<GraphSnapshot, ApiError> {
        self.invoke("get_related_entities", Vec::new()).await
    }

    /// Entities adjacent to `id`.
    pub async fn get_related_entities_of(&self, id: &FullId) -> Result<Related, ApiError> {
        self.invoke("get_related_entities", vec![json!(id)]).await
    }

    /// Adjacency for several entities at once.
    pub async fn get_related_entities_many(
        &self,
        ids: &[FullId],
    ) -> Result<BTreeMap<String, Related>, ApiError> {
        self.invoke("get_related_entities", vec![json!(ids)]).await
    }

    /// Reads attributes of other simulators' entities. The reply is keyed by
    /// full id.
    pub async fn get_data(&self, request: &RemoteDataRequest) -> Result<OutputData, ApiError> {
        self.invoke("get_data", vec![json!(request)]).await
    }

    /// Pushes values into other entities' inputs for their next step.
    pub async fn set_data(&self, data: &SetData) -> Result<(), ApiError> {
        let _: Value = self.invoke("set_data", vec![json!(data)]).await?;
        Ok(())
    }
}
