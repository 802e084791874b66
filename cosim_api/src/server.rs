//! Serves one simulator over one connection.

use crate::error::ApiError;
use crate::handle::WorldHandle;
use crate::simulator::Simulator;
use cosim_env::{Call, Endpoint, FrameTransport, IncomingRequest, StreamTransport};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Request loop for a single simulator.
///
/// Requests are handled strictly in arrival order. Reverse calls made during
/// `step` are answered by the endpoint's reader task, so the loop itself
/// never has to interleave them.
pub struct SimulatorServer {
    sim: Box<dyn Simulator>,
    endpoint: Arc<Endpoint>,
    requests: mpsc::UnboundedReceiver<IncomingRequest>,
    world: WorldHandle,
}

impl SimulatorServer {
    pub fn new<T: FrameTransport>(sim: Box<dyn Simulator>, transport: T) -> Self {
        let (tx, requests) = mpsc::unbounded_channel();
        let endpoint = Endpoint::spawn("world", transport, tx);
        let world = WorldHandle::new(Arc::clone(&endpoint));
        Self {
            sim,
            endpoint,
            requests,
            world,
        }
    }

    /// Serves until `stop` or until the world disconnects.
    pub async fn run(mut self) -> Result<(), ApiError> {
        while let Some(request) = self.requests.recv().await {
            let IncomingRequest { id, call, .. } = request;
            let is_stop = call.method == "stop";

            let result = self.dispatch(call).await.map_err(|e| {
                warn!(error = %e, "Request failed");
                e.to_string()
            });
            self.endpoint.reply(id, result).await?;

            if is_stop {
                info!("Stopped by world");
                break;
            }
        }
        self.endpoint.close().await;
        Ok(())
    }

    #[instrument(skip(self, call), fields(method = %call.method))]
    async fn dispatch(&mut self, call: Call) -> Result<Value, ApiError> {
        match call.method.as_str() {
            "init" => {
                let sid: String = arg(&call, 0)?;
                let meta = self.sim.init(&sid, call.kwargs).await?;
                debug!(sid, models = meta.models.len(), "Initialized");
                Ok(serde_json::to_value(meta)?)
            }
            "create" => {
                let num: usize = arg(&call, 0)?;
                let model: String = arg(&call, 1)?;
                let entities = self.sim.create(num, &model, call.kwargs).await?;
                Ok(serde_json::to_value(entities)?)
            }
            "setup_done" => {
                self.sim.setup_done().await?;
                Ok(Value::Null)
            }
            "step" => {
                let time: u64 = arg(&call, 0)?;
                let inputs = arg(&call, 1)?;
                let next = self.sim.step(time, inputs, &self.world).await?;
                Ok(serde_json::to_value(next)?)
            }
            "get_data" => {
                let outputs = arg(&call, 0)?;
                let data = self.sim.get_data(outputs).await?;
                Ok(serde_json::to_value(data)?)
            }
            "stop" => {
                self.sim.stop().await?;
                Ok(Value::Null)
            }
            other => {
                let method = other.to_string();
                self.sim.extra(&method, call.args, call.kwargs).await
            }
        }
    }
}

/// Deserializes positional argument `index`; absent arguments read as null.
fn arg<T: DeserializeOwned>(call: &Call, index: usize) -> Result<T, ApiError> {
    serde_json::from_value(call.arg(index)).map_err(|e| ApiError::BadArgument {
        method: call.method.clone(),
        index,
        reason: e.to_string(),
    })
}

/// Serves `sim` over an established transport.
pub async fn serve<T: FrameTransport>(sim: Box<dyn Simulator>, transport: T) -> Result<(), ApiError> {
    SimulatorServer::new(sim, transport).run().await
}

/// Accepts a single world connection on `listener` and serves it.
pub async fn serve_listener(sim: Box<dyn Simulator>, listener: TcpListener) -> Result<(), ApiError> {
    let (stream, peer) = listener.accept().await?;
    info!(%peer, "World connected");
    serve(sim, StreamTransport::tcp(stream)).await
}

/// Dials the world at `addr` and serves it.
pub async fn serve_connect(sim: Box<dyn Simulator>, addr: &str) -> Result<(), ApiError> {
    let stream = TcpStream::connect(addr).await?;
    info!(addr, "Connected to world");
    serve(sim, StreamTransport::tcp(stream)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Params;
    use async_trait::async_trait;
    use cosim_core::{EntityDescriptor, Inputs, ModelMeta, OutputData, OutputRequest, SimMeta};
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Counts steps; `value` reads the count.
    #[derive(Default)]
    struct Counter {
        steps: u64,
        eids: Vec<String>,
    }

    #[async_trait]
    impl Simulator for Counter {
        async fn init(&mut self, _sid: &str, _params: Params) -> Result<SimMeta, ApiError> {
            Ok(SimMeta::builder()
                .model("C", ModelMeta::public().with_attrs(["value"]))
                .build())
        }

        async fn create(
            &mut self,
            num: usize,
            model: &str,
            _params: Params,
        ) -> Result<Vec<EntityDescriptor>, ApiError> {
            let start = self.eids.len();
            let created: Vec<EntityDescriptor> = (start..start + num)
                .map(|i| EntityDescriptor::new(format!("c{}", i), model))
                .collect();
            self.eids.extend(created.iter().map(|d| d.eid.clone()));
            Ok(created)
        }

        async fn step(
            &mut self,
            time: u64,
            _inputs: Inputs,
            world: &WorldHandle,
        ) -> Result<Option<u64>, ApiError> {
            self.steps += 1;
            if time == 99 {
                world.get_progress().await?;
            }
            Ok(Some(time + 1))
        }

        async fn get_data(&mut self, outputs: OutputRequest) -> Result<OutputData, ApiError> {
            Ok(outputs
                .into_iter()
                .map(|(eid, _)| (eid, BTreeMap::from([("value".to_string(), json!(self.steps))])))
                .collect())
        }
    }

    fn start() -> (Arc<Endpoint>, mpsc::UnboundedReceiver<IncomingRequest>, tokio::task::JoinHandle<Result<(), ApiError>>) {
        let (world_side, sim_side) = StreamTransport::in_memory_pair("world", "sim");
        let server = tokio::spawn(serve(Box::new(Counter::default()), sim_side));
        let (tx, rx) = mpsc::unbounded_channel();
        (Endpoint::spawn("Counter-0", world_side, tx), rx, server)
    }

    #[tokio::test]
    async fn test_protocol_sequence() {
        let (world, _requests, server) = start();

        let meta: SimMeta =
            serde_json::from_value(world.request("init", vec![json!("Counter-0")]).await.unwrap())
                .unwrap();
        assert!(meta.model("C").is_some());

        let created = world.request("create", vec![json!(2), json!("C")]).await.unwrap();
        assert_eq!(created[1]["eid"], json!("c1"));

        world.request("setup_done", vec![]).await.unwrap();
        let next = world.request("step", vec![json!(0), json!({})]).await.unwrap();
        assert_eq!(next, json!(1));

        let data = world
            .request("get_data", vec![json!({"c0": ["value"]})])
            .await
            .unwrap();
        assert_eq!(data["c0"]["value"], json!(1));

        assert_eq!(world.request("stop", vec![]).await.unwrap(), Value::Null);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_arguments_and_unknown_method_fail_request() {
        let (world, _requests, _server) = start();

        let err = world.request("step", vec![json!("soon")]).await.unwrap_err();
        assert!(err.to_string().contains("bad argument 0"), "{err}");

        let err = world.request("warp", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("Unknown method"), "{err}");

        // The connection survives failed requests
        let next = world.request("step", vec![json!(4), json!({})]).await.unwrap();
        assert_eq!(next, json!(5));
    }

    #[tokio::test]
    async fn test_reverse_call_during_step() {
        let (world, mut requests, _server) = start();

        let step = {
            let world = Arc::clone(&world);
            tokio::spawn(async move { world.request("step", vec![json!(99), json!({})]).await })
        };

        let reverse = requests.recv().await.unwrap();
        assert_eq!(reverse.call.method, "get_progress");
        world.reply(reverse.id, Ok(json!(0.5))).await.unwrap();

        assert_eq!(step.await.unwrap().unwrap(), json!(100));
    }

    #[tokio::test]
    async fn test_server_exits_when_world_disconnects() {
        let (world, _requests, server) = start();
        world.close().await;
        server.await.unwrap().unwrap();
    }
}
