//! World - the coordinator instance.
//!
//! Lifecycle: `new` → `start` / `create` / `connect` → `run` (possibly
//! several times with a growing horizon) → `shutdown`.

use crate::callbacks::RelayWaits;
use crate::config::{StartParams, StepMode, WorldConfig};
use crate::error::{SimulationError, WorldError};
use crate::proxy::{SimProxy, SimState};
use crate::starter::launch;
use cosim_core::{
    ConfigurationError, DataflowGraph, DelayKind, EntityDescriptor, EntityGraph, FullId, Inputs,
    SimId, SimMeta,
};
use cosim_env::{Call, CallError, Endpoint, IncomingRequest};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One completed step, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub sid: SimId,
    pub time: u64,
    pub next_step: Option<u64>,
    pub inputs: Inputs,
}

/// Summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub start: u64,
    pub until: u64,

    /// Last simulation time at which any simulator stepped
    pub final_time: Option<u64>,

    pub steps: usize,

    pub failures: Vec<SimulationError>,
}

/// Where one output attribute goes after its simulator stepped.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub src_eid: String,
    pub src_attr: String,
    pub src: String,
    pub dst: FullId,
    pub dst_attr: String,
    pub delay: DelayKind,
}

/// Connects attributes with identical names on both sides.
pub fn same_attrs<I, S>(names: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(|n| {
            let n = n.into();
            (n.clone(), n)
        })
        .collect()
}

/// The co-simulation coordinator.
pub struct World {
    pub(crate) config: WorldConfig,

    pub(crate) graph: EntityGraph,

    /// Built when stepping begins
    pub(crate) dataflow: Option<DataflowGraph>,

    pub(crate) proxies: BTreeMap<SimId, SimProxy>,

    /// Instances started per simulator name
    counters: BTreeMap<String, usize>,

    /// Reverse requests from every connection
    pub(crate) requests_tx: mpsc::UnboundedSender<IncomingRequest>,
    pub(crate) requests_rx: mpsc::UnboundedReceiver<IncomingRequest>,

    /// Output routes per source simulator
    pub(crate) routes: BTreeMap<SimId, Vec<Route>>,

    /// Remote `get_data` relays in flight
    pub(crate) relay_waits: RelayWaits,

    /// Current scheduler time
    pub(crate) time: u64,

    /// End of the current run (exclusive)
    pub(crate) until: u64,

    pub(crate) last_time: Option<u64>,

    pub(crate) history: Vec<StepRecord>,

    pub(crate) failures: Vec<SimulationError>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let start = config.start_time;
        Self {
            config,
            graph: EntityGraph::new(),
            dataflow: None,
            proxies: BTreeMap::new(),
            counters: BTreeMap::new(),
            requests_tx,
            requests_rx,
            routes: BTreeMap::new(),
            relay_waits: RelayWaits::default(),
            time: start,
            until: start,
            last_time: None,
            history: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Launches the simulator configured as `name` and initializes it.
    /// Returns its id (`name-N`).
    pub async fn start(&mut self, name: &str, params: StartParams) -> Result<SimId, WorldError> {
        if self.graph.is_frozen() {
            return Err(WorldError::InvalidState(
                "simulators cannot be started once stepping has begun".to_string(),
            ));
        }
        let spec = self
            .config
            .sim_config
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownLaunch(name.to_string()))?;

        let counter = self.counters.entry(name.to_string()).or_insert(0);
        let sid = SimId::new(format!("{}-{}", name, counter));
        *counter += 1;

        if params.step == StepMode::Fixed(0) {
            return Err(ConfigurationError::ZeroStepSize(sid.to_string()).into());
        }

        let launched = launch(&sid, &spec, &self.config, self.requests_tx.clone()).await?;
        let endpoint = Arc::clone(&launched.endpoint);

        let meta = match self.init_simulator(&sid, &endpoint, &params).await {
            Ok(meta) => meta,
            Err(e) => {
                endpoint.close().await;
                if let Some(mut child) = launched.child {
                    let _ = child.start_kill();
                }
                if let Some(server) = launched.server {
                    server.abort();
                }
                return Err(e);
            }
        };

        info!(%sid, mode = spec.mode(), models = meta.models.len(), "Simulator started");
        self.graph.register_simulator(sid.clone(), meta.clone());

        let mut proxy = SimProxy::new(
            sid.clone(),
            meta,
            endpoint,
            params.step,
            params.async_requests,
            self.config.start_time,
        );
        proxy.child = launched.child;
        proxy.server = launched.server;
        self.proxies.insert(sid.clone(), proxy);
        Ok(sid)
    }

    async fn init_simulator(
        &mut self,
        sid: &SimId,
        endpoint: &Arc<Endpoint>,
        params: &StartParams,
    ) -> Result<SimMeta, WorldError> {
        let init = Call::new("init", vec![json!(sid)]).with_kwargs(params.init_kwargs());
        let value = self
            .call_serving(endpoint, init)
            .await
            .map_err(|e| WorldError::call(sid, e))?;
        let meta: SimMeta =
            serde_json::from_value(value).map_err(|e| WorldError::call(sid, e.into()))?;
        meta.check_version(sid.as_str())?;
        Ok(meta)
    }

    /// Instantiates `num` entities of a public model. Returns the full ids
    /// of the top-level entities.
    pub async fn create(
        &mut self,
        sid: &SimId,
        model: &str,
        num: usize,
        params: Map<String, Value>,
    ) -> Result<Vec<FullId>, WorldError> {
        let proxy = self
            .proxies
            .get(sid)
            .ok_or_else(|| ConfigurationError::UnknownSimulator(sid.to_string()))?;
        if proxy.is_stopped() {
            return Err(WorldError::InvalidState(format!("{} is stopped", sid)));
        }

        let model_meta = proxy.meta.model(model).ok_or_else(|| ConfigurationError::UnknownModel {
            sid: sid.to_string(),
            model: model.to_string(),
        })?;
        if !model_meta.public {
            return Err(ConfigurationError::ModelNotPublic {
                sid: sid.to_string(),
                model: model.to_string(),
            }
            .into());
        }
        if let Some(param) = params.keys().find(|p| !model_meta.params.contains(*p)) {
            return Err(ConfigurationError::UnknownParam {
                model: model.to_string(),
                param: param.clone(),
            }
            .into());
        }

        let endpoint = Arc::clone(&proxy.endpoint);
        let call = Call::new("create", vec![json!(num), json!(model)]).with_kwargs(params);
        let value = self
            .call_serving(&endpoint, call)
            .await
            .map_err(|e| WorldError::call(sid, e))?;
        let descriptors: Vec<EntityDescriptor> =
            serde_json::from_value(value).map_err(|e| WorldError::call(sid, e.into()))?;

        if descriptors.len() != num {
            warn!(%sid, model, requested = num, created = descriptors.len(), "Entity count mismatch");
        }
        let ids = self.graph.add_descriptors(sid, &descriptors)?;
        debug!(%sid, model, count = ids.len(), "Entities created");
        Ok(ids)
    }

    /// Declares a connection `src -> dst` over the given attribute pairs.
    pub fn connect<I, A, B>(
        &mut self,
        src: &FullId,
        dst: &FullId,
        attrs: I,
        delay: DelayKind,
    ) -> Result<(), WorldError>
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let attrs = attrs
            .into_iter()
            .map(|(a, b)| (a.into(), b.into()))
            .collect();
        self.graph.add_connection(src, dst, attrs, delay)?;
        Ok(())
    }

    /// Asks for `sid` to step at `time`. Under the earliest-wins policy the
    /// request can only bring the next step forward.
    pub fn request_step(&mut self, sid: &SimId, time: u64) -> Result<bool, WorldError> {
        let floor = self.last_time.map_or(self.config.start_time, |t| t + 1);
        if time < floor {
            return Err(WorldError::InvalidState(format!(
                "step request for {} at {} is in the past",
                sid, time
            )));
        }
        let policy = self.config.step_policy;
        let proxy = self
            .proxies
            .get_mut(sid)
            .ok_or_else(|| ConfigurationError::UnknownSimulator(sid.to_string()))?;
        let accepted = proxy.request_step(time, policy);
        debug!(%sid, time, accepted, "Step requested");
        Ok(accepted)
    }

    /// Run progress as a fraction of the current run window.
    pub fn progress(&self) -> f64 {
        if self.until <= self.config.start_time {
            return 0.0;
        }
        let done = self.time.saturating_sub(self.config.start_time) as f64;
        (done / (self.until - self.config.start_time) as f64).clamp(0.0, 1.0)
    }

    /// Current scheduler time.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn failures(&self) -> &[SimulationError] {
        &self.failures
    }

    pub fn entity_graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn dataflow(&self) -> Option<&DataflowGraph> {
        self.dataflow.as_ref()
    }

    pub fn proxy(&self, sid: &SimId) -> Option<&SimProxy> {
        self.proxies.get(sid)
    }

    pub fn sim_state(&self, sid: &SimId) -> Option<SimState> {
        self.proxies.get(sid).map(|p| p.state)
    }

    pub(crate) fn report(&self) -> RunReport {
        RunReport {
            start: self.config.start_time,
            until: self.until,
            final_time: self.last_time,
            steps: self.history.len(),
            failures: self.failures.clone(),
        }
    }

    /// Awaits a call while answering reverse requests from any simulator.
    pub(crate) async fn call_serving(
        &mut self,
        endpoint: &Arc<Endpoint>,
        call: Call,
    ) -> Result<Value, CallError> {
        let endpoint = Arc::clone(endpoint);
        let reply = endpoint.call(call);
        tokio::pin!(reply);
        loop {
            tokio::select! {
                result = &mut reply => return result,
                Some(request) = self.requests_rx.recv() => self.serve_request(request).await,
            }
        }
    }

    /// Sends `stop` to every simulator and releases all connections.
    ///
    /// Simulators that do not answer within the stop timeout are cut off.
    pub async fn shutdown(&mut self) {
        let timeout = self.config.stop_timeout;
        for (sid, proxy) in self.proxies.iter_mut() {
            if !proxy.endpoint.is_closed() {
                match tokio::time::timeout(timeout, proxy.endpoint.request("stop", Vec::new())).await {
                    Ok(Ok(_)) => debug!(%sid, "Simulator stopped"),
                    Ok(Err(e)) => warn!(%sid, error = %e, "Stop failed"),
                    Err(_) => warn!(%sid, timeout_ms = timeout.as_millis() as u64, "Stop timed out"),
                }
            }
            proxy.endpoint.close().await;

            if let Some(mut child) = proxy.child.take() {
                if tokio::time::timeout(timeout, child.wait()).await.is_err() {
                    warn!(%sid, "Killing simulator process");
                    let _ = child.kill().await;
                }
            }
            if let Some(mut server) = proxy.server.take() {
                if tokio::time::timeout(timeout, &mut server).await.is_err() {
                    warn!(%sid, "In-process simulator did not exit");
                    server.abort();
                }
            }
            proxy.stop(None);
        }
        info!(sims = self.proxies.len(), "World shut down");
    }
}
