//! Reverse requests from simulators: progress, related entities, and
//! remote data access.
//!
//! Answers are sent immediately. `get_data` has to ask other simulators,
//! so it is relayed from a spawned task and never holds up the scheduler.
//! A target that is mid-step answers once its step is done, so a relay
//! that would close a cycle of simulators waiting on each other is refused.

use crate::world::World;
use cosim_core::{FullId, OutputData, OutputRequest, RemoteDataRequest, SetData, SimId};
use cosim_env::{Call, Endpoint, IncomingRequest};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

type Relay = Vec<(SimId, Arc<Endpoint>, OutputRequest)>;

/// Relays in flight as `(caller, target)` edges: the caller is blocked
/// until the target answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct RelayWaits(Arc<Mutex<Vec<(SimId, SimId)>>>);

impl RelayWaits {
    fn edges(&self) -> MutexGuard<'_, Vec<(SimId, SimId)>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// True if `from` is blocked, directly or through others, on `to`.
    fn blocks(&self, from: &SimId, to: &SimId) -> bool {
        let edges = self.edges();
        let mut seen = BTreeSet::new();
        let mut pending = vec![from.clone()];
        while let Some(sid) = pending.pop() {
            if &sid == to {
                return true;
            }
            if seen.insert(sid.clone()) {
                pending.extend(edges.iter().filter(|(c, _)| c == &sid).map(|(_, t)| t.clone()));
            }
        }
        false
    }

    fn register(&self, caller: &SimId, targets: &[SimId]) {
        self.edges()
            .extend(targets.iter().map(|t| (caller.clone(), t.clone())));
    }

    fn release(&self, caller: &SimId, targets: &[SimId]) {
        let mut edges = self.edges();
        for target in targets {
            if let Some(pos) = edges.iter().position(|(c, t)| c == caller && t == target) {
                edges.remove(pos);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.edges().len()
    }
}

impl World {
    /// Answers one reverse request.
    pub(crate) async fn serve_request(&mut self, request: IncomingRequest) {
        let IncomingRequest { origin, id, call } = request;
        let caller = SimId::from(origin);
        let Some(proxy) = self.proxies.get(&caller) else {
            warn!(%caller, method = %call.method, "Request from unknown simulator");
            return;
        };
        let endpoint = Arc::clone(&proxy.endpoint);
        debug!(%caller, id, method = %call.method, "Serving request");

        let result = if !proxy.async_requests {
            Err(format!("{} is not permitted to make asynchronous requests", caller))
        } else {
            match call.method.as_str() {
                "get_progress" => Ok(json!(self.progress())),
                "get_related_entities" => self.related_entities(&call),
                "set_data" => self.set_data(&caller, &call),
                "get_data" => match self.plan_relay(&caller, &call) {
                    Ok(relay) => {
                        let targets: Vec<SimId> = relay.iter().map(|(sid, _, _)| sid.clone()).collect();
                        let waits = self.relay_waits.clone();
                        waits.register(&caller, &targets);
                        let timeout = self.config.relay_timeout;
                        tokio::spawn(async move {
                            let result = relay_get_data(relay, timeout).await;
                            waits.release(&caller, &targets);
                            if let Err(e) = endpoint.reply(id, result).await {
                                warn!(%caller, error = %e, "Failed to answer get_data");
                            }
                        });
                        return;
                    }
                    Err(e) => Err(e),
                },
                other => Err(format!("Unknown method: {}", other)),
            }
        };

        if let Err(e) = &result {
            warn!(%caller, method = %call.method, error = %e, "Request rejected");
        }
        if let Err(e) = endpoint.reply(id, result).await {
            warn!(%caller, error = %e, "Failed to send reply");
        }
    }

    /// No argument: the whole graph. A full id: its neighbours. A list:
    /// neighbours per id.
    fn related_entities(&self, call: &Call) -> Result<Value, String> {
        let graph = &self.graph;
        let value = match call.arg(0) {
            Value::Null => serde_json::to_value(graph.snapshot()),
            Value::String(id) => {
                let id: FullId = id.parse().map_err(|e| format!("{}", e))?;
                serde_json::to_value(graph.related_entities(&id).map_err(|e| e.to_string())?)
            }
            Value::Array(ids) => {
                let ids: Vec<FullId> = ids
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<_, _>>()
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(graph.related_entities_many(&ids).map_err(|e| e.to_string())?)
            }
            other => return Err(format!("expected a full id or a list, got {}", other)),
        };
        value.map_err(|e| e.to_string())
    }

    /// Writes values into destination input buffers. Every source must be an
    /// entity of the caller. The whole request is validated before any
    /// value is stored.
    fn set_data(&mut self, caller: &SimId, call: &Call) -> Result<Value, String> {
        let data: SetData = serde_json::from_value(call.arg(0)).map_err(|e| e.to_string())?;

        let mut writes = Vec::new();
        for (src, dsts) in data {
            let src_id: FullId = src.parse().map_err(|e| format!("{}", e))?;
            if &src_id.sid != caller {
                return Err(format!("{} cannot set data on behalf of {}", caller, src));
            }
            if self.graph.entity(&src_id).is_none() {
                return Err(format!("Unknown entity: {}", src));
            }

            for (dst, attrs) in dsts {
                let dst_id: FullId = dst.parse().map_err(|e| format!("{}", e))?;
                let entity = self
                    .graph
                    .entity(&dst_id)
                    .ok_or_else(|| format!("Unknown entity: {}", dst))?;
                let model = self
                    .graph
                    .meta(dst_id.sid.as_str())
                    .and_then(|m| m.model(&entity.model))
                    .ok_or_else(|| format!("Unknown model for {}", dst))?;
                for (attr, value) in attrs {
                    if !model.accepts_input(&attr) {
                        return Err(format!("Entity {} has no input attribute {}", dst, attr));
                    }
                    writes.push((dst_id.clone(), attr, src.clone(), value));
                }
            }
        }

        let time = self.time;
        let count = writes.len();
        for (dst, attr, src, value) in writes {
            if let Some(proxy) = self.proxies.get_mut(&dst.sid) {
                if !proxy.is_stopped() {
                    proxy.inputs.push(&dst.eid, &attr, &src, value, time, false);
                }
            }
        }
        debug!(%caller, count, "set_data stored");
        Ok(Value::Null)
    }

    /// Groups a remote `get_data` request by owning simulator.
    fn plan_relay(&self, caller: &SimId, call: &Call) -> Result<Relay, String> {
        let request: RemoteDataRequest =
            serde_json::from_value(call.arg(0)).map_err(|e| e.to_string())?;

        let mut grouped: BTreeMap<SimId, OutputRequest> = BTreeMap::new();
        for (full_id, attrs) in request {
            let id: FullId = full_id.parse().map_err(|e| format!("{}", e))?;
            if &id.sid == caller {
                return Err(format!("{} cannot read its own entity {} remotely", caller, full_id));
            }
            if self.graph.entity(&id).is_none() {
                return Err(format!("Unknown entity: {}", full_id));
            }
            grouped.entry(id.sid).or_default().insert(id.eid, attrs);
        }

        if let Some(target) = grouped.keys().find(|sid| self.relay_waits.blocks(sid, caller)) {
            return Err(format!(
                "{} is waiting on {}; reading it now would deadlock",
                target, caller
            ));
        }

        grouped
            .into_iter()
            .map(|(sid, outputs)| match self.proxies.get(&sid) {
                Some(proxy) if !proxy.is_stopped() => Ok((sid, Arc::clone(&proxy.endpoint), outputs)),
                _ => Err(format!("Simulator {} is not available", sid)),
            })
            .collect()
    }
}

/// Fetches data from each owning simulator and keys it by full id.
async fn relay_get_data(relay: Relay, timeout: Duration) -> Result<Value, String> {
    let mut merged = Map::new();
    for (sid, endpoint, outputs) in relay {
        let reply = tokio::time::timeout(timeout, endpoint.request("get_data", vec![json!(outputs)]))
            .await
            .map_err(|_| format!("get_data on {} timed out after {}ms", sid, timeout.as_millis()))?
            .map_err(|e| format!("get_data on {} failed: {}", sid, e))?;
        let data: OutputData = serde_json::from_value(reply).map_err(|e| e.to_string())?;
        for (eid, attrs) in data {
            merged.insert(FullId::new(sid.clone(), eid).to_string(), json!(attrs));
        }
    }
    Ok(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimulatorSpec, StartParams, WorldConfig};
    use crate::probe::{ProbeSim, PROBE_MODEL};
    use async_trait::async_trait;
    use cosim_api::{ApiError, Params, Simulator, WorldHandle};
    use cosim_core::{DelayKind, EntityDescriptor, Inputs, ModelMeta, SimMeta};

    const NODE_MODEL: &str = "Node";

    /// A reverse call made on every step.
    #[derive(Debug, Clone)]
    enum Query {
        Progress,
        Graph,
        RelatedOf(FullId),
        RelatedMany(Vec<FullId>),
        GetData(RemoteDataRequest),
        SetData(SetData),
        /// Stays busy inside the step
        Pause(Duration),
    }

    /// What one query returned at one step.
    #[derive(Debug, Clone)]
    struct Answer {
        time: u64,
        query: usize,
        result: Result<Value, String>,
    }

    #[derive(Debug, Clone, Default)]
    struct Journal {
        answers: Arc<Mutex<Vec<Answer>>>,
        inputs: Arc<Mutex<Vec<(u64, Inputs)>>>,
    }

    impl Journal {
        fn answer(&self, time: u64, query: usize) -> Result<Value, String> {
            self.answers
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.time == time && a.query == query)
                .map(|a| a.result.clone())
                .expect("query was not made")
        }

        fn all_answers(&self) -> Vec<Answer> {
            self.answers.lock().unwrap().clone()
        }

        fn inputs_at(&self, time: u64) -> Option<Inputs> {
            self.inputs
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _)| *t == time)
                .map(|(_, i)| i.clone())
        }
    }

    /// Steps every tick and runs its queries, recording the answers
    /// instead of failing on errors.
    struct Inspector {
        queries: Vec<Query>,
        journal: Journal,
        last: Option<u64>,
    }

    impl Inspector {
        fn spec(queries: Vec<Query>, journal: Journal) -> SimulatorSpec {
            SimulatorSpec::in_process(move || Inspector {
                queries: queries.clone(),
                journal: journal.clone(),
                last: None,
            })
        }
    }

    async fn ask(world: &WorldHandle, query: &Query) -> Result<Value, ApiError> {
        Ok(match query {
            Query::Progress => json!(world.get_progress().await?),
            Query::Graph => serde_json::to_value(world.get_related_entities().await?)?,
            Query::RelatedOf(id) => serde_json::to_value(world.get_related_entities_of(id).await?)?,
            Query::RelatedMany(ids) => {
                serde_json::to_value(world.get_related_entities_many(ids).await?)?
            }
            Query::GetData(request) => serde_json::to_value(world.get_data(request).await?)?,
            Query::SetData(data) => {
                world.set_data(data).await?;
                Value::Null
            }
            Query::Pause(duration) => {
                tokio::time::sleep(*duration).await;
                Value::Null
            }
        })
    }

    #[async_trait]
    impl Simulator for Inspector {
        async fn init(&mut self, _sid: &str, _params: Params) -> Result<SimMeta, ApiError> {
            Ok(SimMeta::builder()
                .model(NODE_MODEL, ModelMeta::public().with_attrs(["out", "in"]))
                .build())
        }

        async fn create(
            &mut self,
            num: usize,
            model: &str,
            _params: Params,
        ) -> Result<Vec<EntityDescriptor>, ApiError> {
            Ok((0..num)
                .map(|i| EntityDescriptor::new(format!("node_{}", i), model))
                .collect())
        }

        async fn step(
            &mut self,
            time: u64,
            inputs: Inputs,
            world: &WorldHandle,
        ) -> Result<Option<u64>, ApiError> {
            self.journal.inputs.lock().unwrap().push((time, inputs));
            for (idx, query) in self.queries.iter().enumerate() {
                let result = ask(world, query).await.map_err(|e| e.to_string());
                self.journal.answers.lock().unwrap().push(Answer {
                    time,
                    query: idx,
                    result,
                });
            }
            self.last = Some(time);
            Ok(Some(time + 1))
        }

        async fn get_data(&mut self, outputs: OutputRequest) -> Result<OutputData, ApiError> {
            Ok(outputs
                .into_iter()
                .map(|(eid, attrs)| {
                    let values = attrs.into_iter().map(|a| (a, json!(self.last))).collect();
                    (eid, values)
                })
                .collect())
        }
    }

    fn id(s: &str) -> FullId {
        s.parse().unwrap()
    }

    async fn node(world: &mut World, name: &str) -> FullId {
        let sid = world
            .start(name, StartParams::new().fixed_step(1).with_async_requests())
            .await
            .unwrap();
        world.create(&sid, NODE_MODEL, 1, Map::new()).await.unwrap().remove(0)
    }

    async fn source(world: &mut World) -> FullId {
        let sid = world.start("Probe", StartParams::new().fixed_step(1)).await.unwrap();
        world.create(&sid, PROBE_MODEL, 1, Map::new()).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_progress_and_related_entities() {
        let journal = Journal::default();
        let queries = vec![
            Query::Progress,
            Query::Graph,
            Query::RelatedOf(id("Inspector-0.node_0")),
            Query::RelatedMany(vec![id("Inspector-0.node_0"), id("Probe-0.probe_0")]),
            Query::RelatedOf(id("Probe-0.nope")),
        ];
        let config = WorldConfig::default()
            .with_simulator("Inspector", Inspector::spec(queries, journal.clone()))
            .with_simulator("Probe", SimulatorSpec::in_process(ProbeSim::new));
        let mut world = World::new(config);
        let inspector = node(&mut world, "Inspector").await;
        let source = source(&mut world).await;
        world.connect(&source, &inspector, [("out", "in")], DelayKind::Immediate).unwrap();

        world.run(4).await.unwrap();
        world.shutdown().await;

        assert_eq!(journal.answer(0, 0), Ok(json!(0.0)));
        assert_eq!(journal.answer(2, 0), Ok(json!(0.5)));

        let graph = journal.answer(0, 1).unwrap();
        assert!(graph["nodes"]["Inspector-0.node_0"].is_object());
        assert_eq!(graph["nodes"]["Probe-0.probe_0"]["type"], json!("Probe"));
        assert_eq!(graph["edges"], json!([["Inspector-0.node_0", "Probe-0.probe_0"]]));

        assert_eq!(
            journal.answer(0, 2),
            Ok(json!({"Probe-0.probe_0": {"type": "Probe", "sid": "Probe-0"}}))
        );

        let many = journal.answer(0, 3).unwrap();
        assert!(many["Inspector-0.node_0"]["Probe-0.probe_0"].is_object());
        assert!(many["Probe-0.probe_0"]["Inspector-0.node_0"].is_object());

        assert!(journal.answer(0, 4).is_err());
    }

    #[tokio::test]
    async fn test_remote_get_data() {
        let journal = Journal::default();
        let mut remote = RemoteDataRequest::new();
        remote.insert("Probe-0.probe_0".to_string(), vec!["out".to_string()]);
        let mut own = RemoteDataRequest::new();
        own.insert("Inspector-0.node_0".to_string(), vec!["out".to_string()]);
        let mut ghost = RemoteDataRequest::new();
        ghost.insert("Probe-0.ghost".to_string(), vec!["out".to_string()]);

        let queries = vec![Query::GetData(remote), Query::GetData(own), Query::GetData(ghost)];
        let config = WorldConfig::default()
            .with_simulator("Inspector", Inspector::spec(queries, journal.clone()))
            .with_simulator("Probe", SimulatorSpec::in_process(ProbeSim::new));
        let mut world = World::new(config);
        node(&mut world, "Inspector").await;
        source(&mut world).await;

        world.run(3).await.unwrap();
        world.shutdown().await;

        for t in 0..3 {
            let data = journal.answer(t, 0).unwrap();
            assert!(data["Probe-0.probe_0"].get("out").is_some(), "{}", data);

            let err = journal.answer(t, 1).unwrap_err();
            assert!(err.contains("its own entity"), "{}", err);

            let err = journal.answer(t, 2).unwrap_err();
            assert!(err.contains("Unknown entity"), "{}", err);
        }
        assert_eq!(world.relay_waits.len(), 0);
    }

    #[tokio::test]
    async fn test_set_data_is_validated_as_a_whole() {
        let journal = Journal::default();
        let target = Journal::default();
        let write = |dst: &str, attrs: &[(&str, i64)], src: &str| -> SetData {
            let attrs = attrs.iter().map(|(a, v)| (a.to_string(), json!(v))).collect();
            BTreeMap::from([(src.to_string(), BTreeMap::from([(dst.to_string(), attrs)]))])
        };
        let queries = vec![
            // One unknown attribute spoils the whole request
            Query::SetData(write("Target-0.node_0", &[("in", 7), ("bogus", 1)], "Inspector-0.node_0")),
            Query::SetData(write("Target-0.node_0", &[("in", 8)], "Target-0.node_0")),
            Query::SetData(write("Target-0.ghost", &[("in", 9)], "Inspector-0.node_0")),
            Query::SetData(write("Target-0.node_0", &[("in", 42)], "Inspector-0.node_0")),
        ];
        let config = WorldConfig::default()
            .with_simulator("Inspector", Inspector::spec(queries, journal.clone()))
            .with_simulator("Target", Inspector::spec(Vec::new(), target.clone()));
        let mut world = World::new(config);
        node(&mut world, "Inspector").await;
        node(&mut world, "Target").await;

        world.run(2).await.unwrap();
        world.shutdown().await;

        let err = journal.answer(0, 0).unwrap_err();
        assert!(err.contains("no input attribute bogus"), "{}", err);
        let err = journal.answer(0, 1).unwrap_err();
        assert!(err.contains("on behalf of"), "{}", err);
        let err = journal.answer(0, 2).unwrap_err();
        assert!(err.contains("Unknown entity"), "{}", err);
        assert_eq!(journal.answer(0, 3), Ok(Value::Null));

        // Target was already stepping at 0; the accepted write lands at 1
        assert!(target.inputs_at(0).unwrap().values().all(|attrs| attrs.is_empty()));
        let inputs = target.inputs_at(1).unwrap();
        let sources = &inputs["node_0"]["in"];
        assert_eq!(sources.len(), 1);
        assert_eq!(sources["Inspector-0.node_0"], json!(42));
        assert!(!inputs["node_0"].contains_key("bogus"));
    }

    #[tokio::test]
    async fn test_mutual_remote_reads_complete() {
        let (journal_a, journal_b) = (Journal::default(), Journal::default());
        let read = |full_id: &str| {
            let mut request = RemoteDataRequest::new();
            request.insert(full_id.to_string(), vec!["out".to_string()]);
            vec![Query::GetData(request)]
        };
        let config = WorldConfig::default()
            .with_simulator("A", Inspector::spec(read("B-0.node_0"), journal_a.clone()))
            .with_simulator("B", Inspector::spec(read("A-0.node_0"), journal_b.clone()));
        let mut world = World::new(config);
        node(&mut world, "A").await;
        node(&mut world, "B").await;

        let run = tokio::time::timeout(Duration::from_secs(10), world.run(3)).await;
        let report = run.expect("mutual reads must not hang").unwrap();
        assert_eq!(report.steps, 6);
        world.shutdown().await;

        let answers: Vec<Answer> = journal_a
            .all_answers()
            .into_iter()
            .chain(journal_b.all_answers())
            .collect();
        assert_eq!(answers.len(), 6);
        for t in 0..3 {
            let at_t: Vec<&Answer> = answers.iter().filter(|a| a.time == t).collect();
            // At most one side is refused per instant
            assert!(at_t.iter().any(|a| a.result.is_ok()));
            for refused in at_t.iter().filter_map(|a| a.result.as_ref().err()) {
                assert!(refused.contains("deadlock"), "{}", refused);
            }
        }
        assert_eq!(world.relay_waits.len(), 0);
    }

    #[tokio::test]
    async fn test_relay_to_busy_simulator_times_out() {
        let journal = Journal::default();
        let mut request = RemoteDataRequest::new();
        request.insert("Busy-0.node_0".to_string(), vec!["out".to_string()]);
        let queries = vec![Query::Pause(Duration::from_millis(50)), Query::GetData(request)];
        let busy = vec![Query::Pause(Duration::from_millis(600))];
        let config = WorldConfig::default()
            .with_relay_timeout(Duration::from_millis(100))
            .with_simulator("Reader", Inspector::spec(queries, journal.clone()))
            .with_simulator("Busy", Inspector::spec(busy, Journal::default()));
        let mut world = World::new(config);
        node(&mut world, "Reader").await;
        node(&mut world, "Busy").await;

        world.run(1).await.unwrap();
        world.shutdown().await;

        let err = journal.answer(0, 1).unwrap_err();
        assert!(err.contains("timed out after 100ms"), "{}", err);
        assert_eq!(world.relay_waits.len(), 0);
    }

    #[test]
    fn test_relay_waits_detect_cycles() {
        let waits = RelayWaits::default();
        let (a, b, c) = (SimId::from("A-0"), SimId::from("B-0"), SimId::from("C-0"));

        waits.register(&a, &[b.clone()]);
        waits.register(&b, &[c.clone()]);
        assert!(waits.blocks(&a, &c));
        assert!(!waits.blocks(&c, &a));

        waits.release(&b, &[c.clone()]);
        assert!(!waits.blocks(&a, &c));
        assert_eq!(waits.len(), 1);
    }
}
