//! Probe simulator used by the built-in scenarios and the `cosim-probe`
//! binary.
//!
//! Model `Probe` has attributes `out` (the time of the entity's last step)
//! plus `in` and `ctrl` as inputs, and accepts arbitrary other inputs.
//! Every step is recorded together with the inputs it received.
//!
//! `init` parameters:
//! - `step_size`: steps at `T + step_size` (injected by the world for fixed-step starts)
//! - `set_data_target`: full id that receives `ctrl = T` via `set_data` on every step
//! - `fail_at`: fail the step at this time
//! - `api_version`: advertise a different protocol version

use async_trait::async_trait;
use cosim_api::{ApiError, Params, Simulator, WorldHandle};
use cosim_core::{EntityDescriptor, Inputs, ModelMeta, OutputData, OutputRequest, SetData, SimMeta};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const PROBE_MODEL: &str = "Probe";

/// One observed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedStep {
    pub time: u64,
    pub inputs: Inputs,
}

/// Steps recorded by a probe, shared with whoever inspects them.
#[derive(Debug, Clone, Default)]
pub struct StepLog(Arc<Mutex<Vec<ObservedStep>>>);

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, step: ObservedStep) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(step);
    }

    pub fn steps(&self) -> Vec<ObservedStep> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn times(&self) -> Vec<u64> {
        self.steps().iter().map(|s| s.time).collect()
    }

    /// Value delivered at `time` to `eid.attr` from `src`, if any.
    pub fn input_at(&self, time: u64, eid: &str, attr: &str, src: &str) -> Option<Value> {
        self.steps()
            .into_iter()
            .find(|s| s.time == time)
            .and_then(|s| s.inputs.get(eid)?.get(attr)?.get(src).cloned())
    }
}

#[derive(Debug, Default)]
pub struct ProbeSim {
    sid: String,
    step_size: Option<u64>,
    set_data_target: Option<String>,
    fail_at: Option<u64>,
    api_version: Option<String>,
    entities: Vec<String>,
    values: BTreeMap<String, BTreeMap<String, Value>>,
    log: StepLog,
}

impl ProbeSim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: StepLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Simulator for ProbeSim {
    async fn init(&mut self, sid: &str, params: Params) -> Result<SimMeta, ApiError> {
        self.sid = sid.to_string();
        self.step_size = params.get("step_size").and_then(Value::as_u64);
        self.set_data_target = params
            .get("set_data_target")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.fail_at = params.get("fail_at").and_then(Value::as_u64);
        self.api_version = params
            .get("api_version")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut meta = SimMeta::builder().model(
            PROBE_MODEL,
            ModelMeta::public()
                .with_params(["init"])
                .with_attrs(["out", "in", "ctrl"])
                .accepting_any_inputs(),
        );
        if let Some(version) = &self.api_version {
            meta = meta.api_version(version.clone());
        }
        Ok(meta.build())
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        params: Params,
    ) -> Result<Vec<EntityDescriptor>, ApiError> {
        if model != PROBE_MODEL {
            return Err(ApiError::failed(format!("unknown model {}", model)));
        }
        let init = params.get("init").cloned().unwrap_or(Value::Null);

        let start = self.entities.len();
        let created: Vec<EntityDescriptor> = (start..start + num)
            .map(|i| EntityDescriptor::new(format!("probe_{}", i), PROBE_MODEL))
            .collect();
        for desc in &created {
            self.entities.push(desc.eid.clone());
            self.values
                .entry(desc.eid.clone())
                .or_default()
                .insert("out".to_string(), init.clone());
        }
        Ok(created)
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: Inputs,
        world: &WorldHandle,
    ) -> Result<Option<u64>, ApiError> {
        if self.fail_at == Some(time) {
            return Err(ApiError::failed(format!("{} failing at t={} as configured", self.sid, time)));
        }
        debug!(sid = %self.sid, time, n_inputs = inputs.len(), "Probe step");

        for (eid, attrs) in &inputs {
            let values = self.values.entry(eid.clone()).or_default();
            for (attr, sources) in attrs {
                // Multiple sources: keep the one with the greatest key
                if let Some(value) = sources.values().last() {
                    values.insert(attr.clone(), value.clone());
                }
            }
        }
        for eid in &self.entities {
            self.values
                .entry(eid.clone())
                .or_default()
                .insert("out".to_string(), json!(time));
        }
        self.log.record(ObservedStep { time, inputs });

        if let (Some(target), Some(eid)) = (&self.set_data_target, self.entities.first()) {
            let data: SetData = BTreeMap::from([(
                format!("{}.{}", self.sid, eid),
                BTreeMap::from([(target.clone(), BTreeMap::from([("ctrl".to_string(), json!(time))]))]),
            )]);
            world.set_data(&data).await?;
        }

        Ok(self.step_size.map(|size| time + size))
    }

    async fn get_data(&mut self, outputs: OutputRequest) -> Result<OutputData, ApiError> {
        let mut data = OutputData::new();
        for (eid, attrs) in outputs {
            let values = self
                .values
                .get(&eid)
                .ok_or_else(|| ApiError::failed(format!("unknown entity {}", eid)))?;
            let entry = data.entry(eid.clone()).or_default();
            for attr in attrs {
                entry.insert(attr.clone(), values.get(&attr).cloned().unwrap_or(Value::Null));
            }
        }
        Ok(data)
    }
}
