//! The stepping loop.
//!
//! Each iteration picks the earliest pending step time `T` and works through
//! every simulator due at `T`:
//!
//! ```text
//! due ──ready?──► step(T, inputs) ──► get_data ──► route to buffers ──► next_step
//!   ▲                                                                   │
//!   └────────── successors waiting on an immediate edge ◄───────────────┘
//! ```
//!
//! A simulator is ready once none of its immediate predecessors can still
//! produce output at or before `T`. Steps run as tasks so reverse requests
//! from any simulator are served while they are in flight.

use crate::config::FailurePolicy;
use crate::error::{SimulationError, WorldError};
use crate::proxy::{resolve_next_step, SimState};
use crate::world::{Route, RunReport, StepRecord, World};
use cosim_core::{ConfigurationError, DataflowGraph, DelayKind, OutputData, SimId};
use cosim_env::{Call, CallError};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

type StepOutcome = (SimId, Result<Value, CallError>);

impl World {
    /// Steps all simulators until `until` (exclusive).
    ///
    /// The first call freezes the scenario. Later calls continue from where
    /// the previous one stopped.
    pub async fn run(&mut self, until: u64) -> Result<RunReport, WorldError> {
        let start = self.config.start_time;
        if until <= start || until < self.until {
            return Err(ConfigurationError::InvalidRunWindow { start, until }.into());
        }
        if self.dataflow.is_none() {
            self.prepare().await?;
        }
        self.until = until;
        info!(start, until, sims = self.proxies.len(), "Run started");

        while let Some(time) = self.next_time() {
            self.time = time;
            self.step_slot(time).await?;
        }

        let report = self.report();
        info!(steps = report.steps, final_time = ?report.final_time, failures = report.failures.len(), "Run finished");
        Ok(report)
    }

    /// Freezes connections, builds the dataflow graph and routing tables
    /// and sends `setup_done`.
    async fn prepare(&mut self) -> Result<(), WorldError> {
        self.graph.freeze();
        let sids: Vec<SimId> = self.proxies.keys().cloned().collect();
        let dataflow = DataflowGraph::from_entity_graph(&sids, &self.graph)?;

        for conn in self.graph.connections() {
            for (src_attr, dst_attr) in &conn.attrs {
                if let Some(proxy) = self.proxies.get_mut(&conn.src.sid) {
                    let attrs = proxy.outputs.entry(conn.src.eid.clone()).or_default();
                    if !attrs.contains(src_attr) {
                        attrs.push(src_attr.clone());
                    }
                }
                self.routes.entry(conn.src.sid.clone()).or_default().push(Route {
                    src_eid: conn.src.eid.clone(),
                    src_attr: src_attr.clone(),
                    src: conn.src.to_string(),
                    dst: conn.dst.clone(),
                    dst_attr: dst_attr.clone(),
                    delay: conn.delay,
                });
            }
        }
        self.dataflow = Some(dataflow);

        for sid in sids {
            let endpoint = match self.proxies.get(&sid) {
                Some(proxy) => Arc::clone(&proxy.endpoint),
                None => continue,
            };
            self.call_serving(&endpoint, Call::new("setup_done", Vec::new()))
                .await
                .map_err(|e| WorldError::call(&sid, e))?;
        }
        debug!("Setup done");
        Ok(())
    }

    /// Earliest scheduled step before the end of the run.
    fn next_time(&self) -> Option<u64> {
        self.proxies
            .values()
            .filter(|p| !p.is_stopped())
            .filter_map(|p| p.next_step)
            .filter(|t| *t < self.until)
            .min()
    }

    fn is_ready(&self, sid: &SimId, time: u64) -> bool {
        let Some(dataflow) = &self.dataflow else {
            return true;
        };
        dataflow
            .immediate_predecessors(sid)
            .all(|pred| self.proxies.get(pred).map_or(true, |p| p.is_done_through(time)))
    }

    /// Due simulators that can be dispatched now, in dataflow order.
    fn ready_set(&self, waiting: &BTreeSet<SimId>, time: u64) -> Vec<SimId> {
        let order = self.dataflow.as_ref().map(|d| d.order().to_vec()).unwrap_or_default();
        order
            .into_iter()
            .filter(|sid| waiting.contains(sid))
            .filter(|sid| self.is_ready(sid, time))
            .collect()
    }

    #[instrument(skip(self))]
    async fn step_slot(&mut self, time: u64) -> Result<(), WorldError> {
        let mut waiting: BTreeSet<SimId> = self
            .proxies
            .values_mut()
            .filter(|p| p.is_due(time))
            .map(|p| {
                p.state = SimState::WaitingInput;
                p.sid.clone()
            })
            .collect();
        let mut running: JoinSet<StepOutcome> = JoinSet::new();

        // First abort error. Steps already sent still run to completion so
        // none of them is lost or sent twice.
        let mut aborted: Option<WorldError> = None;

        loop {
            if aborted.is_none() {
                for sid in self.ready_set(&waiting, time) {
                    waiting.remove(&sid);
                    self.dispatch(&mut running, sid, time);
                }
            }

            if running.is_empty() {
                if let Some(e) = aborted {
                    return Err(e);
                }
                if waiting.is_empty() {
                    return Ok(());
                }
                // Stopped simulators are dropped from the wait set on failure,
                // so only a broken ordering can leave due simulators behind
                error!(time, waiting = ?waiting, "No simulator can be dispatched");
                return Err(WorldError::Stalled(time));
            }

            tokio::select! {
                Some(joined) = running.join_next() => {
                    let outcome = match joined {
                        Ok((sid, result)) => self.complete_step(sid, time, result).await,
                        Err(e) => Err(WorldError::InvalidState(format!("step task failed: {}", e))),
                    };
                    if let Err(e) = outcome {
                        if aborted.is_none() {
                            warn!(time, in_flight = running.len(), "Run aborting, draining steps in flight");
                            aborted = Some(e);
                        }
                    }
                    waiting.retain(|sid| self.proxies.get(sid).map_or(false, |p| p.is_due(time)));
                }
                Some(request) = self.requests_rx.recv() => self.serve_request(request).await,
            }
        }
    }

    fn dispatch(&mut self, running: &mut JoinSet<StepOutcome>, sid: SimId, time: u64) {
        let Some(proxy) = self.proxies.get_mut(&sid) else {
            return;
        };
        let inputs = proxy.begin_step(time);
        let endpoint = Arc::clone(&proxy.endpoint);
        debug!(%sid, time, n_inputs = inputs.len(), "Dispatching step");

        running.spawn(async move {
            let result = endpoint.request("step", vec![json!(time), json!(inputs)]).await;
            (sid, result)
        });
    }

    async fn complete_step(
        &mut self,
        sid: SimId,
        time: u64,
        result: Result<Value, CallError>,
    ) -> Result<(), WorldError> {
        let outcome = match result {
            Ok(value) => self.after_step(&sid, time, value).await,
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(reason) => self.fail(sid, time, reason).await,
        }
    }

    /// Fetches outputs, routes them and schedules the next step.
    async fn after_step(&mut self, sid: &SimId, time: u64, value: Value) -> Result<(), String> {
        let returned: Option<u64> = serde_json::from_value(value)
            .map_err(|e| format!("invalid step reply: {}", e))?;

        let (endpoint, outputs, mode) = match self.proxies.get(sid) {
            Some(proxy) => (Arc::clone(&proxy.endpoint), proxy.outputs.clone(), proxy.step_mode),
            None => return Ok(()),
        };
        let next_step = resolve_next_step(self.config.step_policy, mode, time, returned)?;

        if !outputs.is_empty() {
            let data = self
                .call_serving(&endpoint, Call::new("get_data", vec![json!(outputs)]))
                .await
                .map_err(|e| format!("get_data failed: {}", e))?;
            let data: OutputData =
                serde_json::from_value(data).map_err(|e| format!("invalid get_data reply: {}", e))?;
            self.route(sid, time, &data);
        }

        let Some(proxy) = self.proxies.get_mut(sid) else {
            return Ok(());
        };
        let inputs = proxy.finish_step(time, next_step);
        debug!(%sid, time, ?next_step, "Step complete");

        self.last_time = Some(self.last_time.map_or(time, |t| t.max(time)));
        self.history.push(StepRecord {
            sid: sid.clone(),
            time,
            next_step,
            inputs,
        });
        Ok(())
    }

    /// Pushes a simulator's outputs into its successors' input buffers.
    fn route(&mut self, sid: &SimId, time: u64, data: &OutputData) {
        let Some(routes) = self.routes.get(sid) else {
            return;
        };
        for route in routes {
            let Some(value) = data.get(&route.src_eid).and_then(|attrs| attrs.get(&route.src_attr)) else {
                warn!(src = %route.src, attr = %route.src_attr, "Output missing from get_data reply");
                continue;
            };
            let Some(dst) = self.proxies.get_mut(&route.dst.sid) else {
                continue;
            };
            if dst.is_stopped() {
                continue;
            }
            dst.inputs.push(
                &route.dst.eid,
                &route.dst_attr,
                &route.src,
                value.clone(),
                time,
                route.delay == DelayKind::TimeShifted,
            );
        }
    }

    /// Stops a failed simulator and applies the failure policy.
    async fn fail(&mut self, sid: SimId, time: u64, reason: String) -> Result<(), WorldError> {
        let failure = SimulationError {
            sid: sid.clone(),
            time,
            reason,
        };
        error!(%sid, time, reason = %failure.reason, "Simulator failed");

        if let Some(proxy) = self.proxies.get_mut(&sid) {
            proxy.stop(Some(failure.clone()));
            proxy.endpoint.close().await;
            if let Some(child) = proxy.child.as_mut() {
                let _ = child.start_kill();
            }
        }
        self.failures.push(failure.clone());

        match self.config.failure_policy {
            FailurePolicy::Abort => Err(failure.into()),
            FailurePolicy::Isolate => {
                if let Some(dataflow) = self.dataflow.as_mut() {
                    dataflow.remove_simulator(&sid);
                }
                self.routes.remove(&sid);
                for routes in self.routes.values_mut() {
                    routes.retain(|r| r.dst.sid != sid);
                }
                warn!(%sid, "Simulator isolated, run continues");
                Ok(())
            }
        }
    }
}
