//! Coordinator-side handle of one simulator.

use crate::config::{StepMode, StepTimePolicy};
use crate::error::SimulationError;
use cosim_api::ApiError;
use cosim_core::{InputBuffer, Inputs, OutputRequest, SimId, SimMeta};
use cosim_env::Endpoint;
use serde::Serialize;
use std::sync::Arc;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Step lifecycle of a simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimState {
    /// Initialized, never stepped
    Created,

    /// Between steps, or due but held back by a predecessor
    WaitingInput,

    /// A `step` call is in flight
    Stepping,

    /// Terminal
    Stopped,
}

/// Everything the world tracks about one simulator.
pub struct SimProxy {
    pub sid: SimId,

    pub meta: SimMeta,

    pub endpoint: Arc<Endpoint>,

    pub step_mode: StepMode,

    pub async_requests: bool,

    pub state: SimState,

    pub last_step: Option<u64>,

    /// `None` once the simulator has no further step scheduled
    pub next_step: Option<u64>,

    /// Values waiting for the next step
    pub inputs: InputBuffer,

    /// Attributes fetched after every step (feeding outgoing connections)
    pub outputs: OutputRequest,

    /// Inputs of the step currently in flight
    pub(crate) delivered: Inputs,

    pub failure: Option<SimulationError>,

    /// Spawned simulator process (cmd mode)
    pub(crate) child: Option<Child>,

    /// Simulator server task (in-process mode)
    pub(crate) server: Option<JoinHandle<Result<(), ApiError>>>,
}

impl SimProxy {
    pub(crate) fn new(
        sid: SimId,
        meta: SimMeta,
        endpoint: Arc<Endpoint>,
        step_mode: StepMode,
        async_requests: bool,
        start_time: u64,
    ) -> Self {
        Self {
            sid,
            meta,
            endpoint,
            step_mode,
            async_requests,
            state: SimState::Created,
            last_step: None,
            next_step: Some(start_time),
            inputs: InputBuffer::new(),
            outputs: OutputRequest::new(),
            delivered: Inputs::new(),
            failure: None,
            child: None,
            server: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == SimState::Stopped
    }

    /// True if the simulator has a step scheduled at `time`.
    pub fn is_due(&self, time: u64) -> bool {
        !self.is_stopped() && self.next_step == Some(time)
    }

    /// True if the simulator cannot produce output at or before `time`
    /// anymore. Stopped simulators never block anyone.
    pub fn is_done_through(&self, time: u64) -> bool {
        self.is_stopped() || self.next_step.map_or(true, |next| next > time)
    }

    /// Marks the step at `time` as in flight and drains its inputs.
    pub(crate) fn begin_step(&mut self, time: u64) -> Inputs {
        self.state = SimState::Stepping;
        self.delivered = self.inputs.take(time);
        self.delivered.clone()
    }

    /// Records a completed step.
    pub(crate) fn finish_step(&mut self, time: u64, next_step: Option<u64>) -> Inputs {
        self.last_step = Some(time);
        self.next_step = next_step;
        self.state = SimState::WaitingInput;
        std::mem::take(&mut self.delivered)
    }

    /// Registers an externally requested step. Returns false if the
    /// request was ignored.
    pub(crate) fn request_step(&mut self, time: u64, policy: StepTimePolicy) -> bool {
        if self.is_stopped() {
            return false;
        }
        if policy == StepTimePolicy::SchedulerOnly && matches!(self.step_mode, StepMode::Fixed(_)) {
            return false;
        }
        self.next_step = Some(self.next_step.map_or(time, |next| next.min(time)));
        true
    }

    pub(crate) fn stop(&mut self, failure: Option<SimulationError>) {
        self.state = SimState::Stopped;
        self.next_step = None;
        if failure.is_some() {
            self.failure = failure;
        }
    }
}

/// Decides the next step after a step at `time` returned `returned`.
///
/// A returned time not after `time` is an error: simulators can move their
/// schedule forward in time only.
pub fn resolve_next_step(
    policy: StepTimePolicy,
    mode: StepMode,
    time: u64,
    returned: Option<u64>,
) -> Result<Option<u64>, String> {
    if let Some(next) = returned {
        if next <= time {
            return Err(format!(
                "returned next step {} is not after the current time {}",
                next, time
            ));
        }
    }

    let computed = match mode {
        StepMode::Fixed(size) => Some(time.saturating_add(size)),
        StepMode::Variable => None,
    };

    Ok(match (policy, mode) {
        (StepTimePolicy::Earliest, _) => [computed, returned].into_iter().flatten().min(),
        (StepTimePolicy::SchedulerOnly, StepMode::Fixed(_)) => computed,
        (StepTimePolicy::SchedulerOnly, StepMode::Variable) => returned,
    })
}
