//! World and simulator launch configuration.

use cosim_api::Simulator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Placeholder in cmd-mode command lines, replaced by `host:port`.
pub const ADDR_PLACEHOLDER: &str = "%(addr)s";

/// What happens to the run when a simulator fails mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run with the simulator's error
    #[default]
    Abort,

    /// Drop the simulator from the dataflow graph and keep going
    Isolate,
}

/// Who decides a simulator's next step time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTimePolicy {
    /// Earliest of the scheduler's computed time, the simulator's returned
    /// time and any registered step request
    #[default]
    Earliest,

    /// Fixed-step simulators always get `T + step_size`; variable-step
    /// simulators get what they return. Step requests are ignored.
    SchedulerOnly,
}

/// How a simulator advances through time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Fixed(u64),

    /// Next step is whatever the simulator returns
    #[default]
    Variable,
}

/// Builds a fresh in-process simulator.
pub type SimFactory = Arc<dyn Fn() -> Box<dyn Simulator> + Send + Sync>;

/// How to reach a simulator.
#[derive(Clone)]
pub enum SimulatorSpec {
    /// Spawn a process; the command line may contain [`ADDR_PLACEHOLDER`]
    Cmd {
        cmd: String,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },

    /// Dial a simulator already listening at `addr`
    Connect { addr: String },

    /// Run the simulator as a task on the world's runtime
    InProcess(SimFactory),
}

impl SimulatorSpec {
    pub fn cmd(cmd: impl Into<String>) -> Self {
        Self::Cmd {
            cmd: cmd.into(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn connect(addr: impl Into<String>) -> Self {
        Self::Connect { addr: addr.into() }
    }

    pub fn in_process<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Simulator,
    {
        Self::InProcess(Arc::new(move || Box::new(factory()) as Box<dyn Simulator>))
    }

    /// Sets the working directory of a cmd-mode simulator.
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let Self::Cmd { cwd, .. } = &mut self {
            *cwd = Some(dir.into());
        }
        self
    }

    /// Adds an environment variable for a cmd-mode simulator.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Cmd { env, .. } = &mut self {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Short mode label for logging.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Cmd { .. } => "cmd",
            Self::Connect { .. } => "connect",
            Self::InProcess(_) => "in_process",
        }
    }
}

impl std::fmt::Debug for SimulatorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cmd { cmd, cwd, env } => f
                .debug_struct("Cmd")
                .field("cmd", cmd)
                .field("cwd", cwd)
                .field("env", env)
                .finish(),
            Self::Connect { addr } => f.debug_struct("Connect").field("addr", addr).finish(),
            Self::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

/// Configuration for a world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Launch configuration per simulator name
    pub sim_config: BTreeMap<String, SimulatorSpec>,

    /// Simulation time of the first step
    pub start_time: u64,

    pub failure_policy: FailurePolicy,

    pub step_policy: StepTimePolicy,

    /// How long `stop` may take before the connection is cut
    pub stop_timeout: Duration,

    /// How long to wait for a simulator connection
    pub connect_timeout: Duration,

    /// Upper bound for a relayed remote `get_data`
    pub relay_timeout: Duration,

    /// Interface the cmd-mode listener binds to
    pub host: String,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            sim_config: BTreeMap::new(),
            start_time: 0,
            failure_policy: FailurePolicy::default(),
            step_policy: StepTimePolicy::default(),
            stop_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            host: "127.0.0.1".to_string(),
        }
    }
}

impl WorldConfig {
    pub fn with_simulator(mut self, name: impl Into<String>, spec: SimulatorSpec) -> Self {
        self.sim_config.insert(name.into(), spec);
        self
    }

    pub fn with_start_time(mut self, start: u64) -> Self {
        self.start_time = start;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_step_policy(mut self, policy: StepTimePolicy) -> Self {
        self.step_policy = policy;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }
}

/// Parameters for starting one simulator.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Forwarded to `init` as keyword arguments
    pub params: Map<String, Value>,

    pub step: StepMode,

    /// Allow reverse calls from this simulator
    pub async_requests: bool,
}

impl StartParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn fixed_step(mut self, step_size: u64) -> Self {
        self.step = StepMode::Fixed(step_size);
        self
    }

    pub fn with_async_requests(mut self) -> Self {
        self.async_requests = true;
        self
    }

    /// Keyword arguments for `init`. Fixed-step simulators also receive
    /// `step_size`.
    pub fn init_kwargs(&self) -> Map<String, Value> {
        let mut kwargs = self.params.clone();
        if let StepMode::Fixed(size) = self.step {
            kwargs.insert("step_size".to_string(), Value::from(size));
        }
        kwargs
    }
}
