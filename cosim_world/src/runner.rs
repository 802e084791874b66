//! Scenario runner - executes the built-in scenarios against probe
//! simulators and checks what each probe observed.

use crate::config::{FailurePolicy, SimulatorSpec, StartParams, WorldConfig};
use crate::error::WorldError;
use crate::probe::{ProbeSim, StepLog, PROBE_MODEL};
use crate::scenarios::ScenarioId;
use crate::world::{RunReport, World};
use cosim_core::{DelayKind, FullId, SimId};
use serde_json::{json, Map};
use tracing::{debug, info};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Whether every probe saw what it should have
    pub passed: bool,

    /// Steps executed across all simulators
    pub steps: usize,

    /// Last simulation time at which anything stepped
    pub final_time: Option<u64>,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Two probes `A` and `B` with their step logs.
struct ProbePair {
    world: World,
    a: FullId,
    b: FullId,
    log_a: StepLog,
    log_b: StepLog,
}

impl ProbePair {
    async fn start(
        a_params: StartParams,
        b_params: impl FnOnce(&FullId) -> StartParams,
        failure_policy: FailurePolicy,
    ) -> Result<Self, WorldError> {
        let (log_a, log_b) = (StepLog::new(), StepLog::new());
        let (la, lb) = (log_a.clone(), log_b.clone());
        let config = WorldConfig::default()
            .with_failure_policy(failure_policy)
            .with_simulator("A", SimulatorSpec::in_process(move || ProbeSim::with_log(la.clone())))
            .with_simulator("B", SimulatorSpec::in_process(move || ProbeSim::with_log(lb.clone())));
        let mut world = World::new(config);

        let sa = world.start("A", a_params).await?;
        let a = create_probe(&mut world, &sa).await?;
        let sb = world.start("B", b_params(&a)).await?;
        let b = create_probe(&mut world, &sb).await?;

        Ok(Self {
            world,
            a,
            b,
            log_a,
            log_b,
        })
    }
}

async fn create_probe(world: &mut World, sid: &SimId) -> Result<FullId, WorldError> {
    world
        .create(sid, PROBE_MODEL, 1, Map::new())
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| WorldError::InvalidState(format!("{} created no entity", sid)))
}

/// Runs the built-in scenarios.
pub struct ScenarioRunner {
    /// End of the run; each scenario has its own default
    until: Option<u64>,

    failure_policy: FailurePolicy,
}

impl Default for ScenarioRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioRunner {
    pub fn new() -> Self {
        Self {
            until: None,
            failure_policy: FailurePolicy::Abort,
        }
    }

    /// Sets the end of the run (exclusive).
    pub fn with_until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    fn until_for(&self, scenario: ScenarioId) -> u64 {
        self.until.unwrap_or(match scenario {
            ScenarioId::WeakCycle => 5,
            _ => 10,
        })
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let until = self.until_for(scenario);
        info!("Starting scenario: {} (until={})", scenario.name(), until);
        debug!("{}", scenario.description());

        match self.execute(scenario, until).await {
            Ok(report) => ScenarioResult {
                scenario,
                passed: true,
                steps: report.steps,
                final_time: report.final_time,
                failure_reason: None,
            },
            Err(reason) => ScenarioResult {
                scenario,
                passed: false,
                steps: 0,
                final_time: None,
                failure_reason: Some(reason),
            },
        }
    }

    async fn execute(&self, scenario: ScenarioId, until: u64) -> Result<RunReport, String> {
        let a_params = StartParams::new().fixed_step(1);
        let pair = match scenario {
            ScenarioId::MixedRates | ScenarioId::TimeShifted | ScenarioId::WeakCycle => {
                let b_step = if scenario == ScenarioId::WeakCycle { 1 } else { 3 };
                ProbePair::start(a_params, |_| StartParams::new().fixed_step(b_step), self.failure_policy).await
            }
            ScenarioId::AsyncPush => {
                ProbePair::start(
                    a_params,
                    |a| {
                        StartParams::new()
                            .fixed_step(2)
                            .with_async_requests()
                            .with_param("set_data_target", a.to_string())
                    },
                    self.failure_policy,
                )
                .await
            }
        };
        let mut pair = pair.map_err(|e| e.to_string())?;

        let wiring = match scenario {
            ScenarioId::MixedRates => {
                pair.world.connect(&pair.a, &pair.b, [("out", "in")], DelayKind::Immediate)
            }
            ScenarioId::TimeShifted => {
                pair.world.connect(&pair.a, &pair.b, [("out", "in")], DelayKind::TimeShifted)
            }
            ScenarioId::WeakCycle => pair
                .world
                .connect(&pair.a, &pair.b, [("out", "in")], DelayKind::Immediate)
                .and_then(|_| pair.world.connect(&pair.b, &pair.a, [("out", "in")], DelayKind::Weak)),
            ScenarioId::AsyncPush => Ok(()),
        };

        let run = match wiring {
            Ok(()) => pair.world.run(until).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        pair.world.shutdown().await;
        let report = run?;

        match scenario {
            ScenarioId::MixedRates => check_mixed_rates(&pair, until, false)?,
            ScenarioId::TimeShifted => check_mixed_rates(&pair, until, true)?,
            ScenarioId::WeakCycle => check_weak_cycle(&pair, until)?,
            ScenarioId::AsyncPush => check_async_push(&pair)?,
        }
        Ok(report)
    }
}

fn expect_times(log: &StepLog, name: &str, expected: Vec<u64>) -> Result<(), String> {
    let times = log.times();
    if times == expected {
        Ok(())
    } else {
        Err(format!("{} stepped at {:?}, expected {:?}", name, times, expected))
    }
}

fn expect_input(
    log: &StepLog,
    at: u64,
    dst: &FullId,
    attr: &str,
    src: &FullId,
    expected: Option<u64>,
) -> Result<(), String> {
    let seen = log.input_at(at, &dst.eid, attr, &src.to_string());
    if seen == expected.map(|v| json!(v)) {
        Ok(())
    } else {
        Err(format!(
            "{} at t={} saw {}={:?} from {}, expected {:?}",
            dst, at, attr, seen, src, expected
        ))
    }
}

/// B (step 3) sees A's output from the same instant, or with a time-shifted
/// edge the latest output from before its own step.
fn check_mixed_rates(pair: &ProbePair, until: u64, shifted: bool) -> Result<(), String> {
    expect_times(&pair.log_a, "A", (0..until).collect())?;
    let b_times: Vec<u64> = (0..until).step_by(3).collect();
    expect_times(&pair.log_b, "B", b_times.clone())?;

    for t in b_times {
        let expected = match (shifted, t) {
            (false, t) => Some(t),
            (true, 0) => None,
            (true, t) => Some(t - 1),
        };
        expect_input(&pair.log_b, t, &pair.b, "in", &pair.a, expected)?;
    }
    Ok(())
}

/// B sees A's current output, A sees B's previous output.
fn check_weak_cycle(pair: &ProbePair, until: u64) -> Result<(), String> {
    let all: Vec<u64> = (0..until).collect();
    expect_times(&pair.log_a, "A", all.clone())?;
    expect_times(&pair.log_b, "B", all.clone())?;

    for t in all {
        expect_input(&pair.log_b, t, &pair.b, "in", &pair.a, Some(t))?;
        expect_input(&pair.log_a, t, &pair.a, "in", &pair.b, t.checked_sub(1))?;
    }
    Ok(())
}

/// B (step 2) pushes `ctrl = T` into A while stepping at T. A stepping at
/// the same instant was already dispatched, so the value shows up one
/// step later.
fn check_async_push(pair: &ProbePair) -> Result<(), String> {
    for t in pair.log_a.times() {
        let expected = if t % 2 == 1 { Some(t - 1) } else { None };
        expect_input(&pair.log_a, t, &pair.a, "ctrl", &pair.b, expected)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_scenarios_pass() {
        let runner = ScenarioRunner::new();
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario).await;
            assert!(
                result.passed,
                "{} failed: {:?}",
                scenario,
                result.failure_reason
            );
            assert!(result.steps > 0);
        }
    }

    #[tokio::test]
    async fn test_custom_horizon() {
        let result = ScenarioRunner::new()
            .with_until(4)
            .run(ScenarioId::TimeShifted)
            .await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_time, Some(3));
        // A steps 0..=3, B at 0 and 3
        assert_eq!(result.steps, 6);
    }
}
