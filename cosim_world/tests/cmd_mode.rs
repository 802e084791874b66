//! Launching a simulator as a child process.

use cosim_core::DelayKind;
use cosim_world::{
    ProbeSim, SimState, SimulatorSpec, StartParams, StepLog, World, WorldConfig, WorldError,
    ADDR_PLACEHOLDER, PROBE_MODEL,
};
use serde_json::{json, Map};

fn probe_cmd() -> String {
    format!("{} {}", env!("CARGO_BIN_EXE_cosim-probe"), ADDR_PLACEHOLDER)
}

#[tokio::test]
async fn test_process_simulator_feeds_local_one() {
    let log = StepLog::new();
    let shared = log.clone();
    let config = WorldConfig::default()
        .with_simulator("Remote", SimulatorSpec::cmd(probe_cmd()))
        .with_simulator(
            "Local",
            SimulatorSpec::in_process(move || ProbeSim::with_log(shared.clone())),
        );
    let mut world = World::new(config);

    let remote = world.start("Remote", StartParams::new().fixed_step(1)).await.unwrap();
    let local = world.start("Local", StartParams::new().fixed_step(1)).await.unwrap();
    let src = world.create(&remote, PROBE_MODEL, 1, Map::new()).await.unwrap().remove(0);
    let dst = world.create(&local, PROBE_MODEL, 1, Map::new()).await.unwrap().remove(0);
    world.connect(&src, &dst, [("out", "in")], DelayKind::Immediate).unwrap();

    let report = world.run(3).await.unwrap();
    assert_eq!(report.steps, 6);
    assert_eq!(log.times(), vec![0, 1, 2]);
    for t in 0..3 {
        assert_eq!(log.input_at(t, &dst.eid, "in", &src.to_string()), Some(json!(t)));
    }

    world.shutdown().await;
    assert_eq!(world.sim_state(&remote), Some(SimState::Stopped));
}

#[tokio::test]
async fn test_missing_program_fails_to_launch() {
    let config = WorldConfig::default().with_simulator(
        "Ghost",
        SimulatorSpec::cmd(format!("/nonexistent/cosim-ghost {}", ADDR_PLACEHOLDER)),
    );
    let mut world = World::new(config);

    let err = world.start("Ghost", StartParams::new()).await.unwrap_err();
    assert!(matches!(err, WorldError::Launch { .. }));
}
