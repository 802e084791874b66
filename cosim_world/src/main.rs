//! Cosim World CLI
//!
//! Run the built-in co-simulation scenarios.

use clap::Parser;
use cosim_world::scenarios::ScenarioId;
use cosim_world::{FailurePolicy, ScenarioResult, ScenarioRunner};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Cosim World scenario CLI
#[derive(Parser, Debug)]
#[command(name = "cosim-world")]
#[command(about = "Run co-simulation scheduler scenarios", long_about = None)]
struct Args {
    /// Scenario to run (mixed_rates, time_shifted, weak_cycle, async_push, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// End of the run (exclusive); defaults per scenario
    #[arg(short, long)]
    until: Option<u64>,

    /// Keep running when a simulator fails
    #[arg(long)]
    isolate: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    if !args.json {
        info!("Cosim World v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: mixed_rates, time_shifted, weak_cycle, async_push, all");
            std::process::exit(1);
        })]
    };

    let mut runner = ScenarioRunner::new();
    if let Some(until) = args.until {
        runner = runner.with_until(until);
    }
    if args.isolate {
        runner = runner.with_failure_policy(FailurePolicy::Isolate);
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to start tokio runtime");
    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for scenario in &scenarios {
        let result = runtime.block_on(runner.run(*scenario));

        if !args.json {
            if result.passed {
                info!("✓ {} PASSED ({} steps)", scenario.name(), result.steps);
            } else {
                error!(
                    "✗ {} FAILED: {}",
                    scenario.name(),
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        all_results.push(result);
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "passed": r.passed,
                    "steps": r.steps,
                    "final_time": r.final_time,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenarios passed!", total);
        } else {
            error!("❌ {}/{} scenarios failed!", failed_count, total);
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
