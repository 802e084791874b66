//! Standalone probe simulator process.
//!
//! `cosim-probe <addr>` dials a world (cmd mode); `cosim-probe --server
//! <addr>` waits for one (connect mode).

use cosim_api::start_simulation;
use cosim_world::ProbeSim;

fn main() {
    if let Err(e) = start_simulation(Box::new(ProbeSim::new())) {
        eprintln!("cosim-probe: {}", e);
        std::process::exit(1);
    }
}
