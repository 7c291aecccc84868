#![warn(clippy::unwrap_used)]
mod suite;

use hivesim::{run_suite, Simulation};
use suite::{network_suite, Probe};
use tracing::error;

#[tokio::main]
async fn main() {
    hivesim::init_logging();
    let sim = match Simulation::from_env() {
        Ok(sim) => sim,
        Err(err) => {
            error!("can't read the simulation environment: {err}");
            std::process::exit(2);
        }
    };
    let summary = run_suite(sim, vec![network_suite(Probe::default())]).await;
    std::process::exit(summary.exit_code());
}
