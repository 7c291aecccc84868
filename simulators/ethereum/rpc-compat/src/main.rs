#![warn(clippy::unwrap_used)]
mod conversation;
mod jsonmatch;
mod suite;
mod testload;

use anyhow::Context;
use hivesim::{run_suite, Simulation, Suite};
use std::path::Path;
use suite::{client_options, rpc_compat_suite, Corpus};
use tracing::error;

/// Where the conversation files and chain data are installed.
const TESTS_DIR: &str = "tests";

fn setup() -> anyhow::Result<(Simulation, Suite)> {
    let sim = Simulation::from_env().context("can't read the simulation environment")?;
    let dir = Path::new(TESTS_DIR);
    let corpus = Corpus::load(dir).context("can't load the test corpus")?;
    let options = client_options(dir).context("can't prepare client options")?;
    Ok((sim, rpc_compat_suite(corpus, options)))
}

#[tokio::main]
async fn main() {
    hivesim::init_logging();
    let (sim, suite) = match setup() {
        Ok(setup) => setup,
        Err(err) => {
            error!("{err:#}");
            std::process::exit(2);
        }
    };
    let summary = run_suite(sim, vec![suite]).await;
    std::process::exit(summary.exit_code());
}
