#![warn(clippy::unwrap_used)]
mod blocktest;
mod suite;

use anyhow::Context;
use hivesim::{run_suite, HiveEnv, Simulation, Suite};
use tracing::{error, info, warn};

/// Reads HIVE_SIMLIMIT. Negative values mean no limit.
fn test_limit(raw: Option<String>) -> Option<usize> {
    let raw = raw?;
    match raw.trim().parse::<i64>() {
        Ok(limit) => usize::try_from(limit).ok(),
        Err(err) => {
            warn!(value = %raw, %err, "Simulator test limit could not be converted to int");
            None
        }
    }
}

fn setup() -> anyhow::Result<(Simulation, Suite)> {
    let env = HiveEnv::from_env().context("can't read the simulation environment")?;
    let test_path = env
        .test_path
        .clone()
        .context("Test path not set ($TESTPATH)")?;
    let limit = test_limit(std::env::var("HIVE_SIMLIMIT").ok());

    let root = test_path.join("BlockchainTests");
    let tests = blocktest::load_corpus(&root, limit)
        .with_context(|| format!("can't load tests from {}", root.display()))?;
    info!(tests = tests.len(), ?limit, "loaded blockchain tests");

    Ok((Simulation::from_settings(&env), suite::consensus_suite(tests)))
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

#[cfg(test)]
mod tests {
    use super::test_limit;

    #[test]
    fn simulation_limit() {
        assert_eq!(test_limit(None), None);
        assert_eq!(test_limit(Some("12".into())), Some(12));
        assert_eq!(test_limit(Some("-1".into())), None);
        assert_eq!(test_limit(Some("lots".into())), None);
    }
}
