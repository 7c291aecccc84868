use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_PARALLELISM: usize = 16;
pub const DEFAULT_LOGLEVEL: u8 = 3;

/// Settings a simulator receives from the hive host through its environment.
#[derive(Clone, Debug)]
pub struct HiveEnv {
    pub simulator_url: String,
    pub test_pattern: Option<String>,
    pub parallelism: usize,
    pub log_level: u8,
    pub test_path: Option<PathBuf>,
}

impl HiveEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let simulator_url = lookup("HIVE_SIMULATOR")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Config("HIVE_SIMULATOR environment variable not set".into()))?;

        let test_pattern = lookup("HIVE_TEST_PATTERN").filter(|p| !p.is_empty());

        let parallelism = match lookup("HIVE_PARALLELISM") {
            None => DEFAULT_PARALLELISM,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(value = %raw, "invalid HIVE_PARALLELISM, using {DEFAULT_PARALLELISM}");
                    DEFAULT_PARALLELISM
                }
            },
        };

        let log_level = match lookup("HIVE_LOGLEVEL") {
            None => DEFAULT_LOGLEVEL,
            Some(raw) => match raw.trim().parse::<u8>() {
                Ok(n) if n <= 5 => n,
                _ => {
                    warn!(value = %raw, "invalid HIVE_LOGLEVEL, using {DEFAULT_LOGLEVEL}");
                    DEFAULT_LOGLEVEL
                }
            },
        };

        let test_path = lookup("TESTPATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            simulator_url,
            test_pattern,
            parallelism,
            log_level,
            test_path,
        })
    }
}

/// Maps the hive log level (0-5) onto a tracing directive.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 | 1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `HIVE_LOGLEVEL`.
pub fn init_logging() {
    let level = env::var("HIVE_LOGLEVEL")
        .ok()
        .and_then(|l| l.trim().parse::<u8>().ok())
        .unwrap_or(DEFAULT_LOGLEVEL);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
