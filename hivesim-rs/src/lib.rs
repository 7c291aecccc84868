#![warn(clippy::unwrap_used)]
mod macros;
pub mod config;
pub mod corpus;
mod error;
pub mod fakes;
pub mod jwt;
pub mod options;
mod runner;
mod simulation;
mod testapi;
mod testmatch;
pub mod types;
pub mod utils;

pub use config::{init_logging, HiveEnv};
pub use error::{Error, ErrorKind, Result};
pub use options::{ClientOptions, FileSource, Params};
pub use runner::{run_suite, run_suite_with_cancel, RunSummary, SuiteContext, TestReport};
pub use simulation::Simulation;
pub use testapi::{
    AsyncClientTestFunc, AsyncNClientsTestFunc, AsyncTestFunc, Client, ClientTestSpec,
    NClientTestSpec, Suite, Test, TestSpec, Testable, ENGINE_PORT, RPC_PORT, RPC_TIMEOUT, WS_PORT,
};
pub use testmatch::TestMatcher;
pub use types::Outcome;
