use crate::conversation::{Endpoint, Replayer, CALL_TIMEOUT};
use crate::testload::{load_tests, RpcTest};
use hivesim::{
    dyn_async, Client, ClientOptions, ClientTestSpec, ErrorKind, Params, Suite, Test, TestSpec,
    ENGINE_PORT, RPC_PORT, WS_PORT,
};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Client parameters used when the corpus has no `forkenv.json`.
const DEFAULT_ENV: &[(&str, &str)] = &[
    ("HIVE_NODETYPE", "full"),
    ("HIVE_NETWORK_ID", "1"),
    ("HIVE_CHAIN_ID", "1"),
    ("HIVE_FORK_HOMESTEAD", "0"),
    ("HIVE_FORK_TANGERINE", "0"),
    ("HIVE_FORK_SPURIOUS", "0"),
    ("HIVE_FORK_BYZANTIUM", "0"),
    ("HIVE_FORK_CONSTANTINOPLE", "0"),
    ("HIVE_FORK_PETERSBURG", "0"),
    ("HIVE_FORK_ISTANBUL", "0"),
    ("HIVE_FORK_MUIR_GLACIER", "0"),
    ("HIVE_FORK_BERLIN", "0"),
    ("HIVE_FORK_LONDON", "0"),
    ("HIVE_SKIP_POW", "1"),
];

/// A `forkchoiceUpdated` call sent before the tests so the client serves
/// the imported chain head.
#[derive(Clone, Debug, Deserialize)]
pub struct ForkchoiceCall {
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Clone, Copy, Debug)]
pub struct Ports {
    pub rpc: u16,
    pub ws: u16,
    pub engine: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            rpc: RPC_PORT,
            ws: WS_PORT,
            engine: ENGINE_PORT,
        }
    }
}

/// A loaded test, or the reason it couldn't be loaded.
pub type LoadedTest = (String, Result<Arc<RpcTest>, String>);

/// Everything the launch test needs, shared by all client types.
#[derive(Clone)]
pub struct Corpus {
    pub tests: Arc<Vec<LoadedTest>>,
    pub priming: Option<ForkchoiceCall>,
    pub ports: Ports,
    pub timeout: Duration,
}

impl Corpus {
    /// Reads the `.io` files and the optional `headfcu.json` below `dir`.
    pub fn load(dir: &Path) -> hivesim::Result<Corpus> {
        let tests = load_tests(dir)?
            .into_iter()
            .map(|(name, test)| (name, test.map(Arc::new).map_err(|e| e.to_string())))
            .collect::<Vec<_>>();
        let fcu = dir.join("headfcu.json");
        let priming = if fcu.is_file() {
            let text = std::fs::read_to_string(&fcu)
                .map_err(|e| hivesim::Error::corpus(fcu.display().to_string(), e.to_string()))?;
            Some(serde_json::from_str(&text)?)
        } else {
            None
        };
        info!(tests = tests.len(), primed = priming.is_some(), "corpus loaded");
        Ok(Corpus {
            tests: Arc::new(tests),
            priming,
            ports: Ports::default(),
            timeout: CALL_TIMEOUT,
        })
    }
}

/// Parameters and chain files for the client under test.
pub fn client_options(dir: &Path) -> hivesim::Result<ClientOptions> {
    let forkenv = dir.join("forkenv.json");
    let params = if forkenv.is_file() {
        Params::from_json_file(&forkenv)?.hive_prefixed()
    } else {
        DEFAULT_ENV.iter().copied().collect()
    };
    Ok(ClientOptions::new().params(params).static_files([
        ("/genesis.json", dir.join("genesis.json")),
        ("/chain.rlp", dir.join("chain.rlp")),
    ]))
}

pub fn rpc_compat_suite(corpus: Corpus, options: ClientOptions) -> Suite {
    let mut suite = Suite::new(
        "rpc-compat",
        "The RPC-compatibility test suite runs a set of RPC related tests against a
        running node. It tests client implementations of the JSON-RPC API for
        conformance with the execution API specification.",
    );
    suite.add(ClientTestSpec {
        name: "client launch".to_string(),
        description: "This test launches the client and collects its logs.".to_string(),
        always_run: true,
        role: Some("eth1".to_string()),
        options,
        run: run_all_tests,
        data: corpus,
        client: None,
    });
    suite
}

#[derive(Clone)]
struct RpcCase {
    test: Result<Arc<RpcTest>, String>,
    replayer: Arc<Replayer>,
}

async fn send_forkchoice_updated(
    client: &Client,
    port: u16,
    call: &ForkchoiceCall,
) -> hivesim::Result<Value> {
    let engine = client.engine_api_at(port)?;
    let mut params = ArrayParams::new();
    for param in &call.params {
        params.insert(param)?;
    }
    engine
        .request(&call.method, params)
        .await
        .map_err(|e| hivesim::Error::Transport(e.to_string()))
}

dyn_async! {
    async fn run_all_tests<'a>(test: &'a mut Test, client: Client, corpus: Corpus) {
        if let Some(call) = &corpus.priming {
            match send_forkchoice_updated(&client, corpus.ports.engine, call).await {
                Ok(resp) => test.log(format!("forkchoiceUpdated: {resp}")),
                Err(err) => test.fatal(format!("client rejected forkchoiceUpdated: {err}")),
            }
        }

        let endpoint = Endpoint {
            http_url: format!("http://{}:{}", client.ip, corpus.ports.rpc),
            ws_url: format!("ws://{}:{}", client.ip, corpus.ports.ws),
            timeout: corpus.timeout,
        };
        let replayer = match Replayer::new(endpoint) {
            Ok(replayer) => Arc::new(replayer),
            Err(err) => test.fatal(format!("can't build RPC transport: {err}")),
        };

        for (name, loaded) in corpus.tests.iter() {
            let description = match loaded {
                Ok(rpc) => rpc.comment.clone(),
                Err(_) => String::new(),
            };
            test.run_isolated(TestSpec {
                name: format!("{name} ({})", client.kind),
                description,
                always_run: false,
                run: run_rpc_test,
                data: RpcCase {
                    test: loaded.clone(),
                    replayer: replayer.clone(),
                },
            })
            .await;
        }
    }
}

dyn_async! {
    async fn run_rpc_test<'a>(test: &'a mut Test, case: RpcCase) {
        let rpc = match &case.test {
            Ok(rpc) => rpc.clone(),
            Err(message) => {
                test.errored(message);
                return;
            }
        };
        if rpc.speconly {
            test.mark_spec_only();
        }

        let t: &Test = test;
        let result = case.replayer.run(&rpc, |line| t.log(line)).await;
        if let Err(err) = result {
            match err.kind() {
                ErrorKind::Timeout | ErrorKind::Corpus => test.errored(err),
                _ => test.error(err),
            }
        }
    }
}
