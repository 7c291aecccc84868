use crate::blocktest::{normalize_hash, Loaded};
use hivesim::utils::jitter;
use hivesim::{dyn_async, Client, ClientTestSpec, Suite, Test, TestSpec, RPC_PORT};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::rpc_params;
use serde_json::Value;
use tracing::info;

const SOURCE_URL: &str = "https://github.com/ethereum/tests/blob/develop/BlockchainTests";

/// What the client must report once it imported the blocks.
#[derive(Clone, Debug)]
pub struct Expected {
    pub genesis: String,
    pub last_block: String,
    pub rpc_port: u16,
}

pub fn consensus_suite(tests: Vec<Loaded>) -> Suite {
    consensus_suite_on(tests, RPC_PORT)
}

pub(crate) fn consensus_suite_on(tests: Vec<Loaded>, rpc_port: u16) -> Suite {
    let mut suite = Suite::new(
        "consensus",
        "The consensus test suite executes BlockchainTests from the official test repository. \
        For every test it starts an instance of the client under test and makes it import the \
        RLP blocks. After the import the node is queried for its genesis and latest block, \
        which must match the hashes recorded in the test.",
    );

    for loaded in tests {
        match loaded {
            Loaded::Test(case) => {
                let expected = case.genesis_hash().map(|genesis| Expected {
                    genesis,
                    last_block: case.last_block_hash(),
                    rpc_port,
                });
                let spec = expected.and_then(|expected| {
                    Ok(ClientTestSpec {
                        name: case.name.clone(),
                        description: format!(
                            "Test source: [`{}`]({SOURCE_URL}/{})",
                            case.name, case.source
                        ),
                        always_run: false,
                        role: Some("eth1".to_string()),
                        options: case.client_options()?,
                        run: verify_chain,
                        data: expected,
                        client: None,
                    })
                });
                match spec {
                    Ok(spec) => suite.add(spec),
                    Err(err) => suite.add(broken(case.name, err.to_string())),
                }
            }
            Loaded::Broken { name, reason } => suite.add(broken(name, reason)),
        }
    }
    info!(tests = suite.tests.len(), "consensus suite prepared");
    suite
}

fn broken(name: String, reason: String) -> TestSpec<String> {
    TestSpec {
        name,
        description: String::new(),
        always_run: false,
        run: report_broken,
        data: reason,
    }
}

dyn_async! {
    async fn report_broken<'a>(test: &'a mut Test, reason: String) {
        test.errored(reason);
    }
}

/// Hash of the block at `tag`. The client may still be importing, so a
/// failed call is tried once more.
async fn block_hash(client: &Client, port: u16, tag: &str) -> hivesim::Result<String> {
    let rpc = client.rpc_at(port)?;
    let block: Value = match rpc
        .request("eth_getBlockByNumber", rpc_params![tag, false])
        .await
    {
        Ok(block) => block,
        Err(err) => {
            info!(%err, "block query failed, making one more attempt");
            tokio::time::sleep(jitter()).await;
            rpc.request("eth_getBlockByNumber", rpc_params![tag, false])
                .await
                .map_err(|e| hivesim::Error::Transport(e.to_string()))?
        }
    };
    match block.get("hash") {
        Some(Value::String(hash)) => Ok(normalize_hash(hash)),
        Some(other) => Err(hivesim::Error::ProtocolMismatch(format!(
            "string conversion failed for `{other}`"
        ))),
        None => Err(hivesim::Error::ProtocolMismatch(
            "No hash found in response".to_string(),
        )),
    }
}

dyn_async! {
    async fn verify_chain<'a>(test: &'a mut Test, client: Client, expected: Expected) {
        let genesis = match block_hash(&client, expected.rpc_port, "0x0").await {
            Ok(hash) => hash,
            Err(err) => test.fatal(format!("Failed to check genesis: {err}")),
        };
        if genesis != expected.genesis {
            test.fatal(format!(
                "Genesis mismatch, expected `{}` got `{genesis}`",
                expected.genesis
            ));
        }

        let latest = match block_hash(&client, expected.rpc_port, "latest").await {
            Ok(hash) => hash,
            Err(err) => test.fatal(format!("Failed to check latest block: {err}")),
        };
        if latest != expected.last_block {
            test.fatal(format!(
                "Last block mismatch, expected `{}` got `{latest}`",
                expected.last_block
            ));
        }
    }
}
