//! Blockchain tests from the ethereum/tests repository.

use bytes::Bytes;
use hivesim::corpus::{discover, CorpusFile};
use hivesim::{ClientOptions, Error, FileSource, Params, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Activation block for forks a test chain never reaches.
pub const NEVER: u64 = 2000;

const LEGACY_FORKS: [&str; 7] = [
    "HIVE_FORK_HOMESTEAD",
    "HIVE_FORK_TANGERINE",
    "HIVE_FORK_SPURIOUS",
    "HIVE_FORK_BYZANTIUM",
    "HIVE_FORK_CONSTANTINOPLE",
    "HIVE_FORK_PETERSBURG",
    "HIVE_FORK_ISTANBUL",
];

/// Header fields carried over into the client's genesis file.
const GENESIS_FIELDS: [&str; 8] = [
    "nonce",
    "timestamp",
    "extraData",
    "gasLimit",
    "difficulty",
    "mixHash",
    "coinbase",
    "baseFeePerGas",
];

#[derive(Clone, Debug, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub rlp: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BlockTest {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(rename = "genesisBlockHeader")]
    pub genesis: Map<String, Value>,
    #[serde(default)]
    pub pre: Map<String, Value>,
    #[serde(rename = "lastblockhash")]
    pub last_block_hash: String,
    pub network: String,
    #[serde(rename = "sealEngine", default)]
    pub seal_engine: String,
}

/// The first `active` legacy forks at genesis, the next `at_five` at block
/// 5, the rest never.
fn legacy(active: usize, at_five: usize) -> Vec<(&'static str, u64)> {
    LEGACY_FORKS
        .iter()
        .enumerate()
        .map(|(i, fork)| {
            let block = if i < active {
                0
            } else if i < active + at_five {
                5
            } else {
                NEVER
            };
            (*fork, block)
        })
        .collect()
}

fn berlin() -> Vec<(&'static str, u64)> {
    let mut rules = legacy(7, 0);
    rules.push(("HIVE_FORK_MUIR_GLACIER", 0));
    rules.push(("HIVE_FORK_BERLIN", 0));
    rules
}

fn london() -> Vec<(&'static str, u64)> {
    let mut rules = berlin();
    rules.push(("HIVE_FORK_LONDON", 0));
    rules
}

fn merge() -> Vec<(&'static str, u64)> {
    let mut rules = london();
    rules.push(("HIVE_TERMINAL_TOTAL_DIFFICULTY", 0));
    rules
}

/// Fork activation parameters for a chain rule label.
pub fn ruleset(network: &str) -> Option<Vec<(&'static str, u64)>> {
    let rules = match network {
        "Frontier" => legacy(0, 0),
        "Homestead" => legacy(1, 0),
        "EIP150" => legacy(2, 0),
        "EIP158" => legacy(3, 0),
        "Byzantium" => legacy(4, 0),
        "Constantinople" => legacy(5, 0),
        "ConstantinopleFix" => legacy(6, 0),
        "Istanbul" => legacy(7, 0),
        "FrontierToHomesteadAt5" => legacy(0, 1),
        "HomesteadToEIP150At5" => legacy(1, 1),
        "HomesteadToDaoAt5" => {
            let mut rules = legacy(1, 0);
            rules.push(("HIVE_FORK_DAO_BLOCK", 5));
            rules
        }
        "EIP158ToByzantiumAt5" => legacy(3, 1),
        "ByzantiumToConstantinopleAt5" => legacy(4, 1),
        "ByzantiumToConstantinopleFixAt5" => legacy(4, 2),
        "ConstantinopleFixToIstanbulAt5" => legacy(6, 1),
        "Berlin" => berlin(),
        "BerlinToLondonAt5" => {
            let mut rules = berlin();
            rules.push(("HIVE_FORK_LONDON", 5));
            rules
        }
        "London" => london(),
        "Merge" | "Paris" => merge(),
        "Shanghai" => {
            let mut rules = merge();
            rules.push(("HIVE_SHANGHAI_TIMESTAMP", 0));
            rules
        }
        _ => return None,
    };
    Some(rules)
}

/// One named test out of a corpus file.
#[derive(Clone, Debug)]
pub struct Case {
    pub name: String,
    /// Corpus file the test came from, relative to the corpus root.
    pub source: String,
    pub test: BlockTest,
}

impl Case {
    /// Client parameters for this test's chain rules.
    pub fn params(&self) -> Result<Params> {
        let rules = ruleset(&self.test.network).ok_or_else(|| {
            Error::corpus(
                self.name.clone(),
                format!("network `{}` not defined in ruleset", self.test.network),
            )
        })?;
        let mut params: Params = rules
            .into_iter()
            .map(|(key, block)| (key, block.to_string()))
            .collect();
        params.insert("HIVE_FORK_DAO_VOTE", "1");
        params.insert("HIVE_CHAIN_ID", "1");
        params.insert("HIVE_NODETYPE", "full");
        if self.test.seal_engine == "NoProof" {
            params.insert("HIVE_SKIP_POW", "1");
        }
        Ok(params)
    }

    /// Genesis file derived from the genesis header and the pre-state.
    pub fn genesis(&self) -> Value {
        let mut genesis = Map::new();
        for field in GENESIS_FIELDS {
            if let Some(value) = self.test.genesis.get(field) {
                genesis.insert(field.to_string(), value.clone());
            }
        }
        genesis.insert("alloc".to_string(), Value::Object(self.test.pre.clone()));
        Value::Object(genesis)
    }

    pub fn genesis_hash(&self) -> Result<String> {
        self.test
            .genesis
            .get("hash")
            .and_then(Value::as_str)
            .map(normalize_hash)
            .ok_or_else(|| Error::corpus(self.name.clone(), "genesis header has no hash"))
    }

    pub fn last_block_hash(&self) -> String {
        normalize_hash(&self.test.last_block_hash)
    }

    /// Container files: the genesis and every block in import order.
    pub fn files(&self) -> Result<BTreeMap<String, Bytes>> {
        let mut files = BTreeMap::new();
        let genesis = serde_json::to_vec(&self.genesis())?;
        files.insert("/genesis.json".to_string(), Bytes::from(genesis));
        for (i, block) in self.test.blocks.iter().enumerate() {
            let digits = block.rlp.trim_start_matches("0x");
            let rlp = hex::decode(digits).map_err(|e| {
                Error::corpus(self.name.clone(), format!("block {}: invalid rlp hex: {e}", i + 1))
            })?;
            files.insert(format!("/blocks/{:04}.rlp", i + 1), Bytes::from(rlp));
        }
        Ok(files)
    }

    pub fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::new().params(self.params()?);
        for (path, content) in self.files()? {
            options = options.file(path, FileSource::bytes(content));
        }
        Ok(options)
    }
}

/// Lowercase, `0x` prefixed, 32 bytes.
pub fn normalize_hash(hash: &str) -> String {
    let digits = hash.trim().trim_start_matches("0x").to_lowercase();
    format!("0x{digits:0>64}")
}

/// A corpus entry: a runnable test or the reason it isn't one.
#[derive(Clone, Debug)]
pub enum Loaded {
    Test(Case),
    Broken { name: String, reason: String },
}

impl Loaded {
    pub fn name(&self) -> &str {
        match self {
            Loaded::Test(case) => &case.name,
            Loaded::Broken { name, .. } => name,
        }
    }
}

fn load_file(file: &CorpusFile, source: &str) -> Result<Vec<Loaded>> {
    let content = std::fs::read(&file.path)
        .map_err(|e| Error::corpus(file.path.display().to_string(), e.to_string()))?;
    let tests: BTreeMap<String, BlockTest> = serde_json::from_slice(&content)
        .map_err(|e| Error::corpus(file.name.clone(), e.to_string()))?;

    Ok(tests
        .into_iter()
        .map(|(name, test)| {
            let case = Case {
                name,
                source: source.to_string(),
                test,
            };
            match case.params().and_then(|_| case.files()) {
                Ok(_) => Loaded::Test(case),
                Err(err) => {
                    debug!(test = %case.name, %err, "skipping invalid test");
                    Loaded::Broken {
                        name: case.name,
                        reason: err.to_string(),
                    }
                }
            }
        })
        .collect())
}

/// Loads the tests below `root` in file order, at most `limit` of them.
pub fn load_corpus(root: &Path, limit: Option<usize>) -> Result<Vec<Loaded>> {
    let mut loaded = Vec::new();
    for file in discover(root, "json", None)? {
        if limit.is_some_and(|limit| loaded.len() >= limit) {
            break;
        }
        let source = format!("{}.json", file.name);
        match load_file(&file, &source) {
            Ok(tests) => loaded.extend(tests),
            Err(err) => {
                warn!(file = %file.name, %err, "can't load test file");
                loaded.push(Loaded::Broken {
                    name: source,
                    reason: err.to_string(),
                });
            }
        }
    }
    if let Some(limit) = limit {
        loaded.truncate(limit);
    }
    Ok(loaded)
}

/// A minimal single-test fixture for the given chain rules.
#[cfg(test)]
pub(crate) fn sample(network: &str) -> Value {
    serde_json::json!({
        "blocks": [{"rlp": "0xc0"}, {"rlp": "c1c0"}],
        "genesisBlockHeader": {
            "hash": "0xAFA8fc2deb658d8120f4011e459159a6472b88e2dfed6518640be01dbbfd20a9",
            "nonce": "0x0000000000000000",
            "timestamp": "0x00",
            "extraData": "0x00",
            "gasLimit": "0x05f5e100",
            "difficulty": "0x020000",
            "mixHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "coinbase": "0x2adc25665018aa1fe0e6bc666dac8fc2697ff9ba",
            "stateRoot": "0xf3d3787e33cb7913a304f188002f59e7b7a1e1fe3a712988c7092a213f8c2e8f"
        },
        "pre": {"0x095e7baea6a6c7c4c2dfeb977efac326af552d87": {"balance": "0x0de0b6b3a7640000"}},
        "lastblockhash": "e0d1c4b8c3e2d4b1a5f6e7d8c9b0a1f2e3d4c5b6a7980f1e2d3c4b5a69788796",
        "network": network,
        "sealEngine": "NoProof"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn case(network: &str) -> Case {
        Case {
            name: "add_d0g0v0".to_string(),
            source: "BlockchainTests/add.json".to_string(),
            test: serde_json::from_value(sample(network)).unwrap(),
        }
    }

    #[test]
    fn legacy_rules() {
        let params = case("EIP158ToByzantiumAt5").params().unwrap();
        assert_eq!(params.get("HIVE_FORK_SPURIOUS"), Some("0"));
        assert_eq!(params.get("HIVE_FORK_BYZANTIUM"), Some("5"));
        assert_eq!(params.get("HIVE_FORK_CONSTANTINOPLE"), Some("2000"));
        assert_eq!(params.get("HIVE_SKIP_POW"), Some("1"));
        assert_eq!(params.get("HIVE_FORK_DAO_VOTE"), Some("1"));
        assert_eq!(params.get("HIVE_CHAIN_ID"), Some("1"));
        assert_eq!(params.get("HIVE_NODETYPE"), Some("full"));
    }

    #[test]
    fn dao_block_only_for_dao_transition() {
        for network in ["Frontier", "Homestead", "Istanbul", "London"] {
            let params = case(network).params().unwrap();
            assert_eq!(params.get("HIVE_FORK_DAO_BLOCK"), None, "{network}");
        }
        let params = case("HomesteadToDaoAt5").params().unwrap();
        assert_eq!(params.get("HIVE_FORK_DAO_BLOCK"), Some("5"));
        assert_eq!(params.get("HIVE_FORK_TANGERINE"), Some("2000"));
    }

    #[test]
    fn modern_rules() {
        let params = case("Shanghai").params().unwrap();
        assert_eq!(params.get("HIVE_FORK_ISTANBUL"), Some("0"));
        assert_eq!(params.get("HIVE_FORK_LONDON"), Some("0"));
        assert_eq!(params.get("HIVE_TERMINAL_TOTAL_DIFFICULTY"), Some("0"));
        assert_eq!(params.get("HIVE_SHANGHAI_TIMESTAMP"), Some("0"));

        let params = case("BerlinToLondonAt5").params().unwrap();
        assert_eq!(params.get("HIVE_FORK_BERLIN"), Some("0"));
        assert_eq!(params.get("HIVE_FORK_LONDON"), Some("5"));
    }

    #[test]
    fn unknown_network() {
        let err = case("Prague").params().unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::Corpus);
        assert!(err.to_string().contains("network `Prague` not defined in ruleset"));
    }

    #[test]
    fn genesis_from_header_and_pre() {
        let genesis = case("Istanbul").genesis();
        assert_eq!(genesis["gasLimit"], "0x05f5e100");
        assert_eq!(genesis["coinbase"], "0x2adc25665018aa1fe0e6bc666dac8fc2697ff9ba");
        assert!(genesis.get("stateRoot").is_none());
        assert!(genesis.get("hash").is_none());
        assert_eq!(
            genesis["alloc"]["0x095e7baea6a6c7c4c2dfeb977efac326af552d87"]["balance"],
            "0x0de0b6b3a7640000"
        );
    }

    #[test]
    fn block_files() {
        let files = case("Istanbul").files().unwrap();
        let names: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(names, ["/blocks/0001.rlp", "/blocks/0002.rlp", "/genesis.json"]);
        assert_eq!(&files["/blocks/0001.rlp"][..], &[0xc0]);
        assert_eq!(&files["/blocks/0002.rlp"][..], &[0xc1, 0xc0]);
    }

    #[test]
    fn hashes_are_normalized() {
        let case = case("Istanbul");
        assert_eq!(
            case.genesis_hash().unwrap(),
            "0xafa8fc2deb658d8120f4011e459159a6472b88e2dfed6518640be01dbbfd20a9"
        );
        assert!(case.last_block_hash().starts_with("0xe0d1"));
        assert_eq!(normalize_hash("0x1"), format!("0x{}1", "0".repeat(63)));
    }

    #[test]
    fn corpus_loading() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("bcValidBlockTest")).unwrap();
        let file = json!({
            "b_test": sample("Berlin"),
            "a_test": sample("Istanbul"),
            "c_test": sample("Atlantis"),
        });
        fs::write(root.join("bcValidBlockTest/simple.json"), file.to_string()).unwrap();
        fs::write(root.join("bcValidBlockTest/broken.json"), "{").unwrap();

        let loaded = load_corpus(root, None).unwrap();
        let names: Vec<&str> = loaded.iter().map(Loaded::name).collect();
        assert_eq!(
            names,
            ["bcValidBlockTest/broken.json", "a_test", "b_test", "c_test"]
        );
        assert!(matches!(&loaded[0], Loaded::Broken { .. }));
        assert!(matches!(&loaded[1], Loaded::Test(case) if case.source == "bcValidBlockTest/simple.json"));
        assert!(matches!(&loaded[3], Loaded::Broken { reason, .. } if reason.contains("Atlantis")));

        let limited = load_corpus(root, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
