//! In-process stand-in for the hive host API, for exercising simulators
//! without docker.

use crate::types::{
    ClientDefinition, ErrorResponse, ExecInfo, ExecRequest, NodeConfig, StartNodeResponse,
    SuiteID, TestID, TestRequest, TestResult,
};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Clone, Debug, Default)]
pub struct TestRecord {
    pub name: String,
    pub description: String,
    pub result: Option<TestResult>,
}

#[derive(Clone, Debug, Default)]
pub struct SuiteRecord {
    pub name: String,
    pub description: String,
    pub ended: bool,
    pub tests: BTreeMap<TestID, TestRecord>,
}

#[derive(Clone, Debug)]
pub struct ContainerRecord {
    pub client: String,
    pub suite: SuiteID,
    pub test: TestID,
    pub ip: IpAddr,
    pub environment: HashMap<String, String>,
    pub networks: Vec<String>,
    pub files: HashMap<String, Vec<u8>>,
    pub stopped: bool,
}

#[derive(Clone, Debug, Default)]
pub struct HostState {
    pub clients: Vec<ClientDefinition>,
    pub suites: BTreeMap<SuiteID, SuiteRecord>,
    pub containers: BTreeMap<String, ContainerRecord>,
    pub networks: BTreeMap<(SuiteID, String), HashSet<String>>,
    pub removed_networks: Vec<String>,
    /// Address reported for started clients and their network endpoints.
    /// Defaults to bridge-like addresses.
    pub client_ip: Option<IpAddr>,
    /// When set, client starts fail with a 500 and this message.
    pub startup_failure: Option<String>,
    next_suite: SuiteID,
    next_test: TestID,
    next_container: u32,
}

type Shared = Arc<Mutex<HostState>>;

/// Container id the host uses for the simulator itself.
const SIMULATION: &str = "simulation";

fn lock(state: &Shared) -> MutexGuard<'_, HostState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct HostError(StatusCode, String);

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

fn not_found(what: impl Into<String>) -> HostError {
    HostError(StatusCode::NOT_FOUND, what.into())
}

fn bad_request(what: impl Into<String>) -> HostError {
    HostError(StatusCode::BAD_REQUEST, what.into())
}

/// A fake host listening on a loopback port. The server stops when dropped.
pub struct FakeHost {
    pub url: String,
    pub addr: SocketAddr,
    state: Shared,
    server: JoinHandle<()>,
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl FakeHost {
    pub async fn start(clients: Vec<ClientDefinition>) -> std::io::Result<FakeHost> {
        let state: Shared = Arc::new(Mutex::new(HostState {
            clients,
            next_suite: 1,
            next_test: 1,
            next_container: 1,
            ..Default::default()
        }));

        let app = Router::new()
            .route("/clients", get(list_clients))
            .route("/testsuite", post(start_suite))
            .route("/testsuite/:suite", axum::routing::delete(end_suite))
            .route("/testsuite/:suite/test", post(start_test))
            .route("/testsuite/:suite/test/:test", post(end_test))
            .route("/testsuite/:suite/test/:test/node", post(start_node))
            .route(
                "/testsuite/:suite/test/:test/node/:container",
                axum::routing::delete(stop_node),
            )
            .route(
                "/testsuite/:suite/test/:test/node/:container/exec",
                post(exec_node),
            )
            .route(
                "/testsuite/:suite/test/:test/node/:container/enode",
                get(enode),
            )
            .route(
                "/testsuite/:suite/network/:network",
                post(create_network).delete(remove_network),
            )
            .route(
                "/testsuite/:suite/network/:network/:container",
                post(connect).delete(disconnect).get(network_ip),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(FakeHost {
            url: format!("http://{addr}"),
            addr,
            state,
            server,
        })
    }

    /// Copy of the recorded host state.
    pub fn snapshot(&self) -> HostState {
        lock(&self.state).clone()
    }

    pub fn set_client_ip(&self, ip: IpAddr) {
        lock(&self.state).client_ip = Some(ip);
    }

    pub fn fail_client_start(&self, message: &str) {
        lock(&self.state).startup_failure = Some(message.to_string());
    }

    /// All test results of all suites, in start order.
    pub fn results(&self) -> Vec<(String, Option<TestResult>)> {
        lock(&self.state)
            .suites
            .values()
            .flat_map(|s| s.tests.values())
            .map(|t| (t.name.clone(), t.result.clone()))
            .collect()
    }

    pub fn result_of(&self, name: &str) -> Option<TestResult> {
        self.results()
            .into_iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, r)| r)
    }
}

async fn list_clients(State(state): State<Shared>) -> Json<Vec<ClientDefinition>> {
    Json(lock(&state).clients.clone())
}

async fn start_suite(
    State(state): State<Shared>,
    Json(req): Json<TestRequest>,
) -> Json<SuiteID> {
    let mut st = lock(&state);
    let id = st.next_suite;
    st.next_suite += 1;
    st.suites.insert(
        id,
        SuiteRecord {
            name: req.name,
            description: req.description,
            ..Default::default()
        },
    );
    Json(id)
}

async fn end_suite(
    State(state): State<Shared>,
    Path(suite): Path<SuiteID>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    let record = st
        .suites
        .get_mut(&suite)
        .filter(|s| !s.ended)
        .ok_or_else(|| not_found("no such test suite"))?;
    record.ended = true;
    Ok(StatusCode::OK)
}

async fn start_test(
    State(state): State<Shared>,
    Path(suite): Path<SuiteID>,
    Json(req): Json<TestRequest>,
) -> Result<Json<TestID>, HostError> {
    let mut st = lock(&state);
    let id = st.next_test;
    let record = st
        .suites
        .get_mut(&suite)
        .filter(|s| !s.ended)
        .ok_or_else(|| not_found("no such test suite"))?;
    record.tests.insert(
        id,
        TestRecord {
            name: req.name,
            description: req.description,
            result: None,
        },
    );
    st.next_test += 1;
    Ok(Json(id))
}

async fn end_test(
    State(state): State<Shared>,
    Path((suite, test)): Path<(SuiteID, TestID)>,
    Json(result): Json<TestResult>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    let record = st
        .suites
        .get_mut(&suite)
        .and_then(|s| s.tests.get_mut(&test))
        .ok_or_else(|| not_found("no such test"))?;
    if record.result.is_some() {
        return Err(bad_request("test already ended"));
    }
    record.result = Some(result);
    Ok(StatusCode::OK)
}

async fn start_node(
    State(state): State<Shared>,
    Path((suite, test)): Path<(SuiteID, TestID)>,
    mut form: Multipart,
) -> Result<Json<StartNodeResponse>, HostError> {
    let mut config: Option<NodeConfig> = None;
    let mut files = HashMap::new();
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
        if name == "config" {
            config = Some(serde_json::from_slice(&data).map_err(|e| bad_request(e.to_string()))?);
        } else {
            files.insert(name, data.to_vec());
        }
    }
    let config = config.ok_or_else(|| bad_request("missing 'config' parameter"))?;

    let mut st = lock(&state);
    if !st.suites.get(&suite).is_some_and(|s| s.tests.contains_key(&test)) {
        return Err(not_found("no such test"));
    }
    if !st.clients.iter().any(|c| c.name == config.client) {
        return Err(bad_request(format!("unknown client type {}", config.client)));
    }
    if let Some(message) = &st.startup_failure {
        return Err(HostError(StatusCode::INTERNAL_SERVER_ERROR, message.clone()));
    }

    let n = st.next_container;
    st.next_container += 1;
    let id = format!("{:012x}", 0xc0ffee_u64 * 0x1000 + n as u64);
    let ip = st
        .client_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(172, 17, 0, (n % 250 + 2) as u8)));
    for network in &config.networks {
        if let Some(members) = st.networks.get_mut(&(suite, network.clone())) {
            members.insert(id.clone());
        }
    }
    st.containers.insert(
        id.clone(),
        ContainerRecord {
            client: config.client,
            suite,
            test,
            ip,
            environment: config.environment,
            networks: config.networks,
            files,
            stopped: false,
        },
    );
    Ok(Json(StartNodeResponse {
        id,
        ip: ip.to_string(),
    }))
}

fn live_container<'a>(
    st: &'a mut HostState,
    container: &str,
) -> Result<&'a mut ContainerRecord, HostError> {
    st.containers
        .get_mut(container)
        .filter(|c| !c.stopped)
        .ok_or_else(|| not_found(format!("no such container {container}")))
}

async fn stop_node(
    State(state): State<Shared>,
    Path((_suite, _test, container)): Path<(SuiteID, TestID, String)>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    live_container(&mut st, &container)?.stopped = true;
    Ok(StatusCode::OK)
}

/// Understands `cat <path>` and `echo <args>`.
async fn exec_node(
    State(state): State<Shared>,
    Path((_suite, _test, container)): Path<(SuiteID, TestID, String)>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecInfo>, HostError> {
    let mut st = lock(&state);
    let record = live_container(&mut st, &container)?;
    let info = match req.command.split_first() {
        Some((cmd, args)) if cmd == "cat" && args.len() == 1 => match record.files.get(&args[0]) {
            Some(content) => ExecInfo {
                stdout: String::from_utf8_lossy(content).into_owned(),
                ..Default::default()
            },
            None => ExecInfo {
                stderr: format!("cat: {}: No such file or directory\n", args[0]),
                exit_code: 1,
                ..Default::default()
            },
        },
        Some((cmd, args)) if cmd == "echo" => ExecInfo {
            stdout: format!("{}\n", args.join(" ")),
            ..Default::default()
        },
        _ => ExecInfo {
            stderr: "command not found\n".to_string(),
            exit_code: 127,
            ..Default::default()
        },
    };
    Ok(Json(info))
}

async fn enode(
    State(state): State<Shared>,
    Path((_suite, _test, container)): Path<(SuiteID, TestID, String)>,
) -> Result<String, HostError> {
    let mut st = lock(&state);
    let record = live_container(&mut st, &container)?;
    Ok(format!("enode://{}@{}:30303", "a".repeat(128), record.ip))
}

async fn create_network(
    State(state): State<Shared>,
    Path((suite, network)): Path<(SuiteID, String)>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    if st.networks.contains_key(&(suite, network.clone())) {
        return Err(bad_request(format!("network {network} already exists")));
    }
    st.networks.insert((suite, network), HashSet::new());
    Ok(StatusCode::OK)
}

async fn remove_network(
    State(state): State<Shared>,
    Path((suite, network)): Path<(SuiteID, String)>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    match st.networks.get(&(suite, network.clone())) {
        None => return Err(not_found(format!("no such network {network}"))),
        Some(members) if !members.is_empty() => {
            return Err(bad_request(format!("network {network} is in use")))
        }
        Some(_) => {}
    }
    st.networks.remove(&(suite, network.clone()));
    st.removed_networks.push(network);
    Ok(StatusCode::OK)
}

async fn connect(
    State(state): State<Shared>,
    Path((suite, network, container)): Path<(SuiteID, String, String)>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    if container != SIMULATION {
        live_container(&mut st, &container)?;
    }
    let members = st
        .networks
        .get_mut(&(suite, network.clone()))
        .ok_or_else(|| not_found(format!("no such network {network}")))?;
    if !members.insert(container) {
        return Err(bad_request("container already in network"));
    }
    Ok(StatusCode::OK)
}

async fn disconnect(
    State(state): State<Shared>,
    Path((suite, network, container)): Path<(SuiteID, String, String)>,
) -> Result<StatusCode, HostError> {
    let mut st = lock(&state);
    let members = st
        .networks
        .get_mut(&(suite, network.clone()))
        .ok_or_else(|| not_found(format!("no such network {network}")))?;
    if !members.remove(&container) {
        return Err(not_found("container not in network"));
    }
    Ok(StatusCode::OK)
}

async fn network_ip(
    State(state): State<Shared>,
    Path((suite, network, container)): Path<(SuiteID, String, String)>,
) -> Result<Json<String>, HostError> {
    let st = lock(&state);
    if container == SIMULATION {
        return Ok(Json("127.0.0.1".to_string()));
    }
    let members = st
        .networks
        .get(&(suite, network.clone()))
        .ok_or_else(|| not_found(format!("no such network {network}")))?;
    if !members.contains(&container) {
        return Err(not_found("container not in network"));
    }
    if let Some(ip) = st.client_ip {
        return Ok(Json(ip.to_string()));
    }
    let index = members.iter().filter(|m| **m <= container).count() as u8;
    Ok(Json(format!("10.{}.0.{}", (suite % 250) as u8, index + 1)))
}
