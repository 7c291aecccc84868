use crate::error::{Error, Result};
use crate::jwt::engine_token_now;
use crate::options::ClientOptions;
use crate::runner::{execute, SuiteContext, TestReport};
use crate::types::{ClientDefinition, ExecInfo, Outcome, SuiteID, TestID, TestResult};
use crate::utils::{client_test_name, Fatal};
use crate::Simulation;
use ::std::{boxed::Box, future::Future, pin::Pin};
use async_trait::async_trait;
use core::fmt::Debug;
use dyn_clone::DynClone;
use futures::future::BoxFuture;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const RPC_PORT: u16 = 8545;
pub const WS_PORT: u16 = 8546;
pub const ENGINE_PORT: u16 = 8551;
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub type AsyncTestFunc<D> = fn(
    &mut Test,
    D,
) -> Pin<
    Box<
        dyn Future<Output = ()> // future API / pollable
            + Send // required by non-single-threaded executors
            + '_,
    >,
>;

pub type AsyncClientTestFunc<D> =
    fn(&mut Test, Client, D) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

pub type AsyncNClientsTestFunc<D> =
    fn(&mut Test, Vec<Client>, D) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

#[async_trait]
pub trait Testable: DynClone + Send + Sync {
    fn name(&self) -> String;

    fn always_run(&self) -> bool;

    /// Concrete tests this spec stands for, given the suite's client catalog.
    fn expand(&self, clients: &[ClientDefinition]) -> Vec<Box<dyn Testable>>;

    /// Registers the test with the host, runs it and reports the result.
    async fn run_test(&self, ctx: Arc<SuiteContext>) -> Vec<TestReport>;
}

impl Debug for dyn Testable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Testable({})", self.name())
    }
}

dyn_clone::clone_trait_object!(Testable);

/// The part of a test that runs inside its own task.
#[async_trait]
pub(crate) trait Body: Send + 'static {
    async fn call(self, test: &mut Test);
}

/// Description of a test suite
#[derive(Clone, Debug)]
pub struct Suite {
    pub name: String,
    pub description: String,
    pub tests: Vec<Box<dyn Testable>>,
}

impl Suite {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tests: vec![],
        }
    }

    pub fn add<T: Testable + 'static>(&mut self, test: T) {
        self.tests.push(Box::new(test))
    }
}

/// Represents a running client.
#[derive(Debug, Clone)]
pub struct Client {
    pub kind: String,
    pub container: String,
    pub ip: IpAddr,
    pub rpc: HttpClient,
    pub test: Test,
}

impl Client {
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.ip, RPC_PORT)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.ip, WS_PORT)
    }

    /// JSON-RPC client for another port of the container.
    pub fn rpc_at(&self, port: u16) -> Result<HttpClient> {
        HttpClientBuilder::default()
            .request_timeout(RPC_TIMEOUT)
            .build(format!("http://{}:{}", self.ip, port))
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Authenticated client for the engine API. The token is issued now, so
    /// build a fresh client for long running tests.
    pub fn engine_api(&self) -> Result<HttpClient> {
        self.engine_api_at(ENGINE_PORT)
    }

    pub fn engine_api_at(&self, port: u16) -> Result<HttpClient> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", engine_token_now()?))
            .map_err(|e| Error::Transport(e.to_string()))?;
        headers.insert("Authorization", bearer);
        HttpClientBuilder::default()
            .request_timeout(RPC_TIMEOUT)
            .set_headers(headers)
            .build(format!("http://{}:{}", self.ip, port))
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Runs a command in the client container.
    pub async fn exec(&self, command: &[&str]) -> Result<ExecInfo> {
        let command = command.iter().map(|c| c.to_string()).collect();
        self.test
            .sim
            .client_exec(self.test.suite_id, self.test.test_id, &self.container, command)
            .await
    }

    pub async fn enode_url(&self) -> Result<String> {
        self.test
            .sim
            .client_enode_url(self.test.suite_id, self.test.test_id, &self.container)
            .await
    }

    /// Stops the container before the test ends.
    pub async fn stop(&self) -> Result<()> {
        self.test
            .sim
            .stop_client(self.test.suite_id, self.test.test_id, &self.container)
            .await?;
        self.test.ctx.forget_client(&self.container);
        Ok(())
    }
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
struct TestLog {
    output: String,
    outcome: Outcome,
    spec_only: bool,
    cleanups: Vec<(String, Cleanup)>,
}

struct TestState {
    log: Mutex<TestLog>,
    cancel: CancellationToken,
}

/// A running test
#[derive(Clone)]
pub struct Test {
    pub sim: Simulation,
    pub suite_id: SuiteID,
    pub test_id: TestID,
    pub name: String,
    ctx: Arc<SuiteContext>,
    state: Arc<TestState>,
}

impl Debug for Test {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Test")
            .field("suite_id", &self.suite_id)
            .field("test_id", &self.test_id)
            .field("name", &self.name)
            .finish()
    }
}

impl Test {
    pub(crate) fn new(ctx: Arc<SuiteContext>, test_id: TestID, name: String) -> Self {
        Self {
            sim: ctx.sim.clone(),
            suite_id: ctx.suite_id,
            test_id,
            name,
            state: Arc::new(TestState {
                log: Mutex::new(TestLog::default()),
                cancel: ctx.cancel.child_token(),
            }),
            ctx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TestLog> {
        self.state.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a line to the test log.
    pub fn log(&self, msg: impl Display) {
        let line = msg.to_string();
        info!(test = self.test_id, "{line}");
        let mut log = self.lock();
        log.output.push_str(&line);
        if !line.ends_with('\n') {
            log.output.push('\n');
        }
    }

    /// Records a failure and keeps going.
    pub fn error(&self, msg: impl Display) {
        self.log(msg);
        self.fail(Outcome::Failed);
    }

    /// Records a failure and leaves the test body.
    pub fn fatal(&self, msg: impl Display) -> ! {
        self.error(msg);
        std::panic::panic_any(Fatal)
    }

    /// Marks the test as errored rather than failed: the test could not be
    /// carried out at all.
    pub fn errored(&self, msg: impl Display) {
        self.log(msg);
        self.fail(Outcome::Errored);
    }

    fn fail(&self, outcome: Outcome) {
        let mut log = self.lock();
        log.outcome = log.outcome.merge(outcome);
    }

    pub fn failed(&self) -> bool {
        !self.lock().outcome.is_pass()
    }

    pub fn outcome(&self) -> Outcome {
        self.lock().outcome
    }

    /// Everything logged so far.
    pub fn output(&self) -> String {
        self.lock().output.clone()
    }

    /// A failure of this test is reported but does not fail the run.
    pub fn mark_spec_only(&self) {
        self.lock().spec_only = true;
    }

    pub fn is_spec_only(&self) -> bool {
        self.lock().spec_only
    }

    /// Token cancelled when the suite is torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.state.cancel.cancelled().await
    }

    /// Registers a release action. Actions run in reverse order once the
    /// body is done, however it ended.
    pub fn add_cleanup<F, Fut>(&self, label: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cleanup: Cleanup = Box::new(move || Box::pin(f()));
        self.lock().cleanups.push((label.into(), cleanup));
    }

    pub(crate) async fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut self.lock().cleanups);
        for (label, cleanup) in cleanups.into_iter().rev() {
            if let Err(err) = cleanup().await {
                warn!(test = self.test_id, %label, %err, "cleanup failed");
            }
        }
    }

    /// Describes the result to report to the host. Passing tests carry no
    /// details, failing ones carry their whole log.
    pub fn result(&self) -> TestResult {
        let log = self.lock();
        let pass = log.outcome.is_pass();
        TestResult {
            pass,
            details: if pass {
                String::new()
            } else {
                log.output.clone()
            },
        }
    }

    pub(crate) fn report(&self) -> TestReport {
        let log = self.lock();
        TestReport {
            name: self.name.clone(),
            outcome: log.outcome,
            spec_only: log.spec_only,
        }
    }

    /// Starts a client instance. If the client cannot be started, the test
    /// fails immediately.
    pub async fn start_client(&self, client_type: &str, options: ClientOptions) -> Client {
        match self.try_start_client(client_type, options).await {
            Ok(client) => client,
            Err(err) => self.fatal(format!("can't launch node (type {client_type}): {err}")),
        }
    }

    /// Starts a client instance that is stopped automatically when the test ends.
    pub async fn try_start_client(
        &self,
        client_type: &str,
        options: ClientOptions,
    ) -> Result<Client> {
        let (container, ip) = self
            .sim
            .start_client(self.suite_id, self.test_id, client_type, &options)
            .await?;
        self.ctx.track_client(&container, client_type, self.test_id);

        let (sim, ctx, suite_id, test_id, id) = (
            self.sim.clone(),
            self.ctx.clone(),
            self.suite_id,
            self.test_id,
            container.clone(),
        );
        self.add_cleanup(format!("stop {container}"), move || async move {
            if !ctx.is_running(&id) {
                return Ok(());
            }
            ctx.forget_client(&id);
            sim.stop_client(suite_id, test_id, &id).await
        });

        let rpc = HttpClientBuilder::default()
            .request_timeout(RPC_TIMEOUT)
            .build(format!("http://{}:{}", ip, RPC_PORT))
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Client {
            kind: client_type.to_string(),
            container,
            ip,
            rpc,
            test: self.clone(),
        })
    }

    /// Creates a network that is removed at the end of the suite if the test
    /// does not remove it.
    pub async fn create_network(&self, network: &str) -> Result<()> {
        self.sim.create_network(self.suite_id, network).await?;
        self.ctx.track_network(network);
        Ok(())
    }

    pub async fn remove_network(&self, network: &str) -> Result<()> {
        self.sim.remove_network(self.suite_id, network).await?;
        self.ctx.forget_network(network);
        Ok(())
    }

    pub async fn connect_container(&self, network: &str, container: &str) -> Result<()> {
        self.sim
            .connect_container(self.suite_id, network, container)
            .await?;
        self.ctx.track_member(network, container);
        Ok(())
    }

    pub async fn disconnect_container(&self, network: &str, container: &str) -> Result<()> {
        self.sim
            .disconnect_container(self.suite_id, network, container)
            .await?;
        self.ctx.forget_member(network, container);
        Ok(())
    }

    pub async fn container_network_ip(&self, network: &str, container: &str) -> Result<IpAddr> {
        self.sim
            .container_network_ip(self.suite_id, network, container)
            .await
    }

    /// Runs a subtest of this test and waits for it. A failing subtest fails
    /// this test too, unless it was marked spec-only.
    pub async fn run(&self, spec: impl Testable) -> Outcome {
        let reports = self.run_subtests(&spec).await;
        let mut outcome = Outcome::Passed;
        for report in &reports {
            if !report.outcome.is_pass() && !report.spec_only {
                self.error(format!("subtest {:?} failed", report.name));
            }
            outcome = outcome.merge(report.outcome);
        }
        outcome
    }

    /// Like `run`, but a failing subtest leaves this test's result alone.
    pub async fn run_isolated(&self, spec: impl Testable) -> Outcome {
        self.run_subtests(&spec)
            .await
            .iter()
            .fold(Outcome::Passed, |acc, r| acc.merge(r.outcome))
    }

    async fn run_subtests(&self, spec: &dyn Testable) -> Vec<TestReport> {
        let mut reports = vec![];
        for test in spec.expand(&self.ctx.clients) {
            if !self.ctx.should_run(test.as_ref()) {
                continue;
            }
            reports.extend(test.run_test(self.ctx.clone()).await);
        }
        reports
    }
}

#[derive(Clone)]
pub struct TestSpec<D = ()> {
    // These fields are displayed in the UI. Be sure to add
    // a meaningful description here.
    pub name: String,
    pub description: String,
    // If AlwaysRun is true, the test will run even if Name does not match the test
    // pattern. This option is useful for tests that launch a client instance and
    // then perform further tests against it.
    pub always_run: bool,
    // The Run function is invoked when the test executes.
    pub run: AsyncTestFunc<D>,
    pub data: D,
}

struct TestBody<D> {
    run: AsyncTestFunc<D>,
    data: D,
}

#[async_trait]
impl<D: Send + Sync + 'static> Body for TestBody<D> {
    async fn call(self, test: &mut Test) {
        (self.run)(test, self.data).await
    }
}

#[async_trait]
impl<D: Clone + Send + Sync + 'static> Testable for TestSpec<D> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    fn expand(&self, _clients: &[ClientDefinition]) -> Vec<Box<dyn Testable>> {
        vec![Box::new(self.clone())]
    }

    async fn run_test(&self, ctx: Arc<SuiteContext>) -> Vec<TestReport> {
        let body = TestBody {
            run: self.run,
            data: self.data.clone(),
        };
        vec![execute(&ctx, self.name.clone(), &self.description, body).await]
    }
}

/// A test that runs once per client type carrying the given role. Each copy
/// starts its client before the body runs.
#[derive(Clone)]
pub struct ClientTestSpec<D = ()> {
    pub name: String,
    pub description: String,
    pub always_run: bool,
    /// Only client types with this role. `None` selects every client type.
    pub role: Option<String>,
    pub options: ClientOptions,
    pub run: AsyncClientTestFunc<D>,
    pub data: D,
    /// Set once the spec has been bound to a client type.
    pub client: Option<String>,
}

impl<D: Clone> ClientTestSpec<D> {
    /// Binds the spec to one client type.
    pub fn for_client(&self, client_type: &str) -> Self {
        let mut spec = self.clone();
        spec.name = client_test_name(&self.name, client_type);
        spec.client = Some(client_type.to_string());
        spec
    }
}

struct ClientBody<D> {
    client_type: String,
    options: ClientOptions,
    run: AsyncClientTestFunc<D>,
    data: D,
}

#[async_trait]
impl<D: Send + Sync + 'static> Body for ClientBody<D> {
    async fn call(self, test: &mut Test) {
        let client = test.start_client(&self.client_type, self.options).await;
        (self.run)(test, client, self.data).await
    }
}

#[async_trait]
impl<D: Clone + Send + Sync + 'static> Testable for ClientTestSpec<D> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    fn expand(&self, clients: &[ClientDefinition]) -> Vec<Box<dyn Testable>> {
        if self.client.is_some() {
            return vec![Box::new(self.clone())];
        }
        clients
            .iter()
            .filter(|def| self.role.as_deref().map_or(true, |role| def.has_role(role)))
            .map(|def| Box::new(self.for_client(&def.name)) as Box<dyn Testable>)
            .collect()
    }

    async fn run_test(&self, ctx: Arc<SuiteContext>) -> Vec<TestReport> {
        let Some(client_type) = self.client.clone() else {
            let mut reports = vec![];
            for test in self.expand(&ctx.clients) {
                reports.extend(test.run_test(ctx.clone()).await);
            }
            return reports;
        };
        let body = ClientBody {
            client_type,
            options: self.options.clone(),
            run: self.run,
            data: self.data.clone(),
        };
        vec![execute(&ctx, self.name.clone(), &self.description, body).await]
    }
}

#[derive(Clone)]
pub struct NClientTestSpec<D = ()> {
    /// These fields are displayed in the UI. Be sure to add
    /// a meaningful description here.
    pub name: String,
    pub description: String,
    /// If AlwaysRun is true, the test will run even if Name does not match the test
    /// pattern. This option is useful for tests that launch a client instance and
    /// then perform further tests against it.
    pub always_run: bool,
    /// The Run function is invoked when the test executes.
    pub run: AsyncNClientsTestFunc<D>,
    /// Launch options per client, in the same order as `clients`. Missing
    /// entries use the defaults.
    pub options: Vec<ClientOptions>,
    /// test data which can be passed to the test
    pub data: D,
    pub clients: Vec<ClientDefinition>,
}

struct NClientBody<D> {
    clients: Vec<(String, ClientOptions)>,
    run: AsyncNClientsTestFunc<D>,
    data: D,
}

#[async_trait]
impl<D: Send + Sync + 'static> Body for NClientBody<D> {
    async fn call(self, test: &mut Test) {
        let mut client_vec: Vec<Client> = Vec::with_capacity(self.clients.len());
        for (client_type, options) in self.clients {
            client_vec.push(test.start_client(&client_type, options).await);
        }
        (self.run)(test, client_vec, self.data).await
    }
}

#[async_trait]
impl<D: Clone + Send + Sync + 'static> Testable for NClientTestSpec<D> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    fn expand(&self, _clients: &[ClientDefinition]) -> Vec<Box<dyn Testable>> {
        vec![Box::new(self.clone())]
    }

    async fn run_test(&self, ctx: Arc<SuiteContext>) -> Vec<TestReport> {
        let clients = self
            .clients
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let options = self.options.get(i).cloned().unwrap_or_default();
                (def.name.clone(), options)
            })
            .collect();
        let body = NClientBody {
            clients,
            run: self.run,
            data: self.data.clone(),
        };
        vec![execute(&ctx, self.name.clone(), &self.description, body).await]
    }
}
