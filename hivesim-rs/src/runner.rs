use crate::testapi::{Body, Suite, Test, Testable};
use crate::types::{ClientDefinition, Outcome, SuiteID, TestID};
use crate::utils::{extract_test_results, install_panic_hook};
use crate::Simulation;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one test as seen by the runner.
#[derive(Clone, Debug)]
pub struct TestReport {
    pub name: String,
    pub outcome: Outcome,
    pub spec_only: bool,
}

/// Counts of finished tests over one or more suites.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub spec_only_failures: usize,
    pub setup_failed: bool,
}

impl RunSummary {
    pub fn record(&mut self, report: &TestReport) {
        match (report.outcome, report.spec_only) {
            (Outcome::Passed, _) => self.passed += 1,
            (_, true) => self.spec_only_failures += 1,
            (Outcome::Failed, false) => self.failed += 1,
            (Outcome::Errored, false) => self.errored += 1,
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.spec_only_failures += other.spec_only_failures;
        self.setup_failed |= other.setup_failed;
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errored + self.spec_only_failures
    }

    /// 0 when everything passed, 1 on test failures, 2 when the simulator
    /// itself could not be set up.
    pub fn exit_code(&self) -> i32 {
        if self.setup_failed {
            2
        } else if self.failed + self.errored > 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunningClient {
    pub client_type: String,
    pub test_id: TestID,
}

/// State shared by every test of a running suite.
pub struct SuiteContext {
    pub sim: Simulation,
    pub suite_id: SuiteID,
    pub name: String,
    /// Client catalog, fetched once when the suite starts.
    pub clients: Vec<ClientDefinition>,
    pub cancel: CancellationToken,
    running: Mutex<HashMap<String, RunningClient>>,
    networks: Mutex<HashMap<String, HashSet<String>>>,
    summary: Mutex<RunSummary>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SuiteContext {
    pub fn new(
        sim: Simulation,
        suite_id: SuiteID,
        name: String,
        clients: Vec<ClientDefinition>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sim,
            suite_id,
            name,
            clients,
            cancel,
            running: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashMap::new()),
            summary: Mutex::new(RunSummary::default()),
        }
    }

    pub fn should_run(&self, test: &dyn Testable) -> bool {
        if test.always_run() {
            return true;
        }
        match &self.sim.test_matcher {
            Some(m) if !m.match_test(&self.name, &test.name()) => {
                debug!(
                    test = %test.name(),
                    pattern = %m.pattern,
                    "skipping test, pattern mismatch"
                );
                false
            }
            _ => true,
        }
    }

    pub(crate) fn track_client(&self, container: &str, client_type: &str, test_id: TestID) {
        lock(&self.running).insert(
            container.to_string(),
            RunningClient {
                client_type: client_type.to_string(),
                test_id,
            },
        );
    }

    pub(crate) fn forget_client(&self, container: &str) {
        lock(&self.running).remove(container);
    }

    pub fn is_running(&self, container: &str) -> bool {
        lock(&self.running).contains_key(container)
    }

    pub fn running_clients(&self) -> HashMap<String, RunningClient> {
        lock(&self.running).clone()
    }

    pub(crate) fn track_network(&self, network: &str) {
        lock(&self.networks).entry(network.to_string()).or_default();
    }

    pub(crate) fn forget_network(&self, network: &str) {
        lock(&self.networks).remove(network);
    }

    pub(crate) fn track_member(&self, network: &str, container: &str) {
        if let Some(members) = lock(&self.networks).get_mut(network) {
            members.insert(container.to_string());
        }
    }

    pub(crate) fn forget_member(&self, network: &str, container: &str) {
        if let Some(members) = lock(&self.networks).get_mut(network) {
            members.remove(container);
        }
    }

    pub(crate) fn record(&self, report: &TestReport) {
        lock(&self.summary).record(report);
    }

    pub fn summary(&self) -> RunSummary {
        lock(&self.summary).clone()
    }

    /// Empties and removes the networks tests left behind.
    async fn remove_networks(&self) {
        let networks = std::mem::take(&mut *lock(&self.networks));
        for (network, members) in networks {
            for container in members {
                if let Err(err) = self
                    .sim
                    .disconnect_container(self.suite_id, &network, &container)
                    .await
                {
                    warn!(%network, %container, %err, "can't disconnect container");
                }
            }
            if let Err(err) = self.sim.remove_network(self.suite_id, &network).await {
                warn!(%network, %err, "can't remove network");
            }
        }
    }
}

/// Registers a test with the host, runs its body on the current task, then
/// runs the cleanups and reports the result. Subtests run the same way,
/// nested inside their parent's body.
pub(crate) async fn execute<B: Body>(
    ctx: &Arc<SuiteContext>,
    name: String,
    description: &str,
    body: B,
) -> TestReport {
    install_panic_hook();

    let test_id = match ctx.sim.start_test(ctx.suite_id, &name, description).await {
        Ok(id) => id,
        Err(err) => {
            error!(test = %name, %err, "can't start test");
            let report = TestReport {
                name,
                outcome: Outcome::Errored,
                spec_only: false,
            };
            ctx.record(&report);
            return report;
        }
    };

    let test = Test::new(ctx.clone(), test_id, name);
    let mut body_test = test.clone();
    let run = AssertUnwindSafe(body.call(&mut body_test)).catch_unwind();

    let finished = tokio::select! {
        res = run => Some(res),
        _ = test.cancelled() => None,
    };
    match finished {
        Some(res) => {
            if let Some(details) = extract_test_results(res) {
                test.error(details);
            }
        }
        None => test.error("test cancelled"),
    }

    test.run_cleanups().await;

    let result = test.result();
    if let Err(err) = ctx.sim.end_test(ctx.suite_id, test_id, &result).await {
        error!(test = %test.name, %err, "can't end test");
    }

    let report = test.report();
    info!(test = %report.name, outcome = ?report.outcome, "test finished");
    ctx.record(&report);
    report
}

/// Runs the given suites and returns the accumulated summary.
pub async fn run_suite(host: Simulation, suites: Vec<Suite>) -> RunSummary {
    run_suite_with_cancel(host, suites, CancellationToken::new()).await
}

/// Like `run_suite`, but cancelling `cancel` aborts running tests and skips
/// the ones not started yet. Every started suite is still ended.
pub async fn run_suite_with_cancel(
    host: Simulation,
    suites: Vec<Suite>,
    cancel: CancellationToken,
) -> RunSummary {
    let mut total = RunSummary::default();

    for suite in suites {
        if let Some(test_match) = &host.test_matcher {
            if !test_match.match_suite(&suite.name) {
                debug!(suite = %suite.name, "skipping suite, pattern mismatch");
                continue;
            }
        }

        let suite_id = match host.start_suite(&suite.name, &suite.description).await {
            Ok(id) => id,
            Err(err) => {
                error!(suite = %suite.name, %err, "can't start suite");
                total.setup_failed = true;
                continue;
            }
        };

        let summary = run_tests(&host, suite_id, &suite, cancel.child_token()).await;

        if let Err(err) = host.end_suite(suite_id).await {
            error!(suite = %suite.name, %err, "can't end suite");
        }
        info!(
            suite = %suite.name,
            passed = summary.passed,
            failed = summary.failed,
            errored = summary.errored,
            spec_only = summary.spec_only_failures,
            "suite finished"
        );
        total.merge(&summary);
    }

    total
}

async fn run_tests(
    host: &Simulation,
    suite_id: SuiteID,
    suite: &Suite,
    cancel: CancellationToken,
) -> RunSummary {
    let mut setup_failed = false;
    let clients = match host.client_types().await {
        Ok(clients) => clients,
        Err(err) => {
            error!(suite = %suite.name, %err, "can't list client types");
            setup_failed = true;
            vec![]
        }
    };

    let ctx = Arc::new(SuiteContext::new(
        host.clone(),
        suite_id,
        suite.name.clone(),
        clients,
        cancel,
    ));

    let (tx, rx) = mpsc::unbounded_channel::<Box<dyn Testable>>();
    let mut queued = 0;
    for spec in &suite.tests {
        for test in spec.expand(&ctx.clients) {
            if ctx.should_run(test.as_ref()) && tx.send(test).is_ok() {
                queued += 1;
            }
        }
    }
    drop(tx);

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let workers = host.parallelism.min(queued).max(1);
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let (ctx, rx) = (ctx.clone(), rx.clone());
        handles.push(tokio::spawn(async move {
            loop {
                let next = { rx.lock().await.recv().await };
                let Some(test) = next else { break };
                if ctx.cancel.is_cancelled() {
                    debug!(worker, test = %test.name(), "suite cancelled, test not started");
                    continue;
                }
                test.run_test(ctx.clone()).await;
            }
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "test worker failed");
        }
    }

    ctx.remove_networks().await;

    let mut summary = ctx.summary();
    summary.setup_failed |= setup_failed;
    summary
}
