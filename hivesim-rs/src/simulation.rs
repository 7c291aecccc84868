use crate::config::{HiveEnv, DEFAULT_PARALLELISM};
use crate::error::{Error, Result};
use crate::options::{ClientOptions, FileCache};
use crate::types::{
    ClientDefinition, ErrorResponse, ExecInfo, ExecRequest, NodeConfig, StartNodeResponse,
    SuiteID, TestID, TestRequest, TestResult,
};
use crate::utils::jitter;
use crate::TestMatcher;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Wraps the simulation HTTP API provided by hive.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub url: String,
    pub test_matcher: Option<TestMatcher>,
    pub parallelism: usize,
    http: reqwest::Client,
    files: FileCache,
}

impl Simulation {
    /// Looks up the hive host URI and the run settings in the environment.
    pub fn from_env() -> Result<Self> {
        let env = HiveEnv::from_env()?;
        Ok(Self::from_settings(&env))
    }

    pub fn from_settings(env: &HiveEnv) -> Self {
        let mut sim = Self::new_at(&env.simulator_url).with_parallelism(env.parallelism);
        if let Some(pattern) = &env.test_pattern {
            if let Err(err) = sim.set_test_pattern(pattern) {
                warn!(%pattern, %err, "ignoring invalid HIVE_TEST_PATTERN");
            }
        }
        sim
    }

    /// Creates a simulation talking to the given host URL.
    pub fn new_at(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            test_matcher: None,
            parallelism: DEFAULT_PARALLELISM,
            http: reqwest::Client::new(),
            files: FileCache::new(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn set_test_pattern(&mut self, pattern: &str) -> Result<()> {
        self.test_matcher = if pattern.is_empty() {
            None
        } else {
            Some(TestMatcher::new(pattern)?)
        };
        Ok(())
    }

    /// Returns the regular expressions for selecting suites and tests.
    pub fn test_pattern(&self) -> (String, String) {
        match &self.test_matcher {
            Some(m) => (m.suite.as_str().to_string(), m.test.as_str().to_string()),
            None => (String::new(), String::new()),
        }
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.files
    }

    pub async fn start_suite(&self, name: &str, description: &str) -> Result<SuiteID> {
        let url = format!("{}/testsuite", self.url);
        let body = TestRequest {
            name: name.to_string(),
            description: description.to_string(),
        };
        let resp = self.send(self.http.post(url).json(&body)).await?;
        Ok(resp.json::<SuiteID>().await?)
    }

    pub async fn end_suite(&self, test_suite: SuiteID) -> Result<()> {
        let url = format!("{}/testsuite/{}", self.url, test_suite);
        self.idempotent(|| self.http.delete(&url)).await?;
        Ok(())
    }

    /// Starts a new test case, returning the testcase id as a context identifier
    pub async fn start_test(
        &self,
        test_suite: SuiteID,
        name: &str,
        description: &str,
    ) -> Result<TestID> {
        let url = format!("{}/testsuite/{}/test", self.url, test_suite);
        let body = TestRequest {
            name: name.to_string(),
            description: description.to_string(),
        };
        let resp = self.send(self.http.post(url).json(&body)).await?;
        Ok(resp.json::<TestID>().await?)
    }

    /// Finishes the test case, cleaning up everything, logging results, and returning
    /// an error if the process could not be completed.
    pub async fn end_test(
        &self,
        test_suite: SuiteID,
        test: TestID,
        test_result: &TestResult,
    ) -> Result<()> {
        let url = format!("{}/testsuite/{}/test/{}", self.url, test_suite, test);
        self.send(self.http.post(url).json(test_result)).await?;
        Ok(())
    }

    /// Starts a new node (or other container).
    /// Returns container id and ip.
    pub async fn start_client(
        &self,
        test_suite: SuiteID,
        test: TestID,
        client_type: &str,
        options: &ClientOptions,
    ) -> Result<(String, IpAddr)> {
        let url = format!("{}/testsuite/{}/test/{}/node", self.url, test_suite, test);

        let config = NodeConfig {
            client: client_type.to_string(),
            networks: options.networks.clone(),
            environment: options.params.clone().into_env(),
        };
        let mut form = Form::new().text("config", serde_json::to_string(&config)?);
        for (path, source) in &options.files {
            let content = self.files.resolve(source).await?;
            let len = content.len() as u64;
            let part = Part::stream_with_length(content, len).file_name(base_name(path));
            form = form.part(path.clone(), part);
        }

        let resp = match self.send(self.http.post(url).multipart(form)).await {
            Ok(resp) => resp,
            Err(Error::Contract { status, message }) if status >= 500 => {
                return Err(Error::ClientStartup(message))
            }
            Err(err) => return Err(err),
        };

        let text = resp.text().await?;
        let node = serde_json::from_str::<StartNodeResponse>(&text)
            .ok()
            .or_else(|| StartNodeResponse::from_text(&text))
            .ok_or_else(|| Error::ClientStartup(format!("invalid start response {text:?}")))?;
        let ip = IpAddr::from_str(&node.ip)
            .map_err(|_| Error::ClientStartup(format!("no IP address returned for {}", node.id)))?;

        debug!(client = client_type, container = %node.id, %ip, "client started");
        Ok((node.id, ip))
    }

    /// Signals to the host that the node is no longer required.
    pub async fn stop_client(
        &self,
        test_suite: SuiteID,
        test: TestID,
        container: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/testsuite/{}/test/{}/node/{}",
            self.url, test_suite, test, container
        );
        self.idempotent(|| self.http.delete(&url)).await?;
        Ok(())
    }

    /// Runs a command in a running client.
    pub async fn client_exec(
        &self,
        test_suite: SuiteID,
        test: TestID,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecInfo> {
        let url = format!(
            "{}/testsuite/{}/test/{}/node/{}/exec",
            self.url, test_suite, test, container
        );
        let resp = self
            .send(self.http.post(url).json(&ExecRequest { command }))
            .await?;
        Ok(resp.json::<ExecInfo>().await?)
    }

    /// Returns the enode URL of a running client.
    pub async fn client_enode_url(
        &self,
        test_suite: SuiteID,
        test: TestID,
        container: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/testsuite/{}/test/{}/node/{}/enode",
            self.url, test_suite, test, container
        );
        let enode = self.get_text(&url).await?;
        if !enode.starts_with("enode://") {
            return Err(Error::Contract {
                status: 200,
                message: format!("invalid enode URL {enode:?}"),
            });
        }
        Ok(enode)
    }

    /// Asks the host to create a docker network by the given name.
    pub async fn create_network(&self, test_suite: SuiteID, network: &str) -> Result<()> {
        let url = format!("{}/testsuite/{}/network/{}", self.url, test_suite, network);
        self.send(self.http.post(url)).await?;
        Ok(())
    }

    pub async fn remove_network(&self, test_suite: SuiteID, network: &str) -> Result<()> {
        let url = format!("{}/testsuite/{}/network/{}", self.url, test_suite, network);
        self.idempotent(|| self.http.delete(&url)).await?;
        Ok(())
    }

    pub async fn connect_container(
        &self,
        test_suite: SuiteID,
        network: &str,
        container: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/testsuite/{}/network/{}/{}",
            self.url, test_suite, network, container
        );
        self.send(self.http.post(url)).await?;
        Ok(())
    }

    pub async fn disconnect_container(
        &self,
        test_suite: SuiteID,
        network: &str,
        container: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/testsuite/{}/network/{}/{}",
            self.url, test_suite, network, container
        );
        self.idempotent(|| self.http.delete(&url)).await?;
        Ok(())
    }

    /// Returns the IP address of a container on the given network. The container
    /// id "simulation" resolves to the simulator's own address.
    pub async fn container_network_ip(
        &self,
        test_suite: SuiteID,
        network: &str,
        container: &str,
    ) -> Result<IpAddr> {
        let url = format!(
            "{}/testsuite/{}/network/{}/{}",
            self.url, test_suite, network, container
        );
        let ip = self.get_text(&url).await?;
        IpAddr::from_str(&ip).map_err(|_| Error::Contract {
            status: 200,
            message: format!("invalid IP address {ip:?}"),
        })
    }

    /// Returns all client types available to this simulator run. This depends on
    /// both the available client set and the command line filters.
    pub async fn client_types(&self) -> Result<Vec<ClientDefinition>> {
        let url = format!("{}/clients", self.url);
        self.get_json(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.idempotent(|| self.http.get(url)).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Reads a text response that may or may not be JSON-quoted.
    async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.idempotent(|| self.http.get(url)).await?;
        let text = resp.text().await?;
        Ok(serde_json::from_str::<String>(&text)
            .unwrap_or(text)
            .trim()
            .to_string())
    }

    /// Sends a request that is safe to repeat. Transport failures get one more
    /// attempt after a short randomized pause.
    async fn idempotent<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        match self.send(build()).await {
            Err(err) if err.is_retryable() => {
                let delay = jitter();
                debug!(%err, ?delay, "retrying host request");
                tokio::time::sleep(delay).await;
                self.send(build()).await
            }
            other => other,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let resp = request.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(decode_error(resp).await)
    }
}

async fn decode_error(resp: Response) -> Error {
    let status = resp.status().as_u16();
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    let body = resp.bytes().await.unwrap_or_default();

    let message = if is_json {
        match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(e) => e.error,
            Err(err) => format!("can't decode error message: {err}"),
        }
    } else {
        String::from_utf8_lossy(&body[..body.len().min(1024)])
            .trim()
            .to_string()
    };
    Error::Contract { status, message }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
