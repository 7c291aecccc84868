use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type SuiteID = u32;
pub type TestID = u32;

/// StartNodeReponse is returned by the client startup endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartNodeResponse {
    pub id: String, // Container ID.
    pub ip: String, // IP address in bridge network
}

impl StartNodeResponse {
    /// Older hosts answer with plain text in the form `container-id@ip@mac`.
    pub fn from_text(text: &str) -> Option<Self> {
        let mut parts = text.trim().trim_matches('"').split('@');
        let id = parts.next().filter(|id| !id.is_empty())?;
        let ip = parts.next().filter(|ip| !ip.is_empty())?;
        Some(Self {
            id: id.to_string(),
            ip: ip.to_string(),
        })
    }
}

// ClientMetadata is part of the ClientDefinition and lists metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default)]
    pub roles: Vec<String>,
}

// ClientDefinition is served by the /clients API endpoint to list the available clients
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientDefinition {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub meta: ClientMetadata,
}

impl ClientDefinition {
    pub fn has_role(&self, role: &str) -> bool {
        self.meta.roles.iter().any(|r| r == role)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRequest {
    pub name: String,
    pub description: String,
}

/// Describes the outcome of a test.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub pass: bool,
    pub details: String,
}

/// Terminal state of a test. The host only distinguishes pass and fail,
/// `Errored` is kept for the summary and the exit code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Outcome {
    #[default]
    Passed,
    Failed,
    Errored,
}

impl Outcome {
    pub fn is_pass(self) -> bool {
        self == Outcome::Passed
    }

    /// Keeps the worse of the two outcomes.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Errored, _) | (_, Outcome::Errored) => Outcome::Errored,
            (Outcome::Failed, _) | (_, Outcome::Failed) => Outcome::Failed,
            _ => Outcome::Passed,
        }
    }
}

/// Client container configuration sent as the `config` field of the
/// multipart start request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub client: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    pub environment: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

/// Result of a command executed inside a client container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecInfo {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

/// Error body returned by the host API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
