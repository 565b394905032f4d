//! Version and host metadata reported during the handshake.

use serde::{Deserialize, Serialize};

/// Agent version from Cargo.toml
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Descriptive metadata about the application the agent is embedded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Engine or framework name (e.g. "sim").
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    /// Project or application name, if the host knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Version of the embedded agent.
    pub agent_version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            engine: "unknown".to_string(),
            engine_version: None,
            project: None,
            agent_version: AGENT_VERSION.to_string(),
        }
    }
}

impl HostInfo {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            ..Self::default()
        }
    }

    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = Some(version.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}
