use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::capabilities::ToolCategories;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// CLI agent registration
// ---------------------------------------------------------------------------

/// One launchable CLI assistant. `register_command` may contain `{url}`,
/// replaced with the server's MCP endpoint before the line is sent to the
/// worker's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliAgentSpec {
    pub id: String,
    pub launch_command: String,
    pub register_command: String,
}

fn default_cli_agents() -> Vec<CliAgentSpec> {
    vec![CliAgentSpec {
        id: "claude".to_string(),
        launch_command: "claude".to_string(),
        register_command: "claude mcp add foreman {url}".to_string(),
    }]
}

fn default_cli_agent_id() -> String {
    "claude".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_grace_period_minutes() -> i64 {
    10
}

fn default_tool_categories() -> ToolCategories {
    ToolCategories::full()
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Persisted configuration, stored as JSON at `<project>/.agent/config.json`.
/// Environment variables only fill gaps the file leaves open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub project_dir: PathBuf,
    /// Name of the operator's own tmux session, when assistance requests
    /// should be pushed at it. Unset means store-only delivery.
    pub admin_session: Option<String>,
    pub embedding_provider: String,
    pub embedding_dimension: usize,
    /// Base URL override for the embedding provider (self-hosted gateways).
    pub embedding_api_base: Option<String>,
    pub cli_agents: Vec<CliAgentSpec>,
    pub default_cli_agent: String,
    pub tool_categories: ToolCategories,
    /// Named capability presets kept purely as hints for config tooling.
    pub presets: HashMap<String, ToolCategories>,
    pub grace_period_minutes: i64,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            project_dir: PathBuf::from("."),
            admin_session: None,
            embedding_provider: default_embedding_provider(),
            embedding_dimension: default_embedding_dimension(),
            embedding_api_base: None,
            cli_agents: default_cli_agents(),
            default_cli_agent: default_cli_agent_id(),
            tool_categories: default_tool_categories(),
            presets: HashMap::new(),
            grace_period_minutes: default_grace_period_minutes(),
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Load config for a project, falling back to defaults when the file
    /// does not exist, then applying environment overrides.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let project_dir = project_dir.into();
        let path = Self::config_path_for(&project_dir);
        let mut config = if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            serde_json::from_str::<ServerConfig>(&text)
                .map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            ServerConfig::default()
        };
        config.project_dir = project_dir;
        config.apply_env();
        config.tool_categories = config.tool_categories.clone().normalized();
        Ok(config)
    }

    /// Environment fallbacks: `PORT`, `FM_DEBUG`, `EMBEDDING_PROVIDER`,
    /// `EMBEDDING_DIMENSION`.
    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if std::env::var("FM_DEBUG").map(|v| v == "1" || v == "true").unwrap_or(false) {
            self.debug = true;
        }
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            if !provider.is_empty() {
                self.embedding_provider = provider;
            }
        }
        if let Ok(dim) = std::env::var("EMBEDDING_DIMENSION") {
            if let Ok(dim) = dim.parse() {
                self.embedding_dimension = dim;
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn agent_dir(&self) -> PathBuf {
        self.project_dir.join(".agent")
    }

    pub fn db_path(&self) -> PathBuf {
        self.agent_dir().join("foreman.db")
    }

    pub fn config_path(&self) -> PathBuf {
        Self::config_path_for(&self.project_dir)
    }

    fn config_path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(".agent").join("config.json")
    }

    /// The CLI agent workers are launched with.
    pub fn cli_agent(&self) -> Option<&CliAgentSpec> {
        self.cli_agents.iter().find(|a| a.id == self.default_cli_agent)
    }

    /// The MCP endpoint workers register against.
    pub fn mcp_url(&self) -> String {
        format!("http://127.0.0.1:{}/mcp", self.port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.embedding_dimension, 1536);
        assert_eq!(config.grace_period_minutes, 10);
        assert!(config.cli_agent().is_some());
        assert!(config.mcp_url().ends_with("/mcp"));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.project_dir, dir.path());
        assert_eq!(config.port, 8765);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::load(dir.path()).unwrap();
        config.port = 9191;
        config.admin_session = Some("operator".into());
        config.save().unwrap();

        let reloaded = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.port, 9191);
        assert_eq!(reloaded.admin_session.as_deref(), Some("operator"));
    }

    #[test]
    fn partial_file_fills_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join(".agent");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join("config.json"), "{\"port\": 5000}").unwrap();

        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.embedding_provider, "openai");
        // basic stays forced on even if the file said otherwise
        assert!(config.tool_categories.basic);
    }
}
