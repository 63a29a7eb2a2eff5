use std::path::PathBuf;
use std::time::Duration;

use claude_bridge_cli_runner::config::{
    DEFAULT_KILL_GRACE_SECS, DEFAULT_PROCESS_TIMEOUT_SECS, DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
};
use claude_bridge_cli_runner::{RunnerConfig, ToolPolicy};

pub const SERVICE_NAME: &str = "Claude Bridge";

/// Server settings, fixed at startup and shared read-only by every request.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub claude_cli_path: PathBuf,
    pub claude_cwd: Option<PathBuf>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub allowed_directories: Vec<PathBuf>,
    pub process_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub kill_grace: Duration,
    /// Required in `x-api-key` or a bearer token when set.
    pub api_key: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            claude_cli_path: PathBuf::from("claude"),
            claude_cwd: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            allowed_directories: Vec::new(),
            process_timeout: Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS),
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
            api_key: None,
        }
    }
}

impl BridgeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            cli_path: self.claude_cli_path.clone(),
            cwd: self.claude_cwd.clone(),
            policy: ToolPolicy {
                allowed_tools: self.allowed_tools.clone(),
                disallowed_tools: self.disallowed_tools.clone(),
                allowed_directories: self.allowed_directories.clone(),
            },
            process_timeout: self.process_timeout,
            stream_idle_timeout: self.stream_idle_timeout,
            kill_grace: self.kill_grace,
        }
    }
}

/// Splits a comma-separated setting, dropping blank entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
