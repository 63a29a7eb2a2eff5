use std::path::PathBuf;
use std::time::Duration;

/// Default absolute timeout for non-streaming invocations.
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 300;

/// Default gap allowed between two stdout lines while streaming.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 180;

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Operator-configured tool and directory access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPolicy {
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub allowed_directories: Vec<PathBuf>,
}

/// Immutable settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub cli_path: PathBuf,
    pub cwd: Option<PathBuf>,
    pub policy: ToolPolicy,
    pub process_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("claude"),
            cwd: None,
            policy: ToolPolicy::default(),
            process_timeout: Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS),
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
        }
    }
}
