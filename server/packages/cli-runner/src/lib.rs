//! Claude CLI invocation: command construction, subprocess lifecycle and
//! decoding of the CLI's line-delimited JSON output.

pub mod command;
pub mod config;
pub mod decoder;
pub mod process;
pub mod record;

pub use command::{build_command, CliCommand, InvocationSpec};
pub use config::{RunnerConfig, ToolPolicy};
pub use process::{ClaudeRunner, RecordStream};
pub use record::{DecodedRecord, RecordSignal, Usage};
