//! Argument vector and stdin payload for a single CLI invocation.

use std::path::{Path, PathBuf};

use claude_bridge_error::BridgeError;

use crate::config::ToolPolicy;

const PERMISSION_MODE: &str = "bypassPermissions";

/// What the caller wants from one CLI run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationSpec {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub allowed_directories: Vec<PathBuf>,
    pub stream: bool,
    /// Files owned by the caller; only their paths are referenced here.
    pub attachments: Vec<PathBuf>,
}

impl InvocationSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Arguments (without the binary path) plus the text written to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCommand {
    pub args: Vec<String>,
    pub stdin: String,
}

/// Builds the CLI command for `spec`.
///
/// The operator's allow-lists only apply to requests carrying attachments;
/// otherwise just the caller's own entries are passed. Deny-lists always
/// merge both sources. Attachments require both an allow-list and at least
/// one allowed directory; otherwise this fails before anything is spawned.
pub fn build_command(policy: &ToolPolicy, spec: &InvocationSpec) -> Result<CliCommand, BridgeError> {
    let has_attachments = !spec.attachments.is_empty();
    let (policy_tools, policy_dirs): (&[String], &[PathBuf]) = if has_attachments {
        (
            policy.allowed_tools.as_slice(),
            policy.allowed_directories.as_slice(),
        )
    } else {
        (&[], &[])
    };

    let allowed_tools: Vec<&str> = policy_tools
        .iter()
        .chain(spec.allowed_tools.iter())
        .map(String::as_str)
        .collect();
    let disallowed_tools: Vec<&str> = policy
        .disallowed_tools
        .iter()
        .chain(spec.disallowed_tools.iter())
        .map(String::as_str)
        .collect();
    let directories: Vec<&PathBuf> = policy_dirs
        .iter()
        .chain(spec.allowed_directories.iter())
        .collect();

    if has_attachments {
        if allowed_tools.is_empty() {
            return Err(BridgeError::configuration(
                "File upload attempted but CLAUDE_ALLOWED_TOOLS_STR not configured. \
                 Set CLAUDE_ALLOWED_TOOLS_STR=Read in your .env file to enable file upload.",
            ));
        }
        if directories.is_empty() {
            return Err(BridgeError::configuration(
                "File upload attempted but CLAUDE_ALLOWED_DIRECTORIES_STR not configured. \
                 Set CLAUDE_ALLOWED_DIRECTORIES_STR=/tmp (or your temp directory) in your .env file.",
            ));
        }
    }

    let mut args: Vec<String> = vec![
        "--print".to_string(),
        "--permission-mode".to_string(),
        PERMISSION_MODE.to_string(),
    ];

    if spec.stream {
        args.extend(
            [
                "--verbose",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
            ]
            .map(String::from),
        );
    } else {
        args.extend(["--output-format", "json"].map(String::from));
    }

    if let Some(model) = &spec.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if let Some(system_prompt) = &spec.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.clone());
    }

    if !allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(allowed_tools.join(" "));
    }

    if !disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(disallowed_tools.join(" "));
    }

    for dir in directories {
        args.push("--add-dir".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }

    Ok(CliCommand {
        args,
        stdin: prompt_with_attachments(&spec.prompt, &spec.attachments),
    })
}

/// Prefixes the prompt with one read instruction per attachment.
fn prompt_with_attachments(prompt: &str, attachments: &[PathBuf]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let instructions: Vec<String> = attachments
        .iter()
        .map(|path| {
            format!(
                "Please use your Read tool to analyze this file: {}",
                absolute(path).display()
            )
        })
        .collect();
    format!("{}\n\n{}", instructions.join("\n\n"), prompt)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
