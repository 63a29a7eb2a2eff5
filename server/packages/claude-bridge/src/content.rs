//! Flattens Anthropic messages into a single CLI prompt.
//!
//! Base64 media in the final user turn is written to temp files that the CLI
//! can read. The files belong to an [`AttachmentSet`], which deletes them when
//! dropped, so whoever holds the set (a handler or a response stream)
//! controls their lifetime.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use claude_bridge_error::BridgeError;
use tracing::{debug, info, warn};

use crate::messages::{Base64Source, ContentBlockInput, Message, MessageContent, Role};

const TEMP_FILE_PREFIX: &str = "bridge_";

/// Temp files referenced by a prompt. Deleted on drop.
#[derive(Debug, Default)]
pub struct AttachmentSet {
    paths: Vec<PathBuf>,
}

impl AttachmentSet {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn write(&mut self, data: &[u8], extension: &str) -> std::io::Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(extension)
            .tempfile()?;
        file.write_all(data)?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|err| err.error)?;
        self.paths.push(path.clone());
        set_readable(&path)?;
        Ok(path)
    }
}

impl Drop for AttachmentSet {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(file = %path.display(), "Deleted temp file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(file = %path.display(), error = %err, "Failed to delete temp file"),
            }
        }
    }
}

#[cfg(unix)]
fn set_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Prompt text plus the attachments it references.
#[derive(Debug, Default)]
pub struct PromptParts {
    pub prompt: String,
    pub attachments: AttachmentSet,
}

/// Builds the CLI prompt from `messages`.
///
/// Only the last user message contributes attachments. Earlier turns are
/// rendered as `<turn role="...">` entries inside a `<conversation>` block
/// ahead of it. No user message yields an empty prompt.
pub fn messages_to_prompt(messages: &[Message]) -> Result<PromptParts, BridgeError> {
    let Some(last_user) = messages.iter().rposition(|message| message.role == Role::User) else {
        debug!(messages = messages.len(), "No user message; returning empty prompt");
        return Ok(PromptParts::default());
    };

    let (text, attachments) = extract_content(&messages[last_user].content)?;
    if messages.len() == 1 {
        return Ok(PromptParts {
            prompt: text,
            attachments,
        });
    }

    let turns: Vec<String> = messages[..last_user]
        .iter()
        .map(|message| {
            format!(
                "<turn role=\"{}\">{}</turn>",
                message.role.as_str(),
                message.content.text()
            )
        })
        .collect();
    info!(
        total_messages = messages.len(),
        history_turns = turns.len(),
        "Building multi-turn prompt"
    );

    Ok(PromptParts {
        prompt: format!("<conversation>\n{}\n</conversation>\n\n{}", turns.join("\n"), text),
        attachments,
    })
}

fn extract_content(content: &MessageContent) -> Result<(String, AttachmentSet), BridgeError> {
    let blocks = match content {
        MessageContent::Text(text) => return Ok((text.clone(), AttachmentSet::default())),
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut attachments = AttachmentSet::default();
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlockInput::Text { text } => parts.push(text.clone()),
            ContentBlockInput::Image { source } => {
                let path = store_media(&mut attachments, source, "image")?;
                parts.push(format!("[Image: {}]", path.display()));
            }
            ContentBlockInput::Document { source } => {
                let path = store_media(&mut attachments, source, "document")?;
                parts.push(format!("[Document: {}]", path.display()));
            }
        }
    }
    Ok((parts.join("\n"), attachments))
}

fn store_media(
    attachments: &mut AttachmentSet,
    source: &Base64Source,
    block_type: &str,
) -> Result<PathBuf, BridgeError> {
    let media_type = source.media_type;
    if source.source_type != "base64" {
        return Err(BridgeError::invalid_request(format!(
            "Failed to process {block_type}: unsupported source type {}",
            source.source_type
        )));
    }
    if media_type.is_image() != (block_type == "image") {
        return Err(BridgeError::invalid_request(format!(
            "Failed to process {block_type}: unsupported media type {}",
            media_type.as_str()
        )));
    }

    let data = base64::engine::general_purpose::STANDARD
        .decode(source.data.trim())
        .map_err(|err| {
            BridgeError::invalid_request(format!("Failed to process {block_type}: {err}"))
        })?;

    let max_size = media_type.max_size();
    if data.len() > max_size {
        return Err(BridgeError::invalid_request(format!(
            "Failed to process {block_type}: File size ({:.2}MB) exceeds maximum allowed for {} ({:.2}MB)",
            data.len() as f64 / (1024.0 * 1024.0),
            media_type.as_str(),
            max_size as f64 / (1024.0 * 1024.0),
        )));
    }

    let path = attachments
        .write(&data, media_type.extension())
        .map_err(|err| BridgeError::Stream {
            message: format!("Failed to write {block_type} to temp file: {err}"),
        })?;
    debug!(
        file = %path.display(),
        media_type = media_type.as_str(),
        size_bytes = data.len(),
        "Created temp file for {block_type}"
    );
    Ok(path)
}
