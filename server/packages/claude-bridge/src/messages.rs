//! Anthropic Messages API request and response bodies.

use claude_bridge_error::BridgeError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;

pub const STOP_REASON_END_TURN: &str = "end_turn";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    Webp,
    #[serde(rename = "application/pdf")]
    Pdf,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
            Self::Gif => ".gif",
            Self::Webp => ".webp",
            Self::Pdf => ".pdf",
        }
    }

    /// Largest decoded payload accepted for this media type.
    pub fn max_size(&self) -> usize {
        match self {
            Self::Pdf => 32 * 1024 * 1024,
            _ => 5 * 1024 * 1024,
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, Self::Pdf)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct Base64Source {
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: String,
    pub media_type: MediaType,
    pub data: String,
}

fn default_source_type() -> String {
    "base64".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockInput {
    Text { text: String },
    Image { source: Base64Source },
    Document { source: Base64Source },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlockInput>),
}

impl MessageContent {
    /// Text blocks joined by newlines; media blocks are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlockInput::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct SystemBlock {
    pub text: String,
}

/// `system` may be a plain string or a list of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema, ToSchema)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Object>>)]
    pub tools: Option<Vec<Value>>,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl MessagesRequest {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.max_tokens < 1 {
            return Err(BridgeError::invalid_request("max_tokens must be at least 1"));
        }
        for (name, value) in [("temperature", self.temperature), ("top_p", self.top_p)] {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(BridgeError::invalid_request(format!(
                        "{name} must be between 0.0 and 1.0"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|tools| !tools.is_empty())
    }

    /// Sampling parameters the CLI cannot honour, rendered for logging.
    pub fn ignored_parameters(&self) -> Vec<String> {
        let mut ignored = Vec::new();
        if let Some(value) = self.temperature {
            ignored.push(format!("temperature={value}"));
        }
        if let Some(value) = self.top_p {
            ignored.push(format!("top_p={value}"));
        }
        if let Some(value) = self.top_k {
            ignored.push(format!("top_k={value}"));
        }
        if let Some(stops) = self.stop_sequences.as_ref().filter(|stops| !stops.is_empty()) {
            ignored.push(format!("stop_sequences={stops:?}"));
        }
        ignored
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct ResponseContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ResponseContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    pub fn end_turn(model: impl Into<String>, text: impl Into<String>, usage: Usage) -> Self {
        Self {
            id: new_message_id(),
            kind: "message".to_string(),
            role: Role::Assistant,
            content: vec![ResponseContentBlock {
                kind: "text".to_string(),
                text: text.into(),
            }],
            model: model.into(),
            stop_reason: Some(STOP_REASON_END_TURN.to_string()),
            stop_sequence: None,
            usage,
        }
    }
}

/// `msg_` followed by 24 lowercase hex characters.
pub fn new_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..24])
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub cli_available: bool,
    pub cli_version: Option<String>,
}
