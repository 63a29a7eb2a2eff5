//! Typed view of one JSON line emitted by the CLI.
//!
//! The CLI speaks two grammars on stdout. With `--include-partial-messages`
//! it emits `stream_event` records wrapping raw API events; older builds and
//! the buffered path emit whole `assistant` messages. Both reduce to the same
//! [`RecordSignal`]s so consumers never branch on grammar.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    StreamEvent,
    Assistant,
    Result,
    #[default]
    #[serde(other)]
    Other,
}

/// Inner event of a `stream_event` record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart,
    ContentBlockStart {
        #[serde(default)]
        index: u32,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: u32,
        #[serde(default)]
        delta: Delta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Delta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// One decoded stdout record. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DecodedRecord {
    #[serde(rename = "type", default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub event: Option<StreamEvent>,
    #[serde(default)]
    pub message: Option<AssistantMessage>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub is_error: bool,
}

/// Grammar-independent meaning of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSignal {
    /// Text produced by the real-time (partial message) grammar.
    LiveText(String),
    /// Text restated by a buffered `assistant` message.
    BufferedText(String),
    Usage(Usage),
    Error(String),
}

impl DecodedRecord {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// The message carried by a record flagged `is_error`.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error {
            return None;
        }
        Some(
            self.result
                .clone()
                .unwrap_or_else(|| "Unknown CLI error".to_string()),
        )
    }

    pub fn signals(&self) -> Vec<RecordSignal> {
        if let Some(message) = self.error_message() {
            return vec![RecordSignal::Error(message)];
        }

        let mut signals = Vec::new();
        match self.kind {
            RecordKind::StreamEvent => match &self.event {
                Some(StreamEvent::ContentBlockDelta { delta, .. }) => {
                    if let Some(text) = delta.text.as_ref().filter(|text| !text.is_empty()) {
                        signals.push(RecordSignal::LiveText(text.clone()));
                    }
                }
                Some(StreamEvent::MessageDelta { usage: Some(usage) }) => {
                    signals.push(RecordSignal::Usage(*usage));
                }
                _ => {}
            },
            RecordKind::Assistant => {
                if let Some(message) = &self.message {
                    for part in &message.content {
                        if part.kind != "text" {
                            continue;
                        }
                        if let Some(text) = part.text.as_ref().filter(|text| !text.is_empty()) {
                            signals.push(RecordSignal::BufferedText(text.clone()));
                        }
                    }
                    if let Some(usage) = message.usage {
                        signals.push(RecordSignal::Usage(usage));
                    }
                }
            }
            RecordKind::Result | RecordKind::Other => {}
        }

        if let Some(usage) = self.usage {
            signals.push(RecordSignal::Usage(usage));
        }
        signals
    }
}
