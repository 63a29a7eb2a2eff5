//! Translates CLI records into Anthropic Messages SSE events.
//!
//! The translator is a small state machine over one response:
//!
//! ```text
//! Idle -> Started -> InBlock -> Stopped -> Done
//!            \________________________/
//! ```
//!
//! `message_start` is emitted up front, a single text block at index 0 is
//! opened lazily on the first text, and `content_block_stop`,
//! `message_delta` and `message_stop` close the message once the record
//! stream ends. The CLI's own lifecycle events are only used for their
//! text and usage.

use std::collections::VecDeque;
use std::time::Instant;

use claude_bridge_cli_runner::{DecodedRecord, RecordSignal, RecordStream};
use claude_bridge_error::BridgeError;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::content::AttachmentSet;
use crate::messages::{new_message_id, STOP_REASON_END_TURN};

/// Every response carries exactly one text block.
const CONTENT_INDEX: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorState {
    Idle,
    Started,
    InBlock,
    Stopped,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    MessageStart,
    ContentBlockStart { index: u32 },
    ContentBlockDelta { index: u32, text: String },
    ContentBlockStop { index: u32 },
    MessageDelta { stop_reason: &'static str, output_tokens: u64 },
    MessageStop,
}

impl NormalizedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
        }
    }
}

/// One SSE frame: the event name and its JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent<'a> {
    MessageStart {
        message: WireMessage<'a>,
    },
    ContentBlockStart {
        index: u32,
        content_block: WireTextBlock<'a>,
    },
    ContentBlockDelta {
        index: u32,
        delta: WireTextDelta<'a>,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: WireStop,
        usage: WireOutputUsage,
    },
    MessageStop,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    content: [(); 0],
    model: &'a str,
    stop_reason: Option<&'static str>,
    stop_sequence: Option<&'static str>,
    usage: WireUsage,
}

#[derive(Serialize)]
struct WireTextBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct WireTextDelta<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct WireStop {
    stop_reason: &'static str,
    stop_sequence: Option<&'static str>,
}

#[derive(Serialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Serialize)]
struct WireOutputUsage {
    output_tokens: u64,
}

/// Per-response translation state. Never shared between requests.
#[derive(Debug)]
pub struct StreamTranslator {
    message_id: String,
    model: String,
    state: TranslatorState,
    input_tokens: u64,
    output_tokens: u64,
    /// Text streamed live so far, used to spot buffered restatements.
    live_text: String,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            model: model.into(),
            state: TranslatorState::Idle,
            input_tokens: 0,
            output_tokens: 0,
            live_text: String::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn state(&self) -> TranslatorState {
        self.state
    }

    pub fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn start(&mut self) -> Vec<NormalizedEvent> {
        if self.state != TranslatorState::Idle {
            return Vec::new();
        }
        self.state = TranslatorState::Started;
        vec![NormalizedEvent::MessageStart]
    }

    /// Folds one record into the state and returns the events it produces.
    pub fn push(&mut self, record: &DecodedRecord) -> Result<Vec<NormalizedEvent>, BridgeError> {
        let mut events = self.start();
        for signal in record.signals() {
            match signal {
                RecordSignal::Error(message) => {
                    self.state = TranslatorState::Done;
                    return Err(BridgeError::CliReported { message });
                }
                RecordSignal::LiveText(text) => {
                    self.live_text.push_str(&text);
                    self.push_text(text, &mut events);
                }
                // With partial messages enabled the CLI restates streamed text
                // in a buffered `assistant` record. Only the restatement is
                // dropped; new buffered text is still emitted.
                RecordSignal::BufferedText(text) => {
                    if !self.is_live_restatement(&text) {
                        self.push_text(text, &mut events);
                    }
                }
                RecordSignal::Usage(usage) => {
                    if let Some(input_tokens) = usage.input_tokens {
                        self.input_tokens = input_tokens;
                    }
                    if let Some(output_tokens) = usage.output_tokens {
                        self.output_tokens = output_tokens;
                    }
                }
            }
        }
        Ok(events)
    }

    fn is_live_restatement(&self, text: &str) -> bool {
        !self.live_text.is_empty() && self.live_text.contains(text.trim())
    }

    fn push_text(&mut self, text: String, events: &mut Vec<NormalizedEvent>) {
        if self.state == TranslatorState::Started {
            events.push(NormalizedEvent::ContentBlockStart {
                index: CONTENT_INDEX,
            });
            self.state = TranslatorState::InBlock;
        }
        // Rough count; the CLI's reported usage overwrites it when present.
        self.output_tokens += text.split_whitespace().count() as u64;
        events.push(NormalizedEvent::ContentBlockDelta {
            index: CONTENT_INDEX,
            text,
        });
    }

    /// Closing events once the record stream has ended.
    pub fn finish(&mut self) -> Vec<NormalizedEvent> {
        let mut events = self.start();
        if self.state == TranslatorState::Done {
            return events;
        }
        if self.state == TranslatorState::InBlock {
            events.push(NormalizedEvent::ContentBlockStop {
                index: CONTENT_INDEX,
            });
            self.state = TranslatorState::Stopped;
        }
        events.push(NormalizedEvent::MessageDelta {
            stop_reason: STOP_REASON_END_TURN,
            output_tokens: self.output_tokens,
        });
        events.push(NormalizedEvent::MessageStop);
        self.state = TranslatorState::Done;
        events
    }

    pub fn render(&self, event: &NormalizedEvent) -> SseFrame {
        let wire = match event {
            NormalizedEvent::MessageStart => WireEvent::MessageStart {
                message: WireMessage {
                    id: &self.message_id,
                    kind: "message",
                    role: "assistant",
                    content: [],
                    model: &self.model,
                    stop_reason: None,
                    stop_sequence: None,
                    usage: WireUsage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                },
            },
            NormalizedEvent::ContentBlockStart { index } => WireEvent::ContentBlockStart {
                index: *index,
                content_block: WireTextBlock {
                    kind: "text",
                    text: "",
                },
            },
            NormalizedEvent::ContentBlockDelta { index, text } => WireEvent::ContentBlockDelta {
                index: *index,
                delta: WireTextDelta {
                    kind: "text_delta",
                    text,
                },
            },
            NormalizedEvent::ContentBlockStop { index } => {
                WireEvent::ContentBlockStop { index: *index }
            }
            NormalizedEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => WireEvent::MessageDelta {
                delta: WireStop {
                    stop_reason: *stop_reason,
                    stop_sequence: None,
                },
                usage: WireOutputUsage {
                    output_tokens: *output_tokens,
                },
            },
            NormalizedEvent::MessageStop => WireEvent::MessageStop,
        };
        SseFrame {
            event: event.name(),
            // Serializing plain structs of strings and integers cannot fail.
            data: serde_json::to_string(&wire).unwrap_or_default(),
        }
    }
}

struct Translation {
    translator: StreamTranslator,
    records: RecordStream,
    pending: VecDeque<NormalizedEvent>,
    input_done: bool,
    started: Instant,
    // Dropped with the stream, on completion, error or disconnect.
    _attachments: AttachmentSet,
}

/// Turns a record stream into SSE frames.
///
/// `attachments` lives as long as the returned stream. A record flagged
/// `is_error`, or an orchestrator failure, ends the stream with an `Err`
/// and no `message_stop`.
pub fn translate(
    records: RecordStream,
    model: impl Into<String>,
    attachments: AttachmentSet,
) -> impl Stream<Item = Result<SseFrame, BridgeError>> + Send + 'static {
    let mut translator = StreamTranslator::new(model);
    let pending: VecDeque<NormalizedEvent> = translator.start().into();
    let translation = Translation {
        translator,
        records,
        pending,
        input_done: false,
        started: Instant::now(),
        _attachments: attachments,
    };

    stream::unfold(Some(translation), |state| async move {
        let mut translation = state?;
        loop {
            if let Some(event) = translation.pending.pop_front() {
                let frame = translation.translator.render(&event);
                return Some((Ok(frame), Some(translation)));
            }
            if translation.input_done {
                let (input_tokens, output_tokens) = translation.translator.usage();
                debug!(
                    message_id = translation.translator.message_id(),
                    input_tokens,
                    output_tokens,
                    duration_ms = translation.started.elapsed().as_millis() as u64,
                    "Streaming response complete"
                );
                return None;
            }
            match translation.records.next().await {
                Some(Ok(record)) => match translation.translator.push(&record) {
                    Ok(events) => translation.pending.extend(events),
                    Err(err) => {
                        warn!(error = %err, "Claude CLI reported an error mid-stream");
                        return Some((Err(err), None));
                    }
                },
                Some(Err(err)) => {
                    warn!(error = %err, "Claude CLI stream failed");
                    return Some((Err(err), None));
                }
                None => {
                    let closing = translation.translator.finish();
                    translation.pending.extend(closing);
                    translation.input_done = true;
                }
            }
        }
    })
}
