use claude_bridge_cli_runner::RecordStream;
use claude_bridge_error::BridgeError;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::messages::{MessagesResponse, Usage};

/// Folds a finite record stream into one non-streaming response.
///
/// The last record carrying `result` supplies the text and the last record
/// carrying `usage` supplies the counts. Zero records is an empty reply.
pub async fn aggregate(mut records: RecordStream, model: &str) -> Result<MessagesResponse, BridgeError> {
    let mut text = String::new();
    let mut usage = Usage::default();

    while let Some(record) = records.next().await {
        let record = record?;
        if let Some(message) = record.error_message() {
            warn!(error = %message, "CLI error flagged in response");
            return Err(BridgeError::CliReported { message });
        }
        if let Some(result) = record.result {
            text = result;
        }
        if let Some(reported) = record.usage {
            usage = Usage {
                input_tokens: reported.input_tokens.unwrap_or(0),
                output_tokens: reported.output_tokens.unwrap_or(0),
            };
        }
    }

    debug!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        content_len = text.len(),
        "Assembled non-streaming response"
    );
    Ok(MessagesResponse::end_turn(model, text, usage))
}
