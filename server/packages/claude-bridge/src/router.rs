use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use claude_bridge_cli_runner::{ClaudeRunner, InvocationSpec};
use claude_bridge_error::{BridgeError, ErrorBody, ErrorDetail, ErrorType};
use futures::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn, Span};
use utoipa::OpenApi;

use crate::aggregate::aggregate;
use crate::config::{BridgeConfig, SERVICE_NAME};
use crate::content::{messages_to_prompt, PromptParts};
use crate::messages::{
    Base64Source, ContentBlockInput, HealthResponse, MediaType, Message, MessageContent,
    MessagesRequest, MessagesResponse, ResponseContentBlock, Role, ServiceInfo, SystemBlock,
    SystemPrompt, Usage,
};
use crate::model::map_model;
use crate::streaming::translate;

#[derive(Debug)]
pub struct AppState {
    config: Arc<BridgeConfig>,
    runner: ClaudeRunner,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        let runner = ClaudeRunner::new(config.runner_config());
        Self {
            config: Arc::new(config),
            runner,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let mut messages_router = Router::new()
        .route("/anthropic/v1/messages", post(create_message))
        .route("/v1/messages", post(create_message))
        .with_state(shared.clone());

    if shared.config.api_key.is_some() {
        messages_router = messages_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .with_state(shared)
        .merge(messages_router)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_root, get_health, create_message),
    components(
        schemas(
            MessagesRequest,
            Message,
            Role,
            MessageContent,
            ContentBlockInput,
            Base64Source,
            MediaType,
            SystemPrompt,
            SystemBlock,
            MessagesResponse,
            ResponseContentBlock,
            Usage,
            ServiceInfo,
            HealthResponse,
            ErrorBody,
            ErrorDetail,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "messages", description = "Anthropic Messages API")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ErrorBody = match &self {
            ApiError::Bridge(err) => err.to_error_body(),
        };
        let status = StatusCode::from_u16(body.error.error_type.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(status = %status, error = %self, "request failed");
        } else {
            warn!(status = %status, error = %self, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = match state.config.api_key.as_deref() {
        Some(key) => key,
        None => return Ok(next.run(req).await),
    };

    if extract_api_key(req.headers()).as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(BridgeError::Unauthorized {
            message: "missing or invalid API key".to_string(),
        }
        .into())
    }
}

/// Reads `x-api-key`, falling back to a bearer token.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|value| value.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(rest.trim().to_string())
    } else {
        None
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service metadata", body = ServiceInfo)),
    tag = "meta"
)]
async fn get_root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers: vec!["anthropic".to_string()],
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Bridge and Claude CLI status", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
///
/// Reports `degraded` when the Claude CLI cannot be executed.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let cli_version = state.runner.version().await;
    let cli_available = cli_version.is_some();
    debug!(cli_available, cli_version = ?cli_version, "Health check");
    Json(HealthResponse {
        status: if cli_available { "healthy" } else { "degraded" }.to_string(),
        service: SERVICE_NAME.to_string(),
        cli_available,
        cli_version,
    })
}

async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new(ErrorType::NotFoundError, "Not Found")),
    )
}

#[utoipa::path(
    post,
    path = "/anthropic/v1/messages",
    request_body = MessagesRequest,
    responses(
        (status = 200, description = "Message, or an SSE stream when `stream` is true", body = MessagesResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 500, description = "Claude CLI failure", body = ErrorBody),
        (status = 504, description = "Claude CLI timed out", body = ErrorBody)
    ),
    tag = "messages"
)]
/// Create Message
///
/// Runs the Claude CLI once for the request. Earlier turns are folded into
/// the prompt; base64 images and PDFs are handed to the CLI as temp files.
async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| BridgeError::invalid_request(rejection.body_text()))?;
    request.validate()?;
    let started = Instant::now();
    debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        max_tokens = request.max_tokens,
        "Incoming messages request"
    );

    let PromptParts {
        prompt,
        attachments,
    } = messages_to_prompt(&request.messages)?;

    if prompt.is_empty() {
        return Err(BridgeError::invalid_request("No user message found in request").into());
    }
    if request.has_tools() {
        return Err(BridgeError::invalid_request(
            "Tools/function calling is not supported. Claude CLI does not support custom tools.",
        )
        .into());
    }

    let ignored = request.ignored_parameters();
    if !ignored.is_empty() {
        warn!(
            ignored_parameters = ?ignored,
            "Sampling parameters are not supported by Claude CLI and will be ignored"
        );
    }

    let spec = InvocationSpec {
        prompt,
        system_prompt: request.system.as_ref().map(SystemPrompt::text),
        model: Some(map_model(&request.model)),
        stream: request.stream,
        attachments: attachments.paths().to_vec(),
        ..InvocationSpec::default()
    };
    let records = state.runner.invoke(&spec).await?;

    if request.stream {
        debug!(temp_files = attachments.len(), "Streaming response initiated");
        let events = translate(records, request.model.clone(), attachments)
            .map(|frame| frame.map(|frame| Event::default().event(frame.event).data(frame.data)));
        let mut response = Sse::new(events).into_response();
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        return Ok(response);
    }

    let response = aggregate(records, &request.model).await?;
    debug!(
        duration_ms = started.elapsed().as_millis() as u64,
        model = %request.model,
        output_tokens = response.usage.output_tokens,
        temp_files = attachments.len(),
        "Completed non-streaming response"
    );
    drop(attachments);
    Ok(Json(response).into_response())
}
