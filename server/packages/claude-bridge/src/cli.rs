use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{ArgAction, Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::config::{split_list, BridgeConfig};
use crate::router::{build_router, ApiDoc, AppState};
use crate::telemetry::init_logging;

#[derive(Parser, Debug)]
#[command(name = "claude-bridge")]
#[command(about = "Anthropic Messages API gateway for the Claude CLI", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    server: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the OpenAPI document for the HTTP API.
    Openapi(OpenApiArgs),
}

#[derive(Args, Debug)]
struct OpenApiArgs {
    /// Write to this file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Server host address.
    #[arg(long, short = 'H', env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port.
    #[arg(long, short = 'p', env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Increase verbosity: -v=debug, -vv=trace.
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Path to the claude binary.
    #[arg(long, env = "CLAUDE_CLI_PATH", default_value = "claude")]
    claude_cli_path: PathBuf,

    /// Working directory for Claude CLI runs.
    #[arg(long, env = "CLAUDE_CWD")]
    claude_cwd: Option<PathBuf>,

    /// Comma-separated allowed tools, e.g. "Read". Required for file upload.
    #[arg(long, env = "CLAUDE_ALLOWED_TOOLS_STR", default_value = "")]
    allowed_tools: String,

    /// Comma-separated disallowed tools.
    #[arg(long, env = "CLAUDE_DISALLOWED_TOOLS_STR", default_value = "")]
    disallowed_tools: String,

    /// Comma-separated absolute directories the CLI may read. Required for file upload.
    #[arg(long, env = "CLAUDE_ALLOWED_DIRECTORIES_STR", default_value = "")]
    allowed_directories: String,

    /// Absolute limit for a non-streaming CLI run.
    #[arg(long, env = "CLAUDE_PROCESS_TIMEOUT_SECONDS", default_value_t = 300)]
    process_timeout_secs: u64,

    /// Longest gap between CLI output lines while streaming.
    #[arg(long, env = "CLAUDE_STREAM_IDLE_TIMEOUT_SECONDS", default_value_t = 180)]
    stream_idle_timeout_secs: u64,

    /// Wait between SIGTERM and SIGKILL.
    #[arg(long, env = "CLAUDE_PROCESS_KILL_GRACE_SECONDS", default_value_t = 5)]
    kill_grace_secs: u64,

    /// Require this key in `x-api-key` or `Authorization: Bearer`.
    #[arg(long, env = "BRIDGE_API_KEY")]
    api_key: Option<String>,

    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method")]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header")]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials")]
    cors_allow_credentials: bool,
}

impl ServerArgs {
    pub fn to_config(&self) -> BridgeConfig {
        BridgeConfig {
            host: self.host.clone(),
            port: self.port,
            claude_cli_path: self.claude_cli_path.clone(),
            claude_cwd: self.claude_cwd.clone(),
            allowed_tools: split_list(&self.allowed_tools),
            disallowed_tools: split_list(&self.disallowed_tools),
            allowed_directories: split_list(&self.allowed_directories)
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            process_timeout: Duration::from_secs(self.process_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            api_key: self.api_key.clone().filter(|key| !key.is_empty()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("--cors-allow-credentials requires explicit --cors-allow-origin values")]
    CorsCredentialsWithWildcard,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_claude_bridge() -> Result<(), CliError> {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.server.verbose, &cli.server.log_level);

    match &cli.command {
        Some(Command::Openapi(args)) => write_openapi(args),
        None => run_server(&cli.server),
    }
}

fn write_openapi(args: &OpenApiArgs) -> Result<(), CliError> {
    let json = ApiDoc::openapi().to_pretty_json()?;
    match &args.out {
        Some(path) => std::fs::write(path, json)?,
        None => {
            let mut out = std::io::stdout();
            out.write_all(json.as_bytes())?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
    }
    Ok(())
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = args.to_config();
    let addr = config.bind_addr();
    tracing::info!(
        addr = %addr,
        cli = %config.claude_cli_path.display(),
        allowed_tools = ?config.allowed_tools,
        allowed_directories = ?config.allowed_directories,
        auth = config.api_key.is_some(),
        "starting claude-bridge"
    );

    let cors = build_cors_layer(args)?;
    let router = build_router(AppState::new(config)).layer(cors);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down claude-bridge");
}

/// Permissive unless narrowed by `--cors-*` flags. Each unset list falls
/// back to `Any`.
fn build_cors_layer(args: &ServerArgs) -> Result<CorsLayer, CliError> {
    let narrowed = !args.cors_allow_origin.is_empty()
        || !args.cors_allow_method.is_empty()
        || !args.cors_allow_header.is_empty()
        || args.cors_allow_credentials;
    if !narrowed {
        return Ok(CorsLayer::permissive());
    }
    if args.cors_allow_credentials && args.cors_allow_origin.is_empty() {
        return Err(CliError::CorsCredentialsWithWildcard);
    }

    let origins: Option<Vec<HeaderValue>> =
        parse_cors_values(&args.cors_allow_origin, CliError::InvalidCorsOrigin)?;
    let methods: Option<Vec<Method>> =
        parse_cors_values(&args.cors_allow_method, CliError::InvalidCorsMethod)?;
    let headers: Option<Vec<HeaderName>> =
        parse_cors_values(&args.cors_allow_header, CliError::InvalidCorsHeader)?;

    let cors = CorsLayer::new().allow_credentials(args.cors_allow_credentials);
    let cors = match origins {
        Some(origins) => cors.allow_origin(origins),
        None => cors.allow_origin(Any),
    };
    let cors = match methods {
        Some(methods) => cors.allow_methods(methods),
        None => cors.allow_methods(Any),
    };
    let cors = match headers {
        Some(headers) => cors.allow_headers(headers),
        None => cors.allow_headers(Any),
    };
    Ok(cors)
}

/// `None` for an empty flag list; otherwise every entry must parse.
fn parse_cors_values<T: FromStr>(
    raw: &[String],
    invalid: fn(String) -> CliError,
) -> Result<Option<Vec<T>>, CliError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.iter()
        .map(|value| value.trim().parse().map_err(|_| invalid(value.clone())))
        .collect::<Result<Vec<T>, CliError>>()
        .map(Some)
}
