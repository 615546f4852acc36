use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser};
use thiserror::Error;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::config::{default_work_dir, ServerConfig};
use crate::pty::PtyBackend;
use crate::router::{build_router, AppState, AuthConfig};
use crate::telemetry::init_logging;

#[derive(Parser, Debug)]
#[command(name = "agent-dash")]
#[command(about = "Dashboard server for a coding-agent CLI and a shell", version)]
pub struct Cli {
    #[arg(long, env = "AGENT_DASH_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "AGENT_DASH_PORT", default_value_t = 8787)]
    port: u16,

    #[arg(long, env = "AGENT_DASH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long)]
    no_token: bool,

    /// Identity reported for authenticated connections.
    #[arg(long, env = "AGENT_DASH_USERNAME", default_value = "admin")]
    username: String,

    /// Agent CLI program name or path.
    #[arg(long, env = "AGENT_DASH_AGENT", default_value = "claude")]
    agent: String,

    /// User to run agent processes as when started as root; empty disables.
    #[arg(long, env = "AGENT_DASH_RUN_AS", default_value = "claude")]
    run_as: String,

    /// Interactive terminal fallback when the agent is not installed.
    #[arg(long, env = "AGENT_DASH_SHELL", default_value = "/bin/bash")]
    shell: String,

    /// Pseudo-terminal backend: native or portable.
    #[arg(long, env = "AGENT_DASH_PTY_BACKEND")]
    pty_backend: Option<PtyBackend>,

    /// Default working directory for agent runs (defaults to ~/projects or ~).
    #[arg(long, env = "AGENT_DASH_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Starting directory of command terminal sessions (defaults to ~).
    #[arg(long, env = "AGENT_DASH_TERMINAL_HOME")]
    terminal_home: Option<PathBuf>,

    /// Timeout in seconds for chat runs; unset means no limit.
    #[arg(long, env = "AGENT_DASH_CHAT_TIMEOUT")]
    chat_timeout: Option<u64>,

    #[arg(long, env = "AGENT_DASH_SCHEDULED_TIMEOUT", default_value_t = 120)]
    scheduled_timeout: u64,

    #[command(flatten)]
    cors: CorsArgs,
}

/// Cross-origin access for a dashboard served from another origin.
#[derive(Args, Debug, Default)]
struct CorsArgs {
    /// Allowed origin; repeat or comma-separate. Unset means no CORS layer.
    #[arg(long = "cors-origin", env = "AGENT_DASH_CORS_ORIGINS", value_delimiter = ',')]
    origins: Vec<String>,

    #[arg(long = "cors-method", env = "AGENT_DASH_CORS_METHODS", value_delimiter = ',')]
    methods: Vec<String>,

    #[arg(long = "cors-header", env = "AGENT_DASH_CORS_HEADERS", value_delimiter = ',')]
    headers: Vec<String>,

    /// Let browsers send cookies and auth headers cross-origin.
    #[arg(long = "cors-credentials", env = "AGENT_DASH_CORS_CREDENTIALS")]
    credentials: bool,
}

impl CorsArgs {
    fn is_configured(&self) -> bool {
        !self.origins.is_empty()
            || !self.methods.is_empty()
            || !self.headers.is_empty()
            || self.credentials
    }

    /// Build the layer, or `None` when nothing was configured.
    ///
    /// Unlisted parts default to any; with credentials they mirror the
    /// request instead, since browsers reject `*` on credentialed requests.
    fn layer(&self) -> Result<Option<CorsLayer>, CliError> {
        if !self.is_configured() {
            return Ok(None);
        }

        let origins: Vec<HeaderValue> = parse_each(&self.origins, CliError::InvalidCorsOrigin)?;
        let methods: Vec<Method> = parse_each(&self.methods, CliError::InvalidCorsMethod)?;
        let headers: Vec<HeaderName> = parse_each(&self.headers, CliError::InvalidCorsHeader)?;

        let origin = match (origins.is_empty() || is_wildcard(&self.origins), self.credentials) {
            (false, _) => AllowOrigin::list(origins),
            (true, true) => AllowOrigin::mirror_request(),
            (true, false) => AllowOrigin::any(),
        };
        let method = match (methods.is_empty() || is_wildcard(&self.methods), self.credentials) {
            (false, _) => AllowMethods::list(methods),
            (true, true) => AllowMethods::mirror_request(),
            (true, false) => AllowMethods::any(),
        };
        let header = match (headers.is_empty() || is_wildcard(&self.headers), self.credentials) {
            (false, _) => AllowHeaders::list(headers),
            (true, true) => AllowHeaders::mirror_request(),
            (true, false) => AllowHeaders::any(),
        };

        Ok(Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(method)
                .allow_headers(header)
                .allow_credentials(self.credentials),
        ))
    }
}

fn is_wildcard(raw: &[String]) -> bool {
    raw.iter().any(|value| value.trim() == "*")
}

fn parse_each<T: FromStr>(raw: &[String], invalid: fn(String) -> CliError) -> Result<Vec<T>, CliError> {
    raw.iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty() && *value != "*")
        .map(|value| value.parse().map_err(|_| invalid(value.to_string())))
        .collect()
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing --token or --no-token for server mode")]
    MissingToken,
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_dash() -> Result<(), CliError> {
    init_logging();
    let cli = Cli::parse();
    run_server(&cli)
}

fn run_server(cli: &Cli) -> Result<(), CliError> {
    let auth = if cli.no_token {
        tracing::warn!("authentication disabled");
        AuthConfig::disabled()
    } else if let Some(token) = cli.token.clone() {
        AuthConfig::with_token(token)
    } else {
        return Err(CliError::MissingToken);
    };

    let config = server_config(cli);
    tracing::info!(
        agent = %config.agent_binary,
        run_as = config.run_as.as_deref().unwrap_or("-"),
        pty_backend = %config.pty_backend,
        work_dir = %config.work_dir.display(),
        "configuration loaded"
    );
    let mut router = build_router(AppState::new(auth, config));

    if let Some(cors) = cli.cors.layer()? {
        router = router.layer(cors);
    }

    let addr = format!("{}:{}", cli.host, cli.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "agent-dash listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn server_config(cli: &Cli) -> ServerConfig {
    let defaults = ServerConfig::default();
    let run_as = cli.run_as.trim();
    ServerConfig {
        username: cli.username.clone(),
        agent_binary: cli.agent.clone(),
        run_as: (!run_as.is_empty()).then(|| run_as.to_string()),
        shell: cli.shell.clone(),
        pty_backend: cli.pty_backend.unwrap_or(defaults.pty_backend),
        work_dir: cli
            .work_dir
            .clone()
            .unwrap_or_else(|| default_work_dir(&defaults.terminal_home)),
        terminal_home: cli.terminal_home.clone().unwrap_or(defaults.terminal_home),
        chat_timeout: cli.chat_timeout.map(Duration::from_secs),
        scheduled_timeout: Duration::from_secs(cli.scheduled_timeout),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
