#![forbid(unsafe_code)]

//! HTTP front of the playlist bundler.
//!
//! Two operations are exposed: a metadata preview of a playlist and a download
//! that answers with either the single produced file or a streamed zip of all
//! of them. Every download runs in its own job directory which is removed once
//! the response body is done, whatever way it ends.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::Parser;
use playlist_bundler::{
    config::{ConfigOverrides, ServiceConfig, resolve_config},
    error::PlaylistError,
    media::{MediaTool, ensure_program_available},
    orchestrator::{BatchReport, DownloadStrategy, JobOptions, run_job},
    package::{package_response, plan_package},
    resolver::{PlaylistSummary, resolve_playlist},
    security::{ensure_not_root, prepare_download_root},
    url::normalize_playlist_url,
    workspace::JobWorkspace,
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "playlist_bundler=info,backend=info";
const URL_REQUIRED: &str = "URL is required";
const ITEMS_SUCCEEDED_HEADER: HeaderName = HeaderName::from_static("x-items-succeeded");
const ITEMS_FAILED_HEADER: HeaderName = HeaderName::from_static("x-items-failed");

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Preview and download playlists over HTTP")]
struct Cli {
    /// Directory that holds per-request job directories.
    #[arg(long)]
    download_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// `delegated` (yt-dlp merges) or `manual` (separate streams + ffmpeg).
    #[arg(long, value_parser = parse_strategy_arg)]
    strategy: Option<DownloadStrategy>,
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct BackendArgs {
    config: ServiceConfig,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let cli = Cli::try_parse_from(std::iter::once("backend".to_string()).chain(iter))?;
        let config = resolve_config(ConfigOverrides {
            download_root: cli.download_root,
            host: cli.host,
            port: cli.port,
            strategy: cli.strategy,
            env_path: cli.env_file,
        })?;
        let listen_host = parse_host_arg(&config.host)?;
        Ok(Self {
            config,
            listen_host,
        })
    }
}

fn parse_strategy_arg(value: &str) -> Result<DownloadStrategy, String> {
    DownloadStrategy::parse(value)
        .ok_or_else(|| format!("unknown strategy `{value}` (expected delegated or manual)"))
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/BUNDLER_HOST")
}

#[derive(Clone)]
struct AppState {
    tool: Arc<dyn MediaTool>,
    download_root: Arc<PathBuf>,
    options: JobOptions,
}

impl AppState {
    fn new(tool: Arc<dyn MediaTool>, config: &ServiceConfig) -> Self {
        Self {
            tool,
            download_root: Arc::new(config.download_root.clone()),
            options: config.job_options(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiSuccess<T> {
    status: &'static str,
    data: T,
}

impl<T> ApiSuccess<T> {
    fn new(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "method not allowed".to_string(),
        }
    }
}

impl From<PlaylistError> for ApiError {
    fn from(err: PlaylistError) -> Self {
        let status = err.http_status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %err, "request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %err, "request rejected");
        }
        // Raw io errors may carry server paths.
        let message = match err {
            PlaylistError::Io(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let BackendArgs {
        config,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;
    prepare_download_root(&config.download_root)?;
    ensure_program_available(&config.ytdlp_bin, "--version")
        .context("yt-dlp is required to resolve and download playlists")?;
    if let Err(err) = ensure_program_available(&config.ffmpeg_bin, "-version") {
        tracing::warn!(error = %err, "ffmpeg unavailable; merging and the manual strategy will fail");
    }

    let state = AppState::new(Arc::new(config.media_tool()), &config);
    let app = build_router(state);

    let addr = SocketAddr::new(listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(
        %addr,
        download_root = %config.download_root.display(),
        strategy = config.strategy.as_str(),
        "playlist bundler listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([ITEMS_SUCCEEDED_HEADER, ITEMS_FAILED_HEADER]);

    Router::new()
        .route("/playlist-preview", post(playlist_preview))
        .route("/playlist-download", post(playlist_download))
        .route("/api/playlist_data", post(playlist_preview))
        .route("/api/download", post(playlist_download))
        .fallback(endpoint_not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(cors)
        .with_state(state)
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

/// Pulls a usable playlist URL out of a JSON body. Anything else, including a
/// body that is not JSON at all, is the same validation failure.
fn requested_url(body: &[u8]) -> Result<String, PlaylistError> {
    serde_json::from_slice::<PlaylistRequest>(body)
        .ok()
        .and_then(|request| request.url)
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .map(|url| normalize_playlist_url(&url))
        .ok_or_else(|| PlaylistError::validation(URL_REQUIRED))
}

async fn playlist_preview(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ApiSuccess<PlaylistSummary>>> {
    let url = requested_url(&body)?;
    let summary = resolve_playlist(state.tool.as_ref(), &url, state.options.retry).await?;
    Ok(Json(ApiSuccess::new(summary)))
}

async fn playlist_download(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let url = requested_url(&body)?;
    let workspace = JobWorkspace::create(&state.download_root)?;
    let span = tracing::info_span!("job", id = %workspace.id(), url = %url);
    run_download(state, url, workspace).instrument(span).await
}

async fn run_download(state: AppState, url: String, workspace: JobWorkspace) -> ApiResult<Response> {
    let report = run_job(state.tool.as_ref(), &url, workspace.path(), &state.options).await?;
    if report.failed() > 0 {
        tracing::warn!(
            failed = report.failed(),
            succeeded = report.succeeded(),
            "playlist downloaded partially"
        );
    }

    let files = workspace.collect_files()?;
    let package = plan_package(files)?;
    let mut response = package_response(workspace, package).await?;
    annotate_report(&mut response, &report);
    Ok(response)
}

fn annotate_report(response: &mut Response, report: &BatchReport) {
    let headers = response.headers_mut();
    headers.insert(
        ITEMS_SUCCEEDED_HEADER,
        HeaderValue::from(report.succeeded() + report.skipped()),
    );
    headers.insert(ITEMS_FAILED_HEADER, HeaderValue::from(report.failed()));
}
