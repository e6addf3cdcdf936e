use crate::{
    analyzer::Analyze,
    api::{CommandResponse, HistoryResponse, SourceDescriptor, StatusResponse},
    app::App,
    source::SourceBackend,
};
use axum::{
    body::{self, Body},
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::ValueEnum;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

pub fn router<B: SourceBackend, A: Analyze>(app: Arc<App<B, A>>) -> Router {
    Router::new()
        .route(
            "/",
            get(|| async { (StatusCode::OK, "Traffic Lens is alive and healthy") }),
        )
        .route("/v1/status", get(v1_status::<B, A>))
        .route("/v1/history", get(v1_history::<B, A>))
        .route("/v1/frame", get(v1_frame::<B, A>))
        .route("/v1/source", post(v1_source::<B, A>))
        .route("/v1/analysis/start", post(v1_analysis_start::<B, A>))
        .route("/v1/analysis/stop", post(v1_analysis_stop::<B, A>))
        .route("/v1/analysis/retry", post(v1_analysis_retry::<B, A>))
        .with_state(app)
        .fallback(fallback_handler)
}

pub async fn run_server<B: SourceBackend, A: Analyze>(
    port: u16,
    app: Arc<App<B, A>>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let traffic_lens = router(app);

    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    info!("Starting dashboard, listening on {}", addr);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!("Looks like {port} is already in use by another application, please turn off the other application or pick another port with --port");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, traffic_lens.into_make_service())
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await?;

    Ok(())
}

async fn v1_status<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Json<StatusResponse> {
    Json(app.status().await)
}

async fn v1_history<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Json<HistoryResponse> {
    Json(app.history().await)
}

async fn v1_frame<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Result<Response, TrafficLensError> {
    match app.annotated_frame().await? {
        Some(jpeg) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(CommandResponse {
                success: false,
                message: "".into(),
                error: Some("no frame is being displayed".into()),
            }),
        )
            .into_response()),
    }
}

async fn v1_source<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
    Json(descriptor): Json<SourceDescriptor>,
) -> Result<Json<CommandResponse>, TrafficLensError> {
    let message = format!("switched to {descriptor}");
    app.set_source(descriptor).await?;
    Ok(Json(CommandResponse {
        success: true,
        message,
        error: None,
    }))
}

async fn v1_analysis_start<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Json<CommandResponse> {
    let message = if app.start_analysis().await {
        "analysis running"
    } else {
        "analysis enabled, waiting for an active video source"
    };
    Json(CommandResponse {
        success: true,
        message: message.into(),
        error: None,
    })
}

async fn v1_analysis_stop<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Json<CommandResponse> {
    app.stop_analysis().await;
    Json(CommandResponse {
        success: true,
        message: "analysis stopped".into(),
        error: None,
    })
}

async fn v1_analysis_retry<B: SourceBackend, A: Analyze>(
    State(app): State<Arc<App<B, A>>>,
) -> Json<CommandResponse> {
    if app.manual_retry().await {
        Json(CommandResponse {
            success: true,
            message: "retrying now".into(),
            error: None,
        })
    } else {
        Json(CommandResponse {
            success: false,
            message: "".into(),
            error: Some("analysis is not rate limited".into()),
        })
    }
}

struct TrafficLensError(anyhow::Error);

impl IntoResponse for TrafficLensError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CommandResponse {
                success: false,
                message: "".into(),
                error: Some(self.0.to_string()),
            }),
        )
            .into_response()
    }
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body_bytes = body::to_bytes(req.into_body(), 64 * 1024)
        .await
        .unwrap_or_else(|_| body::Bytes::new());

    warn!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Headers: {:?}, Body: {:?}",
        method, uri, headers, body_bytes
    );

    (StatusCode::NOT_FOUND, "Endpoint not implemented")
}

impl<E> From<E> for TrafficLensError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
