use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::RelayError;
use super::forwarder::CommandResult;
use super::forwarder::Forwarder;
use crate::address::DeviceAddress;

/// Body of `POST /register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub ip: Option<String>,
}

/// Body of `POST /control`
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub ip: Option<String>,
    pub command: Option<String>,
}

/// Query of `GET /proxy`
#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ControlResponse {
    status: &'static str,
    response: CommandResult,
}

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Shared application state
struct AppState {
    forwarder: Forwarder,
    version: &'static str,
}

impl ControlRequest {
    /// Both fields must be present and non-blank. The command is otherwise
    /// passed through untouched; the device decides what it means.
    fn validate(self) -> Result<(DeviceAddress, String), RelayError> {
        const REQUIRED: &str = "IP and command are required";

        let ip = self.ip.filter(|ip| !ip.trim().is_empty());
        let command = self.command.filter(|cmd| !cmd.trim().is_empty());
        let (Some(ip), Some(command)) = (ip, command) else {
            return Err(RelayError::InvalidInput(REQUIRED));
        };

        Ok((parse_ip(&ip)?, command))
    }
}

impl RegisterRequest {
    fn validate(self) -> Result<DeviceAddress, RelayError> {
        match self.ip.filter(|ip| !ip.trim().is_empty()) {
            Some(ip) => parse_ip(&ip),
            None => Err(RelayError::InvalidInput("IP is required")),
        }
    }
}

fn parse_ip(ip: &str) -> Result<DeviceAddress, RelayError> {
    DeviceAddress::parse(ip).map_err(|e| {
        tracing::debug!("Rejecting address {:?}: {}", ip, e);
        RelayError::InvalidInput("Invalid IP address or domain")
    })
}

fn body_rejected(rejection: JsonRejection) -> RelayError {
    tracing::debug!("Rejecting request body: {}", rejection);
    RelayError::InvalidInput("Request body must be a JSON object")
}

/// Handler for POST /register
#[tracing::instrument(skip_all)]
async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Json(request) = payload.map_err(body_rejected)?;
    let address = request.validate()?;
    tracing::debug!("Handling /register for {}", address);

    state.forwarder.register(&address).await?;
    Ok(Json(RegisterResponse {
        status: "connected",
    }))
}

/// Handler for POST /control
#[tracing::instrument(skip_all)]
async fn control(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Json(request) = payload.map_err(body_rejected)?;
    let (address, command) = request.validate()?;
    tracing::debug!("Handling /control {:?} for {}", command, address);

    let response = state.forwarder.forward(&address, &command).await?;
    Ok(Json(ControlResponse {
        status: "success",
        response,
    }))
}

/// Handler for GET /proxy
#[tracing::instrument(skip_all)]
async fn proxy(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ProxyQuery>, QueryRejection>,
) -> Result<Response, RelayError> {
    const MISSING: &str = "Missing URL parameter";

    let Query(query) = query.map_err(|_| RelayError::InvalidInput(MISSING))?;
    let url = query
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or(RelayError::InvalidInput(MISSING))?;
    tracing::debug!("Handling /proxy for {}", url);

    let proxied = state.forwarder.fetch(&url).await?;
    let mut response = (proxied.status, proxied.body).into_response();
    if let Some(content_type) = proxied
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

async fn method_not_allowed() -> RelayError {
    RelayError::MethodNotAllowed
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Create the relay router with all endpoints
pub fn create_router(forwarder: Forwarder) -> Router {
    let state = Arc::new(AppState {
        forwarder,
        version: env!("CARGO_PKG_VERSION"),
    });

    Router::new()
        .route("/register", post(register).fallback(method_not_allowed))
        .route("/control", post(control).fallback(method_not_allowed))
        .route("/proxy", get(proxy).fallback(method_not_allowed))
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the relay HTTP server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires or its sender
/// is dropped.
pub async fn serve(
    listen: &str,
    port: u16,
    forwarder: Forwarder,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let ip: IpAddr = listen.parse()?;
    let addr = SocketAddr::new(ip, port);
    tracing::info!("Starting relay server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    let app = create_router(forwarder);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("Relay server shutting down gracefully");
        })
        .await?;

    Ok(())
}
