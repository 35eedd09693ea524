//! The Agent's JSON HTTP surface (`spec.md` §4.4, §6): raw hyper 1.x rather
//! than a framework, routed by matching `(Method, path segments)` the way
//! the reference pack's container-sandbox agent does it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::error;

use crate::sandbox_manager::{CreateSpec, SandboxManager, SandboxManagerError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, BoxError>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    namespace: String,
    name: String,
    sandbox_id: String,
    claim_uid: String,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    exposed_ports: Vec<u16>,
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    endpoints: Vec<fastsandbox_types::model::Endpoint>,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponseBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    capacity: u32,
    allocated: u32,
    images: Vec<String>,
    sandbox_statuses: Vec<SandboxEntry>,
}

#[derive(Debug, Serialize)]
struct SandboxEntry {
    sandbox_id: String,
    claim_uid: String,
    phase: fastsandbox_types::model::AgentReportedPhase,
    message: String,
}

pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub capacity: u32,
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["healthz"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),
        (Method::GET, ["api", "v1", "agent", "status"]) => handle_state(state).await,
        (Method::POST, ["api", "v1", "agent", "create"]) => handle_create(req, state).await,
        (Method::POST, ["api", "v1", "agent", "delete"]) => handle_delete(req, state).await,
        (Method::GET, ["api", "v1", "agent", "logs"]) => handle_logs(&query, state).await,
        _ => json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error("not found")),
    };

    Ok(response)
}

/// Parse `sandboxID=...&follow=...` off a raw query string. No query crate
/// in this surface's dependency set; the parameter set is small and fixed.
fn parse_logs_query(query: &str) -> (Option<&str>, bool) {
    let mut sandbox_id = None;
    let mut follow = false;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("sandboxID", v)) => sandbox_id = Some(v),
            Some(("follow", v)) => follow = v == "true",
            _ => {}
        }
    }
    (sandbox_id, follow)
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .unwrap()
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let bytes = req
        .collect()
        .await
        .map_err(|_| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("failed to read body")))?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error(format!("invalid JSON: {e}"))))
}

async fn handle_create(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: CreateRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let spec = CreateSpec {
        namespace: body.namespace,
        name: body.name,
        sandbox_id: body.sandbox_id,
        claim_uid: body.claim_uid,
        image: body.image,
        command: body.command,
        args: body.args,
        env: body.env,
        exposed_ports: body.exposed_ports,
    };

    match state.manager.create(spec).await {
        Ok(endpoints) => json_response(StatusCode::CREATED, &ApiResponse::success(CreateResponse { endpoints })),
        Err(SandboxManagerError::AlreadyCreating) => json_response(
            StatusCode::CONFLICT,
            &ApiResponse::<()>::error("sandbox is already being created"),
        ),
        Err(SandboxManagerError::ClaimMismatch) => json_response(
            StatusCode::CONFLICT,
            &ApiResponse::<()>::error("sandbox id already used by a different claim"),
        ),
        Err(e) => {
            error!(error = %e, "sandbox create failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn handle_delete(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: DeleteRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    // Delete is idempotent at every layer down to the Runtime, so a delete
    // request is always a success once it's scheduled.
    match state.manager.delete(&body.sandbox_id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &ApiResponse::success(DeleteResponseBody {
                message: "delete scheduled".to_string(),
            }),
        ),
        Err(e) => {
            error!(sandbox_id = %body.sandbox_id, error = %e, "sandbox delete failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn handle_state(state: Arc<AppState>) -> Response<BoxBody> {
    let statuses = state.manager.status().await;
    let allocated = statuses.len() as u32;
    let sandbox_statuses = statuses
        .into_iter()
        .map(|s| SandboxEntry {
            sandbox_id: s.sandbox_id,
            claim_uid: s.claim_uid,
            phase: s.phase,
            message: s.message,
        })
        .collect();
    let images = state.manager.images().await;

    json_response(
        StatusCode::OK,
        &ApiResponse::success(StateResponse {
            capacity: state.capacity,
            allocated,
            images,
            sandbox_statuses,
        }),
    )
}

async fn handle_logs(query: &str, state: Arc<AppState>) -> Response<BoxBody> {
    let (sandbox_id, follow) = parse_logs_query(query);
    let Some(sandbox_id) = sandbox_id else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::<()>::error("sandboxID query parameter is required"),
        );
    };

    match state.manager.logs(sandbox_id, follow).await {
        Ok(stream) => {
            let body_stream = stream.map(|chunk| {
                chunk
                    .map(|bytes| Frame::data(bytes::Bytes::from(bytes)))
                    .map_err(|e| -> BoxError { Box::new(e) })
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(StreamBody::new(body_stream).boxed())
                .expect("static response parts are valid")
        }
        Err(e) => {
            error!(sandbox_id, error = %e, "logs lookup failed");
            json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error(e.to_string()))
        }
    }
}

pub async fn run_server(addr: SocketAddr, state: Arc<AppState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "agent HTTP API listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "error serving agent HTTP connection");
            }
        });
    }
}
