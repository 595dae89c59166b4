//! Stable front address for the current generation.
//!
//! Every generation listens on its own port. The proxy listens on the
//! configured proxy address and forwards each request to whichever
//! generation is current when the request arrives. With reload-on-request
//! enabled it first asks the orchestrator to reload, so a request never
//! reaches stale code.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use relive_core::{Error, ReloadOrchestrator, Trigger};
use serde_json::json;
use tokio::net::TcpListener;

/// Path of the proxy's own status endpoint.
pub const STATUS_PATH: &str = "/__relive/status";

/// Largest request body forwarded.
const MAX_BODY: usize = 64 * 1024 * 1024;

/// Headers that describe a single connection and are not forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Shared proxy state.
pub struct ReloadProxy {
    orchestrator: Arc<ReloadOrchestrator>,
    client: reqwest::Client,
    reload_on_request: bool,
}

impl ReloadProxy {
    pub fn new(orchestrator: Arc<ReloadOrchestrator>, reload_on_request: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            orchestrator,
            client,
            reload_on_request,
        })
    }
}

/// Create the proxy router.
pub fn create_router(proxy: Arc<ReloadProxy>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status_handler))
        .fallback(forward_handler)
        .with_state(proxy)
}

/// Serve the proxy on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<ReloadProxy>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Proxy listening at http://{}", addr);
    }

    axum::serve(listener, create_router(proxy))
        .with_graceful_shutdown(shutdown)
        .await
        .context("proxy server failed")
}

/// Generations and the current endpoint as JSON.
async fn status_handler(State(proxy): State<Arc<ReloadProxy>>) -> Json<serde_json::Value> {
    let orchestrator = &proxy.orchestrator;
    let generations: Vec<_> = orchestrator
        .generations()
        .into_iter()
        .map(|record| {
            json!({
                "id": record.id.as_u64(),
                "entry_point": record.entry_point,
                "artifacts": record.artifacts,
                "endpoint": record.endpoint.to_string(),
                "state": record.state.to_string(),
            })
        })
        .collect();

    Json(json!({
        "phase": format!("{:?}", orchestrator.phase()),
        "running": orchestrator.is_running().await,
        "endpoint": orchestrator.current_endpoint().await.map(|e| e.to_string()),
        "generations": generations,
    }))
}

async fn forward_handler(State(proxy): State<Arc<ReloadProxy>>, request: Request) -> Response {
    if proxy.reload_on_request {
        match proxy.orchestrator.reload(Trigger::Request).await {
            Ok(_) | Err(Error::Stopped) => {}
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    let Some(endpoint) = proxy.orchestrator.current_endpoint().await else {
        return (StatusCode::BAD_GATEWAY, "no generation is running").into_response();
    };

    match forward(&proxy.client, endpoint, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("proxy error: {:#}", e);
            (StatusCode::BAD_GATEWAY, format!("{:#}", e)).into_response()
        }
    }
}

async fn forward(client: &reqwest::Client, endpoint: SocketAddr, request: Request) -> anyhow::Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("http://{}{}", endpoint, path);
    let body = axum::body::to_bytes(body, MAX_BODY)
        .await
        .context("failed to read request body")?;

    let mut upstream = client.request(parts.method, &url).body(body);
    for (name, value) in parts.headers.iter() {
        if !HOP_BY_HOP.contains(name) {
            upstream = upstream.header(name, value);
        }
    }
    let upstream = upstream
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.context("failed to read response body")?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP.contains(name) {
            response.headers_mut().append(name, value.clone());
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_core::{
        AlwaysChanged, AppContext, AppError, ArtifactSet, CompileResult, ReloadConfig, ThreadLauncher,
    };

    async fn hello(cx: AppContext) -> Result<(), AppError> {
        let app = Router::new()
            .route("/hello", get(|| async { "hi" }))
            .route("/health", get(|| async { "ok" }));
        let listener = TcpListener::bind(cx.endpoint()).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cx.interrupted().await })
            .await?;
        Ok(())
    }

    fn orchestrator() -> Arc<ReloadOrchestrator> {
        let launcher = ThreadLauncher::new().register("hello", hello);
        Arc::new(ReloadOrchestrator::new(
            launcher,
            || CompileResult::NoChange,
            AlwaysChanged,
        ))
    }

    async fn spawn_proxy(proxy: ReloadProxy) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(proxy), std::future::pending()));
        addr
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forwards_to_current_generation() {
        let orchestrator = orchestrator();
        orchestrator
            .start(ReloadConfig::new("hello").with_artifacts(ArtifactSet::default()))
            .await
            .unwrap();
        let addr = spawn_proxy(ReloadProxy::new(orchestrator.clone(), true).unwrap()).await;

        let response = client()
            .get(format!("http://{}/hello", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hi");

        let status: serde_json::Value = client()
            .get(format!("http://{}{}", addr, STATUS_PATH))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["running"], true);
        assert_eq!(status["generations"][0]["state"], "running");

        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_bad_gateway_without_generation() {
        let addr = spawn_proxy(ReloadProxy::new(orchestrator(), false).unwrap()).await;
        let response = client()
            .get(format!("http://{}/hello", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    }
}
