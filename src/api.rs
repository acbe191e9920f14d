use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming as Body;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::Router;
use crate::telemetry::RequestLog;

/// Read-only view over the proxy registry and the request log.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<Router>,
    pub log: Arc<RequestLog>,
}

/// Serve the introspection API until the process exits.
///
/// Routes: `GET /` summary, `GET /requests` telemetry listing,
/// `GET /proxies` pool memberships.
pub async fn serve(host: String, port: u16, state: ApiState) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!("introspection api on http://{}", listener.local_addr()?);

    // Async accept loop; each connection gets its own service instance.
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let state = state.clone();

        let svc = service_fn(move |req: Request<Body>| {
            let state = state.clone();
            async move { respond(req, state) }
        });

        tokio::spawn(async move {
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                warn!("api connection error {err:?}");
            }
        });
    }
}

fn respond(req: Request<Body>, state: ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => {
            let summary = json!({
                "status": "ok",
                "pools": state.router.pool_count(),
                "proxies": state.router.proxy_count(),
                "requests": state.log.len(),
            });
            json_response(StatusCode::OK, summary.to_string())
        }
        (&Method::GET, "/requests") => match serde_json::to_string(&state.log.snapshot()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_response(e),
        },
        (&Method::GET, "/proxies") => match serde_json::to_string(&state.router.memberships()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_response(e),
        },
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "not found"}).to_string(),
        ),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = status;
    res.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    res
}

fn error_response(e: serde_json::Error) -> Response<Full<Bytes>> {
    warn!("failed to serialize api response: {e}");
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "serialization failed"}).to_string(),
    )
}
