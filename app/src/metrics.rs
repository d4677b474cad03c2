use companion_sync::metrics::SYNC_REGISTRY;
use companion_sync::SyncCoordinator;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    coordinator: Arc<SyncCoordinator>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            // Sync engine registry plus the process-wide default registry
            let mut metric_families = SYNC_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                tracing::error!(%err, "Failed to encode metrics");
                return Ok(respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "metrics unavailable",
                ));
            }

            Ok(respond(StatusCode::OK, encoder.format_type(), buffer))
        }
        (&Method::GET, "/health") => {
            let status = coordinator.status();
            let health = json!({
                "status": if status.connection.is_error() { "degraded" } else { "healthy" },
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "sync": status,
            });

            Ok(respond(StatusCode::OK, "application/json", health.to_string()))
        }
        (&Method::GET, "/ready") => {
            if coordinator.status().connection.is_error() {
                Ok(respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "sync error",
                ))
            } else {
                Ok(respond(StatusCode::OK, "text/plain", "ready"))
            }
        }
        _ => Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    }
}

pub async fn start_server(port_number: Option<u16>, coordinator: Arc<SyncCoordinator>) {
    const DEFAULT_PORT: u16 = 9001;

    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc = make_service_fn(move |_conn| {
        let coordinator = coordinator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(coordinator.clone(), req)
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(err) => {
            tracing::error!(%addr, %err, "Failed to bind metrics server");
            return;
        }
    };

    // TODO: handle graceful shutdown
    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {} with health endpoints", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}
