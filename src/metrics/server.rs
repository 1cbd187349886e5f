//! HTTP server for liveness, readiness and Prometheus metrics

use super::Metrics;
use crate::lifecycle::Lifecycle;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// HTTP server answering health checks and exposing metrics
pub struct HealthServer {
    metrics: Arc<Metrics>,
    lifecycle: Arc<Lifecycle>,
    addr: SocketAddr,
}

impl HealthServer {
    pub fn new(metrics: Arc<Metrics>, lifecycle: Arc<Lifecycle>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            lifecycle,
            addr,
        }
    }

    /// Bind the listener. Failing here is a startup error.
    pub async fn bind(self) -> std::io::Result<BoundHealthServer> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(
            "Health server listening on http://{} (/live, /ready, /metrics)",
            listener.local_addr()?
        );
        Ok(BoundHealthServer {
            server: self,
            listener,
        })
    }
}

/// A health server with its listener bound
pub struct BoundHealthServer {
    server: HealthServer,
    listener: TcpListener,
}

impl BoundHealthServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the lifecycle token is cancelled
    pub async fn run(self) {
        let token = self.server.lifecycle.token();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Health server accept failed: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let metrics = self.server.metrics.clone();
            let lifecycle = self.server.lifecycle.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    let lifecycle = lifecycle.clone();
                    async move { handle_request(req, metrics, lifecycle).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving health connection: {:?}", err);
                }
            });
        }

        info!("Health server stopped");
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn health_status(ok: bool) -> Response<Full<Bytes>> {
    if ok {
        text(StatusCode::OK, "OK")
    } else {
        text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    lifecycle: Arc<Lifecycle>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = metrics.registry.gather();
            let mut buffer = Vec::new();

            match encoder.encode(&metric_families, &mut buffer) {
                Ok(_) => {
                    let mut response = Response::new(Full::new(Bytes::from(buffer)));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                    response
                }
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics",
                    )
                }
            }
        }
        "/live" | "/healthz" => health_status(lifecycle.is_live()),
        "/ready" | "/readyz" => health_status(lifecycle.is_ready()),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
