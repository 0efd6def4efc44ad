use crate::error::FlowMetricsError;
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Handle to the running telemetry server; dropping the sender side of
/// `stop` alone also shuts it down.
pub struct TelemetryHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TelemetryHandle {
    /// Requests a clean shutdown and waits for the server to finish. A
    /// clean shutdown is the expected path, not an error.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Binds the metrics/health endpoint and serves it on a background task.
/// A bind failure is fatal to startup.
pub fn spawn(
    addr: SocketAddr,
    registry: Registry,
    ready: Arc<AtomicBool>,
) -> crate::Result<TelemetryHandle> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (bound, server) = warp::serve(routes(registry, ready))
        .try_bind_with_graceful_shutdown(addr, async {
            let _ = stop_rx.await;
        })
        .map_err(|e| FlowMetricsError::Network(e.to_string()))?;
    info!(address = %bound, "telemetry server listening");

    let task = tokio::spawn(async move {
        server.await;
        info!("telemetry server closed");
    });

    Ok(TelemetryHandle {
        stop: stop_tx,
        task,
    })
}

/// `GET /metrics` and `GET /health`.
pub fn routes(
    registry: Registry,
    ready: Arc<AtomicBool>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let metrics = warp::path("metrics")
        .and(warp::get())
        .and(with_registry(registry))
        .and_then(handle_metrics);

    let health = warp::path("health")
        .and(warp::get())
        .and(with_ready(ready))
        .and_then(handle_health);

    metrics.or(health)
}

fn with_registry(
    registry: Registry,
) -> impl Filter<Extract = (Registry,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

fn with_ready(
    ready: Arc<AtomicBool>,
) -> impl Filter<Extract = (Arc<AtomicBool>,), Error = Infallible> + Clone {
    warp::any().map(move || ready.clone())
}

async fn handle_metrics(registry: Registry) -> Result<impl Reply, Infallible> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => {
            let body = String::from_utf8(buffer).unwrap_or_default();
            Ok(warp::reply::with_status(
                warp::reply::with_header(body, "content-type", encoder.format_type().to_string()),
                StatusCode::OK,
            ))
        }
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            Ok(warp::reply::with_status(
                warp::reply::with_header(
                    String::new(),
                    "content-type",
                    "text/plain".to_string(),
                ),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

/// Liveness gate: 503 until the pipeline finished startup, 200 after.
async fn handle_health(ready: Arc<AtomicBool>) -> Result<impl Reply, Infallible> {
    if ready.load(Ordering::Relaxed) {
        Ok(warp::reply::with_status("OK", StatusCode::OK))
    } else {
        Ok(warp::reply::with_status(
            "starting",
            StatusCode::SERVICE_UNAVAILABLE,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntCounter;

    #[tokio::test]
    async fn health_reflects_readiness() {
        let ready = Arc::new(AtomicBool::new(false));
        let filter = routes(Registry::new(), ready.clone());

        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::Relaxed);
        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "OK");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_registered_counters() {
        let registry = Registry::new();
        let counter =
            IntCounter::new("demo_total", "A demo counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);

        let filter = routes(registry, Arc::new(AtomicBool::new(true)));
        let res = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("demo_total 3"));
    }
}
