use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;

use crate::worker::transport::{DispatchReply, DispatchRequest, ProbeReply};

/// The image work a worker process plugs into its endpoint.
///
/// `Ok` carries the output reference, `Err` a message describing why the
/// transformation failed.
#[async_trait]
pub trait ImageProcessor: Send + Sync + 'static {
    async fn process(&self, request: &DispatchRequest) -> Result<String, String>;
}

#[derive(Clone)]
struct EndpointState {
    worker_id: Arc<str>,
    processor: Arc<dyn ImageProcessor>,
    active: Arc<AtomicU32>,
}

struct ActiveGuard(Arc<AtomicU32>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Routes a worker serves: `POST /dispatch` and `GET /probe`.
pub fn router(worker_id: impl Into<String>, processor: Arc<dyn ImageProcessor>) -> Router {
    let state = EndpointState {
        worker_id: Arc::from(worker_id.into()),
        processor,
        active: Arc::new(AtomicU32::new(0)),
    };

    Router::new()
        .route("/dispatch", post(dispatch_handler))
        .route("/probe", get(probe_handler))
        .with_state(state)
}

/// Serve `router` until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Worker endpoint listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn dispatch_handler(
    State(state): State<EndpointState>,
    Json(request): Json<DispatchRequest>,
) -> Json<DispatchReply> {
    let _active = ActiveGuard::enter(&state.active);
    tracing::debug!(
        worker_id = %state.worker_id,
        job_id = %request.job_id,
        attempt = request.attempt,
        kind = %request.kind,
        "Processing job"
    );

    let reply = match state.processor.process(&request).await {
        Ok(output_ref) => DispatchReply::Completed { output_ref },
        Err(message) => {
            tracing::warn!(
                worker_id = %state.worker_id,
                job_id = %request.job_id,
                error = %message,
                "Transformation failed"
            );
            DispatchReply::Failed { message }
        }
    };
    Json(reply)
}

async fn probe_handler(State(state): State<EndpointState>) -> Json<ProbeReply> {
    Json(ProbeReply {
        worker_id: state.worker_id.to_string(),
        active_jobs: state.active.load(Ordering::SeqCst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::scheduler::TransformKind;

    struct Echo;

    #[async_trait]
    impl ImageProcessor for Echo {
        async fn process(&self, request: &DispatchRequest) -> Result<String, String> {
            if request.input_ref.contains("corrupt") {
                return Err("cannot decode image".to_string());
            }
            Ok(format!("out/{}", request.input_ref))
        }
    }

    fn dispatch_body(input_ref: &str) -> Body {
        let request = DispatchRequest {
            job_id: uuid::Uuid::new_v4(),
            attempt: 1,
            kind: TransformKind::Grayscale,
            parameters: Default::default(),
            input_ref: input_ref.to_string(),
        };
        Body::from(serde_json::to_vec(&request).unwrap())
    }

    async fn call(app: Router, input_ref: &str) -> DispatchReply {
        let response = app
            .oneshot(
                Request::post("/dispatch")
                    .header("content-type", "application/json")
                    .body(dispatch_body(input_ref))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn dispatch_reports_success_and_failure() {
        let app = router("w1", Arc::new(Echo));

        assert_eq!(
            call(app.clone(), "cat.png").await,
            DispatchReply::Completed {
                output_ref: "out/cat.png".into()
            }
        );
        assert_eq!(
            call(app, "corrupt.png").await,
            DispatchReply::Failed {
                message: "cannot decode image".into()
            }
        );
    }

    #[tokio::test]
    async fn probe_reports_worker_id() {
        let app = router("w7", Arc::new(Echo));
        let response = app
            .oneshot(Request::get("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let reply: ProbeReply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.worker_id, "w7");
        assert_eq!(reply.active_jobs, 0);
    }
}
