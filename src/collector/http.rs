//! Local status surface for the collector daemon: liveness plus a JSON
//! snapshot of cycle counters, session state and any standing alarm.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use super::poller::{CollectorStatus, StatusSnapshot};

#[derive(Clone)]
pub struct HttpState {
    pub status: Arc<CollectorStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn status_endpoint_serves_a_snapshot() {
        let status = Arc::new(CollectorStatus::default());
        status.raise_alarm("device authentication failed");
        let app = router(HttpState {
            status: status.clone(),
        });

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/v1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot["suspended"], true);
        assert_eq!(snapshot["standing_alarm"], "device authentication failed");
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = router(HttpState {
            status: Arc::new(CollectorStatus::default()),
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
