//! Latest stored value per metric. Reads the store rather than the device,
//! so the read path stays decoupled from the write path; metrics with no
//! recent sample are explicit nulls.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::dps;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct CurrentResponse {
    readings: BTreeMap<&'static str, Option<f64>>,
}

pub(crate) async fn current(State(state): State<AppState>) -> AppResult<Json<CurrentResponse>> {
    let staleness = state.config.current_staleness();
    let results = try_join_all(
        dps::DPS_TABLE
            .iter()
            .map(|entry| state.store.latest_sample(entry.metric, staleness)),
    )
    .await?;

    let mut readings = BTreeMap::new();
    for (entry, sample) in dps::DPS_TABLE.iter().zip(results) {
        readings.insert(entry.column, sample.map(|sample| sample.value));
    }
    Ok(Json(CurrentResponse { readings }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/current", get(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, MockStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn returns_latest_values_and_nulls_for_stale_metrics() {
        let store = MockStore::new();
        let now_ms = Utc::now().timestamp_millis();
        store.seed("aquarium_temperature_celsius", now_ms - 120_000, 23.4);
        store.seed("aquarium_temperature_celsius", now_ms - 60_000, 23.5);
        // Far outside the staleness window.
        store.seed("aquarium_ph", now_ms - 86_400_000, 7.2);

        let app = crate::routes::router(test_state(&store).await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["readings"]["temperature"], 23.5);
        assert_eq!(body["readings"]["ph"], serde_json::Value::Null);
        assert_eq!(body["readings"]["orp"], serde_json::Value::Null);
    }
}
