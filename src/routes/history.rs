//! Range queries for chart consumption: raw samples per metric, reduced to
//! the requested point budget with deterministic bucket means.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::downsample::{bucket_width_seconds, downsample};
use crate::dps::{self, DpsEntry};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

const MAX_WINDOW_HOURS: i64 = 24 * 365;
const DEFAULT_WINDOW_HOURS: i64 = 24;
const MAX_POINTS: usize = 10_000;
const DEFAULT_POINTS: usize = 500;

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryParams {
    hours: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    points: Option<usize>,
    /// Comma-separated metric columns; all metrics when absent.
    metrics: Option<String>,
}

#[derive(Debug, Serialize)]
struct SeriesPoint {
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Serialize)]
struct MetricSeries {
    unit: &'static str,
    points: Vec<SeriesPoint>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HistoryResponse {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bucket_seconds: i64,
    series: BTreeMap<&'static str, MetricSeries>,
}

fn resolve_range(params: &HistoryParams) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    match (params.start, params.end) {
        (Some(start), Some(end)) => {
            if end < start {
                return Err(AppError::bad_request("end must be after start"));
            }
            Ok((start, end))
        }
        (None, None) => {
            let hours = params.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
            if hours < 1 {
                return Err(AppError::bad_request("hours must be at least 1"));
            }
            let end = Utc::now();
            Ok((end - Duration::hours(hours), end))
        }
        _ => Err(AppError::bad_request(
            "start and end must be provided together",
        )),
    }
}

/// Resolve a comma-separated metric list against the DPS table; unknown
/// names are a typed error, never silently empty.
pub(crate) fn selected_entries(metrics: Option<&str>) -> AppResult<Vec<&'static DpsEntry>> {
    let Some(raw) = metrics else {
        return Ok(dps::DPS_TABLE.iter().collect());
    };
    let mut entries = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let entry = dps::entry_for_column(name)
            .ok_or_else(|| AppError::bad_request(format!("unknown metric {name:?}")))?;
        entries.push(entry);
    }
    if entries.is_empty() {
        return Err(AppError::bad_request("no metrics requested"));
    }
    Ok(entries)
}

pub(crate) async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<HistoryResponse>> {
    let (start, end) = resolve_range(&params)?;
    if end - start > Duration::hours(MAX_WINDOW_HOURS) {
        return Err(AppError::bad_request(format!(
            "requested window too large (max {MAX_WINDOW_HOURS} hours)"
        )));
    }
    let points = params.points.unwrap_or(DEFAULT_POINTS);
    if points == 0 || points > MAX_POINTS {
        return Err(AppError::bad_request(format!(
            "points must be between 1 and {MAX_POINTS}"
        )));
    }
    let entries = selected_entries(params.metrics.as_deref())?;

    let bucket_seconds = bucket_width_seconds(start, end, points);
    let results = try_join_all(
        entries
            .iter()
            .map(|entry| state.store.export_samples(entry.metric, start, end)),
    )
    .await?;

    let mut series = BTreeMap::new();
    for (entry, samples) in entries.iter().zip(results) {
        let reduced = downsample(&samples, start, bucket_seconds);
        series.insert(
            entry.column,
            MetricSeries {
                unit: entry.unit,
                points: reduced
                    .into_iter()
                    .map(|sample| SeriesPoint {
                        timestamp: sample.timestamp,
                        value: sample.value,
                    })
                    .collect(),
            },
        );
    }

    Ok(Json(HistoryResponse {
        start,
        end,
        bucket_seconds,
        series,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/history", get(history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, MockStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn inverted_range_is_a_bad_request() {
        let store = MockStore::new();
        let app = crate::routes::router(test_state(&store).await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/history?start=2026-01-02T00:00:00Z&end=2026-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_metric_is_a_bad_request() {
        let store = MockStore::new();
        let app = crate::routes::router(test_state(&store).await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/history?metrics=chlorine")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_window_returns_a_well_formed_empty_result() {
        let store = MockStore::new();
        let app = crate::routes::router(test_state(&store).await);
        let (status, body) = get_json(
            app,
            "/api/history?start=2026-01-01T00:00:00Z&end=2026-01-02T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["series"]["temperature"]["points"], serde_json::json!([]));
        assert_eq!(body["series"]["ph"]["points"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn downsampled_series_stay_within_the_point_budget() {
        let store = MockStore::new();
        // 120 raw points at one-second spacing.
        for i in 0..120 {
            store.seed("aquarium_ph", 1_700_000_000_000 + i * 1_000, 7.0);
        }
        let app = crate::routes::router(test_state(&store).await);
        let (status, body) = get_json(
            app,
            "/api/history?start=2023-11-14T22:13:20Z&end=2023-11-14T22:15:20Z&points=10&metrics=ph",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let points = body["series"]["ph"]["points"].as_array().unwrap().len();
        assert!(points > 0 && points <= 10, "got {points} points");
    }

    #[tokio::test]
    async fn results_are_ascending_by_timestamp() {
        let store = MockStore::new();
        store.seed("aquarium_ph", 1_700_000_050_000, 7.5);
        store.seed("aquarium_ph", 1_700_000_010_000, 7.1);
        store.seed("aquarium_ph", 1_700_000_030_000, 7.3);
        let app = crate::routes::router(test_state(&store).await);
        let (status, body) = get_json(
            app,
            "/api/history?start=2023-11-14T22:13:20Z&end=2023-11-14T22:15:20Z&points=10000&metrics=ph",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let points = body["series"]["ph"]["points"].as_array().unwrap().clone();
        let timestamps: Vec<String> = points
            .iter()
            .map(|p| p["timestamp"].as_str().unwrap().to_string())
            .collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
        assert_eq!(points.len(), 3);
    }
}
