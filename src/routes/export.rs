//! Full-resolution tabular export: every recognized metric joined on
//! timestamp, one CSV row per instant, empty cells where a metric has no
//! sample (never coerced to zero).

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::future::try_join_all;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::dps;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

const DEFAULT_EXPORT_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub(crate) struct ExportParams {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

pub(crate) async fn export_csv(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> AppResult<impl IntoResponse> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params
        .start
        .unwrap_or_else(|| end - Duration::days(DEFAULT_EXPORT_DAYS));
    if end < start {
        return Err(AppError::bad_request("end must be after start"));
    }

    let entries: Vec<_> = dps::DPS_TABLE.iter().collect();
    let results = try_join_all(
        entries
            .iter()
            .map(|entry| state.store.export_samples(entry.metric, start, end)),
    )
    .await?;

    // Join on timestamp across metrics.
    let mut rows: BTreeMap<i64, Vec<Option<f64>>> = BTreeMap::new();
    for (index, samples) in results.iter().enumerate() {
        for sample in samples {
            let row = rows
                .entry(sample.timestamp.timestamp_millis())
                .or_insert_with(|| vec![None; entries.len()]);
            row[index] = Some(sample.value);
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut headings = vec!["Timestamp".to_string()];
    headings.extend(entries.iter().map(|entry| entry.export_heading()));
    writer
        .write_record(&headings)
        .map_err(|err| AppError::internal(err.to_string()))?;

    for (ts_ms, row) in rows {
        let Some(timestamp) = DateTime::from_timestamp_millis(ts_ms) else {
            continue;
        };
        let mut record = vec![timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)];
        record.extend(
            row.into_iter()
                .map(|cell| cell.map(|value| value.to_string()).unwrap_or_default()),
        );
        writer
            .write_record(&record)
            .map_err(|err| AppError::internal(err.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| AppError::internal(err.to_string()))?;
    let body = String::from_utf8(bytes).map_err(|err| AppError::internal(err.to_string()))?;
    let filename = format!("aquarium_data_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "text/csv; charset=utf-8".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/export/csv", get(export_csv))
}
