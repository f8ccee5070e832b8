//! Read-side client for the time-series store. Pure reader: the query
//! service never mutates the store.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("store returned malformed export data: {0}")]
    Malformed(String),
}

/// One line of the store's JSON-lines export format.
#[derive(Debug, Deserialize)]
struct ExportRow {
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    timestamps: Vec<i64>,
}

#[derive(Clone)]
pub struct VictoriaStore {
    base: String,
    http: reqwest::Client,
}

impl VictoriaStore {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Fetch the raw samples persisted for one metric within
    /// `[start, end]`, ascending by timestamp. An empty window yields an
    /// empty, well-formed result.
    pub async fn export_samples(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        let url = format!("{}/api/v1/export", self.base);
        let start_s = start.timestamp().to_string();
        let end_s = end.timestamp().to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("match[]", metric),
                ("start", start_s.as_str()),
                ("end", end_s.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status));
        }
        let body = response.text().await?;

        let mut samples = Vec::new();
        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let row: ExportRow = serde_json::from_str(line)
                .map_err(|err| StoreError::Malformed(err.to_string()))?;
            if row.values.len() != row.timestamps.len() {
                return Err(StoreError::Malformed(
                    "values/timestamps length mismatch".to_string(),
                ));
            }
            for (ts_ms, value) in row.timestamps.iter().zip(row.values.iter()) {
                let timestamp = DateTime::from_timestamp_millis(*ts_ms).ok_or_else(|| {
                    StoreError::Malformed(format!("timestamp {ts_ms} out of range"))
                })?;
                samples.push(Sample {
                    timestamp,
                    value: *value,
                });
            }
        }
        samples.sort_by_key(|sample| sample.timestamp);
        Ok(samples)
    }

    /// Most recent sample for a metric within the trailing staleness
    /// window, if any.
    pub async fn latest_sample(
        &self,
        metric: &str,
        staleness: Duration,
    ) -> Result<Option<Sample>, StoreError> {
        let end = Utc::now();
        let start = end - staleness;
        let samples = self.export_samples(metric, start, end).await?;
        Ok(samples.last().copied())
    }
}
