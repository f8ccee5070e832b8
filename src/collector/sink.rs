//! Metrics sink: one batched store write per poll cycle.

use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;

use super::poller::backoff_delay;
use crate::dps::Reading;

/// Cap on the sink's own retry backoff; store retries happen within one
/// poll cycle and must not eat into the next interval.
const SINK_BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("store write failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected batch with status {0}")]
    Status(reqwest::StatusCode),
    #[error("store write retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

pub struct VictoriaSink {
    import_url: String,
    sensor_label: String,
    http: reqwest::Client,
    retries: u32,
    backoff_base: Duration,
}

impl VictoriaSink {
    pub fn new(
        base_url: &str,
        sensor_label: &str,
        http: reqwest::Client,
        retries: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            import_url: format!(
                "{}/api/v1/import/prometheus",
                base_url.trim_end_matches('/')
            ),
            sensor_label: sensor_label.to_string(),
            http,
            retries,
            backoff_base,
        }
    }

    /// Prometheus exposition lines for one cycle's readings. Timestamps are
    /// the decode-time instants in milliseconds, so a retried batch is
    /// byte-identical and the store keeps one point per (metric, timestamp).
    pub fn render_batch(readings: &[Reading], sensor_label: &str) -> String {
        let mut lines = String::new();
        for reading in readings {
            let _ = writeln!(
                lines,
                "{}{{sensor=\"{}\"}} {} {}",
                reading.dp.metric,
                sensor_label,
                reading.value,
                reading.timestamp.timestamp_millis()
            );
        }
        lines
    }

    /// Write one cycle's readings as a single batch, retrying transient
    /// store failures with bounded backoff. On an exhausted budget the
    /// batch is lost and the caller surfaces a cycle-level error; the next
    /// cycle produces fresh data.
    pub async fn write(&self, readings: &[Reading]) -> Result<(), SinkError> {
        if readings.is_empty() {
            return Ok(());
        }
        let payload = Self::render_batch(readings, &self.sensor_label);
        let mut attempt = 0u32;
        loop {
            match self.try_write(payload.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "store write succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) if attempt < self.retries => {
                    let delay = backoff_delay(attempt, self.backoff_base, SINK_BACKOFF_CAP);
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "store write failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(SinkError::Exhausted {
                        attempts: attempt + 1,
                        last: err.to_string(),
                    })
                }
            }
        }
    }

    async fn try_write(&self, payload: String) -> Result<(), SinkError> {
        let response = self.http.post(&self.import_url).body(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status(status))
        }
    }
}
