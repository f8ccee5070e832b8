//! Poll scheduler: fixed cadence with startup jitter, single-flight cycles,
//! bounded exponential backoff on transient failures, suspension with a
//! standing alarm on persistent ones.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::sink::VictoriaSink;
use crate::config::CollectorConfig;
use crate::dps;
use crate::tuya::{DeviceClient, DeviceSession};

/// Pure backoff schedule: `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub startup_jitter_max: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_transient_retries: u32,
    /// Consecutive failures after which the session is dropped, forcing a
    /// fresh channel instead of reusing a possibly-corrupted one.
    pub disconnect_after_failures: u32,
}

impl PollSettings {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            startup_jitter_max: config.startup_jitter_max(),
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            max_transient_retries: config.max_transient_retries,
            disconnect_after_failures: config.disconnect_after_failures.max(1),
        }
    }
}

/// Shared counters behind the collector's status endpoint.
#[derive(Debug, Default)]
pub struct CollectorStatus {
    pub cycles: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub points_written: AtomicU64,
    pub consecutive_failures: AtomicU32,
    pub connected: AtomicBool,
    pub suspended: AtomicBool,
    pub last_success_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    pub standing_alarm: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub cycles: u64,
    pub cycles_failed: u64,
    pub points_written: u64,
    pub consecutive_failures: u32,
    pub connected: bool,
    pub suspended: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub standing_alarm: Option<String>,
}

impl CollectorStatus {
    pub fn record_error(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(message.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    /// Latch an operator-visible condition; cleared only by operator
    /// action (restart after fixing the configuration).
    pub fn raise_alarm(&self, message: impl Into<String>) {
        self.suspended.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.standing_alarm.lock() {
            *guard = Some(message.into());
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let last_success_ms = self.last_success_unix_ms.load(Ordering::Relaxed);
        StatusSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::SeqCst),
            last_success: if last_success_ms == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last_success_ms as i64)
            },
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
            standing_alarm: self
                .standing_alarm
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success { readings: usize },
    /// The device answered but the store write exhausted its retry budget;
    /// the batch for this interval is dropped.
    SinkFailure,
    TransientFailure,
    PersistentFailure,
}

pub struct Collector {
    client: DeviceClient,
    sink: VictoriaSink,
    settings: PollSettings,
    session: Option<DeviceSession>,
    status: Arc<CollectorStatus>,
}

impl Collector {
    pub fn new(client: DeviceClient, sink: VictoriaSink, settings: PollSettings) -> Self {
        Self {
            client,
            sink,
            settings,
            session: None,
            status: Arc::new(CollectorStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<CollectorStatus> {
        self.status.clone()
    }

    /// One poll cycle: poll, decode, batch-write. Never panics or exits the
    /// process; every path ends in an outcome and a status update.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.status.cycles.fetch_add(1, Ordering::Relaxed);
        match self.client.poll(&mut self.session).await {
            Ok(raw) => {
                self.status.connected.store(true, Ordering::Relaxed);
                self.status.consecutive_failures.store(0, Ordering::Relaxed);
                let now = Utc::now();
                let decoded = dps::decode(&raw, now);
                for warning in &decoded.warnings {
                    tracing::warn!(%warning, "decode warning");
                }
                if decoded.readings.is_empty() {
                    tracing::warn!("no recognized data points in device response");
                    self.status.clear_error();
                    self.mark_success(now, 0);
                    return CycleOutcome::Success { readings: 0 };
                }
                match self.sink.write(&decoded.readings).await {
                    Ok(()) => {
                        let summary = decoded
                            .readings
                            .iter()
                            .map(|r| format!("{}={}", r.dp.column, r.value))
                            .collect::<Vec<_>>()
                            .join(", ");
                        tracing::info!(count = decoded.readings.len(), %summary, "cycle complete");
                        self.status.clear_error();
                        self.mark_success(now, decoded.readings.len());
                        CycleOutcome::Success {
                            readings: decoded.readings.len(),
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "dropping cycle batch: store write failed");
                        self.status.cycles_failed.fetch_add(1, Ordering::Relaxed);
                        self.status.record_error(err.to_string());
                        CycleOutcome::SinkFailure
                    }
                }
            }
            Err(err) if err.is_persistent() => {
                self.session = None;
                self.status.connected.store(false, Ordering::Relaxed);
                self.status.cycles_failed.fetch_add(1, Ordering::Relaxed);
                self.status.record_error(err.to_string());
                self.status.raise_alarm(format!(
                    "polling suspended: {err}; fix the device credentials and restart the collector"
                ));
                tracing::error!(error = %err, "persistent device failure; polling suspended");
                CycleOutcome::PersistentFailure
            }
            Err(err) => {
                let failures = self
                    .status
                    .consecutive_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                self.status.cycles_failed.fetch_add(1, Ordering::Relaxed);
                self.status.record_error(err.to_string());
                if failures >= self.settings.disconnect_after_failures {
                    if self.session.take().is_some() {
                        tracing::warn!(failures, "dropping device session after consecutive failures");
                    }
                    self.status.connected.store(false, Ordering::Relaxed);
                }
                tracing::warn!(error = %err, failures, "device poll failed");
                CycleOutcome::TransientFailure
            }
        }
    }

    fn mark_success(&self, now: DateTime<Utc>, points: usize) {
        self.status
            .points_written
            .fetch_add(points as u64, Ordering::Relaxed);
        self.status
            .last_success_unix_ms
            .store(now.timestamp_millis() as u64, Ordering::Relaxed);
    }

    /// Scheduler loop. Cycles run inline on this task, so at most one is in
    /// flight; a cycle that overruns the interval skips the missed tick
    /// instead of queueing. Cancellation aborts in-flight I/O promptly.
    pub async fn run(mut self, cancel: CancellationToken) {
        let jitter_max = self.settings.startup_jitter_max.as_millis() as u64;
        if jitter_max > 0 {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(jitter) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retries = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            loop {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return,
                    outcome = self.run_cycle() => outcome,
                };
                match outcome {
                    CycleOutcome::Success { .. } | CycleOutcome::SinkFailure => {
                        retries = 0;
                        break;
                    }
                    CycleOutcome::PersistentFailure => {
                        // The standing alarm is raised; hold until shutdown.
                        cancel.cancelled().await;
                        return;
                    }
                    CycleOutcome::TransientFailure => {
                        if retries >= self.settings.max_transient_retries {
                            tracing::warn!(
                                retries,
                                "transient retry budget exhausted; resuming normal polling interval"
                            );
                            retries = 0;
                            break;
                        }
                        let delay = backoff_delay(
                            retries,
                            self.settings.backoff_base,
                            self.settings.backoff_cap,
                        );
                        retries += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
