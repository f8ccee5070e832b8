//! Test-only fixtures: a scripted mock device that speaks the wire codec on
//! a loopback socket, and a mock store implementing the import/export
//! endpoints over a last-write-wins `(metric, timestamp)` map.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::tuya::codec::{self, CommandType};
use crate::tuya::ProtocolVersion;

/// Per-connection behavior of the mock device. The script advances one
/// entry per accepted connection and repeats its last entry once exhausted.
#[derive(Debug, Clone)]
pub enum DeviceBehavior {
    /// Complete the handshake and answer status queries with these dps,
    /// repeatedly, on the same connection.
    Serve(JsonValue),
    /// Complete the handshake, answer exactly one status query, then close
    /// the connection.
    ServeOnce(JsonValue),
    /// Complete the handshake but answer status queries with an error code.
    RespondError(u32),
    CloseImmediately,
    Stall,
    Garbage,
}

pub struct MockDevice {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl MockDevice {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn spawn_mock_device(
    key: Vec<u8>,
    version: ProtocolVersion,
    script: Vec<DeviceBehavior>,
) -> MockDevice {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        let mut next = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let behavior = script
                .get(next)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or(DeviceBehavior::CloseImmediately);
            next += 1;
            tokio::spawn(handle_connection(stream, key.clone(), version, behavior));
        }
    });

    MockDevice { addr, connections }
}

async fn handle_connection(
    mut stream: TcpStream,
    key: Vec<u8>,
    version: ProtocolVersion,
    behavior: DeviceBehavior,
) {
    match behavior {
        DeviceBehavior::CloseImmediately => {}
        DeviceBehavior::Stall => {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        DeviceBehavior::Garbage => {
            let _ = stream.write_all(&[0xAB; 64]).await;
        }
        DeviceBehavior::Serve(_)
        | DeviceBehavior::ServeOnce(_)
        | DeviceBehavior::RespondError(_) => {
            serve_loop(&mut stream, &key, version, &behavior).await;
        }
    }
}

async fn read_raw_frame(stream: &mut TcpStream, version: ProtocolVersion) -> Option<Vec<u8>> {
    let mut frame = vec![0u8; codec::header_len(version)];
    stream.read_exact(&mut frame).await.ok()?;
    let rest = codec::header_meta(version, &frame).ok()?;
    let offset = frame.len();
    frame.resize(offset + rest, 0);
    stream.read_exact(&mut frame[offset..]).await.ok()?;
    Some(frame)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn status_body(behavior: &DeviceBehavior, version: ProtocolVersion) -> (u32, Vec<u8>) {
    match behavior {
        DeviceBehavior::Serve(dps) | DeviceBehavior::ServeOnce(dps) => {
            let body = match version {
                ProtocolVersion::V33 => json!({ "dps": dps }),
                ProtocolVersion::V35 => json!({ "protocol": 4, "t": 0, "data": { "dps": dps } }),
            };
            (0, body.to_string().into_bytes())
        }
        DeviceBehavior::RespondError(code) => {
            (*code, json!({ "msg": "device error" }).to_string().into_bytes())
        }
        _ => (1, Vec::new()),
    }
}

async fn serve_loop(
    stream: &mut TcpStream,
    key: &[u8],
    version: ProtocolVersion,
    behavior: &DeviceBehavior,
) {
    const DEVICE_NONCE: [u8; 16] = [0x42; 16];
    let mut session_key: Option<[u8; 16]> = None;
    let mut pending_local_nonce: Option<[u8; 16]> = None;

    loop {
        let Some(frame) = read_raw_frame(stream, version).await else {
            return;
        };
        match version {
            ProtocolVersion::V33 => {
                // Respond sealed with our key regardless of whether the
                // request decrypts; a mismatched client detects the key
                // problem on our reply.
                let seqno = be_u32(&frame[4..8]);
                let (retcode, body) = status_body(behavior, version);
                let reply =
                    codec::seal_55aa(key, seqno, CommandType::DpQuery, Some(retcode), &body)
                        .unwrap();
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
                if matches!(behavior, DeviceBehavior::ServeOnce(_)) {
                    return;
                }
            }
            ProtocolVersion::V35 => {
                let seqno = be_u32(&frame[6..10]);
                match be_u32(&frame[10..14]) {
                    0x03 => {
                        let local_nonce: [u8; 16] = match codec::parse_6699(key, &frame, false) {
                            Ok(parsed) if parsed.payload.len() >= 16 => {
                                let mut nonce = [0u8; 16];
                                nonce.copy_from_slice(&parsed.payload[..16]);
                                nonce
                            }
                            // Undecryptable start (key mismatch): answer
                            // anyway so the client can detect it.
                            _ => [0u8; 16],
                        };
                        let mut payload = Vec::new();
                        payload.extend_from_slice(&DEVICE_NONCE);
                        payload.extend_from_slice(&codec::hmac_proof(key, &local_nonce).unwrap());
                        pending_local_nonce = Some(local_nonce);
                        let reply = codec::seal_6699(
                            key,
                            seqno,
                            CommandType::SessKeyNegResp,
                            Some(0),
                            &payload,
                            &[7u8; codec::GCM_NONCE_LEN],
                        )
                        .unwrap();
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                    0x05 => {
                        if let Some(local_nonce) = pending_local_nonce {
                            session_key =
                                Some(codec::session_key(key, &local_nonce, &DEVICE_NONCE).unwrap());
                        }
                    }
                    0x10 => {
                        let reply_key: Vec<u8> = session_key
                            .map(|k| k.to_vec())
                            .unwrap_or_else(|| key.to_vec());
                        let (retcode, body) = status_body(behavior, version);
                        let reply = codec::seal_6699(
                            &reply_key,
                            seqno,
                            CommandType::DpQueryNew,
                            Some(retcode),
                            &body,
                            &[9u8; codec::GCM_NONCE_LEN],
                        )
                        .unwrap();
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                        if matches!(behavior, DeviceBehavior::ServeOnce(_)) {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// In-process stand-in for the time-series store: a last-write-wins
/// `(metric, timestamp_ms)` map behind the import/export HTTP endpoints.
#[derive(Clone, Default)]
pub struct MockStore {
    pub points: Arc<Mutex<BTreeMap<(String, i64), f64>>>,
    /// While non-zero, import requests fail with 500 and decrement.
    pub fail_next: Arc<AtomicU32>,
    pub import_attempts: Arc<AtomicU32>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, metric: &str, ts_ms: i64, value: f64) {
        self.points
            .lock()
            .unwrap()
            .insert((metric.to_string(), ts_ms), value);
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    pub fn value_at(&self, metric: &str, ts_ms: i64) -> Option<f64> {
        self.points
            .lock()
            .unwrap()
            .get(&(metric.to_string(), ts_ms))
            .copied()
    }

    pub fn import_attempts(&self) -> u32 {
        self.import_attempts.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/import/prometheus", post(mock_import))
            .route("/api/v1/export", get(mock_export))
            .with_state(self.clone())
    }
}

async fn mock_import(State(store): State<MockStore>, body: String) -> StatusCode {
    store.import_attempts.fetch_add(1, Ordering::SeqCst);
    if store.fail_next.load(Ordering::SeqCst) > 0 {
        store.fail_next.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let mut points = store.points.lock().unwrap();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(series), Some(value), Some(ts)) = (parts.next(), parts.next(), parts.next())
        else {
            return StatusCode::BAD_REQUEST;
        };
        let name = series.split('{').next().unwrap_or(series).to_string();
        let (Ok(value), Ok(ts)) = (value.parse::<f64>(), ts.parse::<i64>()) else {
            return StatusCode::BAD_REQUEST;
        };
        points.insert((name, ts), value);
    }
    StatusCode::NO_CONTENT
}

async fn mock_export(
    State(store): State<MockStore>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(metric) = params.get("match[]") else {
        return (StatusCode::BAD_REQUEST, "missing match[]".to_string());
    };
    let start_ms = params
        .get("start")
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(i64::MIN);
    let end_ms = params
        .get("end")
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(|secs| secs.saturating_mul(1000).saturating_add(999))
        .unwrap_or(i64::MAX);

    let points = store.points.lock().unwrap();
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    for ((name, ts), value) in points.iter() {
        if name == metric && (start_ms..=end_ms).contains(ts) {
            timestamps.push(*ts);
            values.push(*value);
        }
    }
    if timestamps.is_empty() {
        return (StatusCode::OK, String::new());
    }
    let line = json!({
        "metric": { "__name__": metric },
        "values": values,
        "timestamps": timestamps,
    });
    (StatusCode::OK, format!("{line}\n"))
}

pub async fn spawn_mock_store(store: MockStore) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = store.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

/// Server state wired to a freshly spawned mock store.
pub async fn test_state(store: &MockStore) -> crate::state::AppState {
    let base = spawn_mock_store(store.clone()).await;
    crate::state::AppState {
        config: crate::config::ServerConfig {
            victoria_url: base.clone(),
            current_staleness_secs: 900,
        },
        store: crate::store::VictoriaStore::new(&base, reqwest::Client::new()),
    }
}
