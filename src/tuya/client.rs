//! Stateful session client for one device: connect, negotiate a session key
//! on 3.5, issue one status request per poll, classify failures.

use std::io;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::codec::{self, CommandType, FrameError};
use super::ProtocolVersion;
use crate::dps::RawDataPoint;

/// Identity and connection parameters for one physical device. Loaded once
/// from configuration and immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub local_key: Vec<u8>,
    pub version: ProtocolVersion,
}

/// Live connection state to one endpoint. Owned by the poll scheduler and
/// replaced wholesale on reconnect; never patched in place.
#[derive(Debug)]
pub struct DeviceSession {
    stream: TcpStream,
    session_key: Option<[u8; 16]>,
    seqno: u32,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to connect to device: {0}")]
    Connect(#[source] io::Error),
    #[error("device i/o failed: {0}")]
    Io(#[source] io::Error),
    #[error("device request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed device frame: {0}")]
    Frame(#[source] FrameError),
    #[error("device authentication failed: {0}")]
    Auth(String),
    #[error("device returned error code {0}")]
    Device(u32),
    #[error("unexpected device response: {0}")]
    Payload(String),
}

impl PollError {
    /// Persistent failures cannot resolve without operator action (a wrong
    /// local secret stays wrong); everything else is worth retrying.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

fn classify_frame(err: FrameError) -> PollError {
    match err {
        // A frame that passed integrity checks but will not decrypt means
        // the shared secret (or negotiated session key) is wrong.
        FrameError::Decrypt | FrameError::Crypto => PollError::Auth(
            "payload decryption failed; local key or protocol version mismatch".to_string(),
        ),
        other => PollError::Frame(other),
    }
}

pub struct DeviceClient {
    endpoint: DeviceEndpoint,
    timeout: Duration,
}

impl DeviceClient {
    pub fn new(endpoint: DeviceEndpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Issue one status request, connecting (and on 3.5, negotiating a
    /// session key) first if no live session exists. The session is handed
    /// back through `session` even on failure; the scheduler decides when a
    /// channel is no longer worth reusing.
    pub async fn poll(
        &self,
        session: &mut Option<DeviceSession>,
    ) -> Result<Vec<RawDataPoint>, PollError> {
        let mut live = match session.take() {
            Some(live) => live,
            None => self.connect().await?,
        };
        let result = self.status(&mut live).await;
        *session = Some(live);
        result
    }

    async fn connect(&self) -> Result<DeviceSession, PollError> {
        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let stream = match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Err(_) => return Err(PollError::Timeout(self.timeout)),
            Ok(Err(err)) => return Err(PollError::Connect(err)),
            Ok(Ok(stream)) => stream,
        };
        let mut session = DeviceSession {
            stream,
            session_key: None,
            seqno: 1,
        };
        if self.endpoint.version == ProtocolVersion::V35 {
            self.negotiate(&mut session).await?;
        }
        tracing::debug!(
            device = %self.endpoint.device_id,
            version = %self.endpoint.version,
            "device channel established"
        );
        Ok(session)
    }

    /// Three-way nonce exchange that proves both sides hold the local key
    /// and derives the per-connection session key.
    async fn negotiate(&self, session: &mut DeviceSession) -> Result<(), PollError> {
        let mut local_nonce = [0u8; codec::SESSION_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut local_nonce);
        self.send(session, CommandType::SessKeyNegStart, &local_nonce)
            .await?;

        let resp = self.read_frame(session).await?;
        if resp.command != CommandType::SessKeyNegResp {
            return Err(PollError::Payload(format!(
                "expected session negotiation response, got {:?}",
                resp.command
            )));
        }
        if resp.retcode != 0 {
            return Err(PollError::Device(resp.retcode));
        }
        if resp.payload.len() < codec::SESSION_NONCE_LEN + 32 {
            return Err(PollError::Payload(
                "session negotiation response too short".to_string(),
            ));
        }
        let mut remote_nonce = [0u8; codec::SESSION_NONCE_LEN];
        remote_nonce.copy_from_slice(&resp.payload[..codec::SESSION_NONCE_LEN]);
        let proof = &resp.payload[codec::SESSION_NONCE_LEN..codec::SESSION_NONCE_LEN + 32];
        if !codec::verify_hmac_proof(&self.endpoint.local_key, &local_nonce, proof)
            .map_err(classify_frame)?
        {
            return Err(PollError::Auth(
                "device nonce proof does not match the local key".to_string(),
            ));
        }

        let finish =
            codec::hmac_proof(&self.endpoint.local_key, &remote_nonce).map_err(classify_frame)?;
        self.send(session, CommandType::SessKeyNegFinish, &finish)
            .await?;

        let key = codec::session_key(&self.endpoint.local_key, &local_nonce, &remote_nonce)
            .map_err(classify_frame)?;
        session.session_key = Some(key);
        Ok(())
    }

    async fn status(&self, session: &mut DeviceSession) -> Result<Vec<RawDataPoint>, PollError> {
        let (command, request) = match self.endpoint.version {
            ProtocolVersion::V33 => {
                let body = serde_json::json!({
                    "gwId": self.endpoint.device_id,
                    "devId": self.endpoint.device_id,
                    "uid": self.endpoint.device_id,
                    "t": Utc::now().timestamp().to_string(),
                });
                (CommandType::DpQuery, body.to_string().into_bytes())
            }
            ProtocolVersion::V35 => (CommandType::DpQueryNew, b"{}".to_vec()),
        };

        self.send(session, command, &request).await?;
        let frame = self.read_frame(session).await?;
        if frame.retcode != 0 {
            return Err(PollError::Device(frame.retcode));
        }
        match frame.command {
            CommandType::DpQuery | CommandType::DpQueryNew | CommandType::Status => {}
            other => {
                return Err(PollError::Payload(format!(
                    "expected status response, got {other:?}"
                )))
            }
        }
        self.parse_status_payload(&frame.payload)
    }

    fn parse_status_payload(&self, payload: &[u8]) -> Result<Vec<RawDataPoint>, PollError> {
        let root: JsonValue = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                return Err(match self.endpoint.version {
                    // 3.3 payloads carry no authentication tag; a CRC-valid
                    // frame that decrypts to garbage means the key is wrong.
                    ProtocolVersion::V33 => PollError::Auth(format!(
                        "decrypted status payload is not JSON ({err}); local key likely wrong"
                    )),
                    ProtocolVersion::V35 => {
                        PollError::Payload(format!("status payload is not JSON: {err}"))
                    }
                });
            }
        };

        let dps = root
            .get("dps")
            .or_else(|| root.get("data").and_then(|data| data.get("dps")))
            .and_then(JsonValue::as_object)
            .ok_or_else(|| PollError::Payload("status response has no dps object".to_string()))?;

        let mut points = Vec::with_capacity(dps.len());
        for (slot, value) in dps {
            match slot.parse::<u32>() {
                Ok(code) => points.push(RawDataPoint {
                    code,
                    value: value.clone(),
                }),
                Err(_) => tracing::debug!(slot = %slot, "ignoring non-numeric dps slot"),
            }
        }
        Ok(points)
    }

    async fn send(
        &self,
        session: &mut DeviceSession,
        command: CommandType,
        payload: &[u8],
    ) -> Result<(), PollError> {
        let seqno = session.seqno;
        session.seqno = session.seqno.wrapping_add(1);
        let frame = match self.endpoint.version {
            ProtocolVersion::V33 => {
                codec::seal_55aa(&self.endpoint.local_key, seqno, command, None, payload)
            }
            ProtocolVersion::V35 => {
                let key: &[u8] = match session.session_key.as_ref() {
                    Some(key) => key,
                    None => &self.endpoint.local_key,
                };
                let mut iv = [0u8; codec::GCM_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                codec::seal_6699(key, seqno, command, None, payload, &iv)
            }
        }
        .map_err(classify_frame)?;
        self.io(session.stream.write_all(&frame)).await
    }

    async fn read_frame(&self, session: &mut DeviceSession) -> Result<codec::Frame, PollError> {
        let mut frame = vec![0u8; codec::header_len(self.endpoint.version)];
        self.io(session.stream.read_exact(&mut frame)).await?;
        let rest = codec::header_meta(self.endpoint.version, &frame).map_err(classify_frame)?;
        let offset = frame.len();
        frame.resize(offset + rest, 0);
        self.io(session.stream.read_exact(&mut frame[offset..]))
            .await?;

        match self.endpoint.version {
            ProtocolVersion::V33 => {
                codec::parse_55aa(&self.endpoint.local_key, &frame, true).map_err(classify_frame)
            }
            ProtocolVersion::V35 => {
                let key: &[u8] = match session.session_key.as_ref() {
                    Some(key) => key,
                    None => &self.endpoint.local_key,
                };
                codec::parse_6699(key, &frame, true).map_err(classify_frame)
            }
        }
    }

    async fn io<T>(
        &self,
        fut: impl std::future::Future<Output = io::Result<T>>,
    ) -> Result<T, PollError> {
        match timeout(self.timeout, fut).await {
            Err(_) => Err(PollError::Timeout(self.timeout)),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PollError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_mock_device, DeviceBehavior, MockDevice};
    use serde_json::json;

    const KEY: &[u8; 16] = b"0123456789abcdef";
    const OTHER_KEY: &[u8; 16] = b"fedcba9876543210";

    fn client_for(device: &MockDevice, key: &[u8; 16], version: ProtocolVersion) -> DeviceClient {
        DeviceClient::new(
            DeviceEndpoint {
                device_id: "bfe0test".to_string(),
                host: "127.0.0.1".to_string(),
                port: device.addr.port(),
                local_key: key.to_vec(),
                version,
            },
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn v35_poll_returns_points_and_reuses_the_session() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::Serve(
                json!({"8": 235, "106": 720, "111": 350}),
            )],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let points = client.poll(&mut session).await.unwrap();
        assert_eq!(points.len(), 3);
        assert!(session.is_some());

        let points = client.poll(&mut session).await.unwrap();
        assert_eq!(points.len(), 3);
        // Two polls over one connection: the session was reused.
        assert_eq!(device.connections(), 1);
    }

    #[tokio::test]
    async fn v33_poll_returns_points() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V33,
            vec![DeviceBehavior::Serve(json!({"8": 235, "131": -50}))],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V33);

        let mut session = None;
        let points = client.poll(&mut session).await.unwrap();
        assert_eq!(points.len(), 2);
    }

    #[tokio::test]
    async fn partial_dps_response_is_success() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::Serve(json!({"8": 235}))],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let points = client.poll(&mut session).await.unwrap();
        assert_eq!(points.len(), 1);
    }

    #[tokio::test]
    async fn v35_wrong_key_is_a_persistent_auth_failure() {
        let device = spawn_mock_device(
            OTHER_KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::Serve(json!({"8": 235}))],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(err.is_persistent(), "expected auth failure, got {err}");
    }

    #[tokio::test]
    async fn v33_wrong_key_is_a_persistent_auth_failure() {
        let device = spawn_mock_device(
            OTHER_KEY.to_vec(),
            ProtocolVersion::V33,
            vec![DeviceBehavior::Serve(json!({"8": 235}))],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V33);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(err.is_persistent(), "expected auth failure, got {err}");
    }

    #[tokio::test]
    async fn stalled_device_times_out_transiently() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::Stall],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(matches!(err, PollError::Timeout(_)));
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn closed_connection_is_a_transient_io_failure() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::CloseImmediately],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(
            matches!(err, PollError::Io(_) | PollError::Connect(_)),
            "unexpected error: {err}"
        );
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_malformed_frame() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::Garbage],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(matches!(err, PollError::Frame(_)), "unexpected error: {err}");
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn device_error_code_is_surfaced_distinctly() {
        let device = spawn_mock_device(
            KEY.to_vec(),
            ProtocolVersion::V35,
            vec![DeviceBehavior::RespondError(1)],
        )
        .await;
        let client = client_for(&device, KEY, ProtocolVersion::V35);

        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(matches!(err, PollError::Device(1)));
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn unreachable_device_fails_to_connect() {
        // Bind a listener to reserve a port, then drop it so nothing is
        // listening there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = DeviceClient::new(
            DeviceEndpoint {
                device_id: "bfe0test".to_string(),
                host: "127.0.0.1".to_string(),
                port,
                local_key: KEY.to_vec(),
                version: ProtocolVersion::V35,
            },
            Duration::from_millis(500),
        );
        let mut session = None;
        let err = client.poll(&mut session).await.unwrap_err();
        assert!(
            matches!(err, PollError::Connect(_) | PollError::Timeout(_)),
            "unexpected error: {err}"
        );
        assert!(!err.is_persistent());
    }
}
