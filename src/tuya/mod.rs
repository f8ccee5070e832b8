//! Tuya local-protocol device access: wire codec and stateful session client.

pub mod client;
pub mod codec;

pub use client::{DeviceClient, DeviceEndpoint, DeviceSession, PollError};

/// Wire generations handled by this client. The 8-in-1 testers ship 3.3 or
/// 3.5; other versions are rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V33,
    V35,
}

impl ProtocolVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "3.3" => Some(Self::V33),
            "3.5" => Some(Self::V35),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V33 => "3.3",
            Self::V35 => "3.5",
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
