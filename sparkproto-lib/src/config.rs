use crate::constants::{DEFAULT_CHUNK_SIZE, MAX_BINARY_SIZE, MAX_CHUNK_SIZE, MAX_MISSED_CHUNKS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts bounding the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Ceiling on the whole handshake, whatever step it is in.
    #[serde(with = "secs")]
    pub global_timeout: Duration,
    /// How long to wait for the device Hello once the cipher is running.
    #[serde(with = "secs")]
    pub hello_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(120),
            hello_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Disconnect when the device sends nothing for this long.
    #[serde(with = "secs")]
    pub socket_timeout: Duration,
    /// Upper bound on any single wait for a device response.
    #[serde(with = "secs")]
    pub keepalive_timeout: Duration,
    /// Extra wait for the second DescribeReturn some firmware sends.
    #[serde(with = "secs")]
    pub describe_followup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(31),
            keepalive_timeout: Duration::from_secs(15),
            describe_followup_timeout: Duration::from_secs(3),
        }
    }
}

/// OTA transfer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub chunk_size: usize,
    pub max_binary_size: usize,
    /// Offer fast OTA in UpdateBegin.
    pub fast_ota: bool,
    /// UpdateBegin resends before the final long wait.
    pub begin_retries: u32,
    #[serde(with = "secs")]
    pub begin_retry_interval: Duration,
    #[serde(with = "secs")]
    pub begin_final_timeout: Duration,
    /// Wait for a single ChunkReceived before resending that chunk.
    #[serde(with = "secs")]
    pub chunk_ack_timeout: Duration,
    /// Ceiling on the whole send phase.
    #[serde(with = "secs")]
    pub send_timeout: Duration,
    /// Quiet period after the last missed-chunk report before finishing.
    #[serde(with = "secs")]
    pub missed_chunk_window: Duration,
    pub missed_chunk_slack: i64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_binary_size: MAX_BINARY_SIZE,
            fast_ota: true,
            begin_retries: 3,
            begin_retry_interval: Duration::from_secs(6),
            begin_final_timeout: Duration::from_secs(90),
            chunk_ack_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(600),
            missed_chunk_window: Duration::from_secs(60),
            missed_chunk_slack: MAX_MISSED_CHUNKS,
        }
    }
}

impl FlashConfig {
    /// Clamp the chunk size into the range the firmware accepts.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }
}

/// Durations are written as whole seconds in configuration files.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: FlashConfig = serde_json::from_str(r#"{"chunk_size": 512, "send_timeout": 30}"#).unwrap();
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.send_timeout, Duration::from_secs(30));
        assert_eq!(cfg.begin_retries, 3);
        assert_eq!(cfg.begin_final_timeout, Duration::from_secs(90));
    }

    #[test]
    fn chunk_size_is_clamped() {
        let cfg = FlashConfig {
            chunk_size: 4096,
            ..FlashConfig::default()
        };
        assert_eq!(cfg.effective_chunk_size(), MAX_CHUNK_SIZE);
    }
}
