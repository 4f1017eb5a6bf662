//! RPC configuration types and defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by callers and dispatchers.
///
/// Durations are stored in milliseconds so the structure maps directly onto
/// a `[rpc]` TOML table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long a call may stay pending before it is rejected (0 disables).
    pub call_timeout_ms: u64,

    /// How long `Caller::connect` waits for the TCP handshake.
    pub connect_timeout_ms: u64,

    /// Largest frame accepted or sent on a TCP connection, in bytes.
    pub max_frame_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            max_frame_size: 10 * 1024 * 1024,
        }
    }
}

impl RpcConfig {
    /// Per-call timeout, or `None` when call expiry is disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Sets the per-call timeout, rounded up to whole milliseconds.
    ///
    /// Only `Duration::ZERO` disables expiry.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.call_timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than zero".to_string());
        }
        if self.max_frame_size < 64 {
            return Err(format!(
                "max_frame_size must be at least 64 bytes, got {}",
                self.max_frame_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_config_default() {
        let config = RpcConfig::default();
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_call_timeout_disables_expiry() {
        let config = RpcConfig {
            call_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.call_timeout(), None);
    }

    #[test]
    fn test_sub_millisecond_timeout_still_expires() {
        let config = RpcConfig::default().with_call_timeout(Duration::from_micros(300));
        assert_eq!(config.call_timeout_ms, 1);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(1)));

        let config = RpcConfig::default().with_call_timeout(Duration::from_micros(1500));
        assert_eq!(config.call_timeout_ms, 2);

        let config = RpcConfig::default().with_call_timeout(Duration::ZERO);
        assert_eq!(config.call_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_tiny_frames() {
        let config = RpcConfig {
            max_frame_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
