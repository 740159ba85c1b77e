use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection settings for the bridge plus the engine's timing knobs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bridge host, optionally with port (e.g. `preamp.local` or `192.168.4.1:8080`)
    pub host: String,
    /// Path of the persistent WebSocket endpoint
    pub ws_path: String,
    /// Per-request timeout of the HTTP fallback
    pub http_timeout_ms: u64,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "preamp.local".to_string(),
            ws_path: "/ws".to_string(),
            http_timeout_ms: 5_000,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.host, self.ws_path)
    }

    pub fn http_base_url(&self) -> String {
        format!("http://{}", self.host)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Timing and sizing of the synchronization engine. All `*_ms` values are milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_volume_ms: u64,
    pub debounce_balance_ms: u64,
    pub debounce_brightness_ms: u64,

    pub full_sync_cooldown_ms: u64,
    pub state_sync_cooldown_ms: u64,

    /// Delay of the state poll that follows a command posted over HTTP
    pub post_command_poll_delay_ms: u64,
    pub http_command_retries: u32,
    pub http_retry_backoff_ms: u64,

    pub reconnect_delay_ms: u64,
    /// A channel handshake that has not completed by then is abandoned
    pub connect_timeout_ms: u64,
    /// How long the channel may stay down before fallback polling starts
    pub fallback_grace_ms: u64,
    pub resume_reconnect_min_interval_ms: u64,
    pub startup_poll_delay_ms: u64,

    pub liveness_check_interval_ms: u64,
    pub liveness_refresh_idle_ms: u64,
    pub liveness_reconnect_idle_ms: u64,

    pub mute_retry_ms: u64,
    pub mute_in_flight_ms: u64,
    pub standby_retry_ms: u64,
    pub standby_in_flight_ms: u64,
    pub tube_retry_ms: u64,
    pub tube_in_flight_ms: u64,
    /// Window after a save in which non-matching tube reports are ignored
    pub tube_save_grace_ms: u64,
    pub delete_confirm_window_ms: u64,

    pub fallback_poll_interval_ms: u64,
    /// Labels, amp states and tubes are fetched on every Nth poll
    pub fallback_meta_poll_every: u32,

    pub queue_capacity: usize,

    pub save_snapshot_delay_ms: u64,
    pub delete_snapshot_delay_ms: u64,
    pub manual_refresh_timeout_ms: u64,
    pub notice_clear_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_volume_ms: 25,
            debounce_balance_ms: 25,
            debounce_brightness_ms: 40,
            full_sync_cooldown_ms: 120,
            state_sync_cooldown_ms: 80,
            post_command_poll_delay_ms: 60,
            http_command_retries: 1,
            http_retry_backoff_ms: 60,
            reconnect_delay_ms: 700,
            connect_timeout_ms: 4_000,
            fallback_grace_ms: 2_200,
            resume_reconnect_min_interval_ms: 2_000,
            startup_poll_delay_ms: 1_200,
            liveness_check_interval_ms: 5_000,
            liveness_refresh_idle_ms: 20_000,
            liveness_reconnect_idle_ms: 45_000,
            mute_retry_ms: 320,
            mute_in_flight_ms: 1_200,
            standby_retry_ms: 450,
            standby_in_flight_ms: 45_000,
            tube_retry_ms: 1_500,
            tube_in_flight_ms: 8_000,
            tube_save_grace_ms: 1_200,
            delete_confirm_window_ms: 7_000,
            fallback_poll_interval_ms: 1_200,
            fallback_meta_poll_every: 12,
            queue_capacity: 48,
            save_snapshot_delay_ms: 250,
            delete_snapshot_delay_ms: 150,
            manual_refresh_timeout_ms: 3_500,
            notice_clear_ms: 1_500,
        }
    }
}

/// Shorthand used by the engine when turning config values into durations
pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            host = "192.168.4.1"

            [sync]
            reconnect_delay_ms = 1000
            queue_capacity = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "192.168.4.1");
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.sync.reconnect_delay_ms, 1000);
        assert_eq!(config.sync.queue_capacity, 8);
        assert_eq!(config.sync.mute_retry_ms, 320);
    }

    #[test]
    fn test_urls() {
        let config = ClientConfig {
            host: "amp:8080".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ws_url(), "ws://amp:8080/ws");
        assert_eq!(config.http_base_url(), "http://amp:8080");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ClientConfig::from_toml_str("host = ["),
            Err(ConfigError::Parse(_))
        ));
    }
}
