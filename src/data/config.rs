//! Application Configuration
//!
//! Loading and saving of the recognized tunables: speech watchdogs and the
//! muted-restart windows, link retry and pacing, and word delivery retry.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// Load configuration from `path` or create the default file there.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Speech engine controller tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Preemptive engine restart after this long without a partial result,
    /// ahead of the platform's own (audible) silence timeout.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Force a full engine recreation when STARTING/STOPPING wedges.
    #[serde(default = "default_stuck_timeout_ms")]
    pub stuck_timeout_ms: u64,
    /// Hard restart after this many completed segments.
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: u32,
    /// Hard restart after this long regardless of segment count.
    #[serde(default = "default_hard_restart_interval_secs")]
    pub hard_restart_interval_secs: u64,
    /// Wait for the mute to propagate before tearing the engine down.
    #[serde(default = "default_mute_propagation_delay_ms")]
    pub mute_propagation_delay_ms: u64,
    /// Wait for the audio hardware to release before starting the engine.
    #[serde(default = "default_hardware_release_delay_ms")]
    pub hardware_release_delay_ms: u64,
    /// Keep output muted this long after start so the start tone is inaudible.
    #[serde(default = "default_beep_suppression_window_ms")]
    pub beep_suppression_window_ms: u64,
    /// Fallback unmute in case the restart sequence stalls.
    #[serde(default = "default_safety_unmute_ms")]
    pub safety_unmute_ms: u64,
    /// Disable auto-restart after this many consecutive errors.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_silence_timeout_ms() -> u64 {
    4000
}

fn default_stuck_timeout_ms() -> u64 {
    10_000
}

fn default_segment_threshold() -> u32 {
    20
}

fn default_hard_restart_interval_secs() -> u64 {
    300
}

fn default_mute_propagation_delay_ms() -> u64 {
    50
}

fn default_hardware_release_delay_ms() -> u64 {
    50
}

fn default_beep_suppression_window_ms() -> u64 {
    300
}

fn default_safety_unmute_ms() -> u64 {
    1500
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout_ms(),
            stuck_timeout_ms: default_stuck_timeout_ms(),
            segment_threshold: default_segment_threshold(),
            hard_restart_interval_secs: default_hard_restart_interval_secs(),
            mute_propagation_delay_ms: default_mute_propagation_delay_ms(),
            hardware_release_delay_ms: default_hardware_release_delay_ms(),
            beep_suppression_window_ms: default_beep_suppression_window_ms(),
            safety_unmute_ms: default_safety_unmute_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl SpeechConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    pub fn hard_restart_interval(&self) -> Duration {
        Duration::from_secs(self.hard_restart_interval_secs)
    }
}

/// Radio link tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
    #[serde(default = "default_chunk_write_attempts")]
    pub chunk_write_attempts: u32,
    #[serde(default = "default_chunk_backoff_base_ms")]
    pub chunk_backoff_base_ms: u64,
    #[serde(default = "default_inter_chunk_delay_ms")]
    pub inter_chunk_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive decrypt/reassembly failures before a degraded-link warning.
    #[serde(default = "default_degraded_link_threshold")]
    pub degraded_link_threshold: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_backoff_base_ms")]
    pub reconnect_backoff_base_ms: u64,
    #[serde(default = "default_reconnect_backoff_cap_ms")]
    pub reconnect_backoff_cap_ms: u64,
}

fn default_pairing_timeout_secs() -> u64 {
    30
}

fn default_chunk_write_attempts() -> u32 {
    3
}

fn default_chunk_backoff_base_ms() -> u64 {
    100
}

fn default_inter_chunk_delay_ms() -> u64 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_degraded_link_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_reconnect_backoff_base_ms() -> u64 {
    500
}

fn default_reconnect_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            pairing_timeout_secs: default_pairing_timeout_secs(),
            chunk_write_attempts: default_chunk_write_attempts(),
            chunk_backoff_base_ms: default_chunk_backoff_base_ms(),
            inter_chunk_delay_ms: default_inter_chunk_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            degraded_link_threshold: default_degraded_link_threshold(),
            auto_reconnect: default_true(),
            reconnect_backoff_base_ms: default_reconnect_backoff_base_ms(),
            reconnect_backoff_cap_ms: default_reconnect_backoff_cap_ms(),
        }
    }
}

impl LinkConfig {
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Word delivery tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_word_send_attempts")]
    pub word_send_attempts: u32,
    #[serde(default = "default_word_retry_delay_ms")]
    pub word_retry_delay_ms: u64,
}

fn default_word_send_attempts() -> u32 {
    3
}

fn default_word_retry_delay_ms() -> u64 {
    50
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            word_send_attempts: default_word_send_attempts(),
            word_retry_delay_ms: default_word_retry_delay_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn word_retry_delay(&self) -> Duration {
        Duration::from_millis(self.word_retry_delay_ms)
    }
}
