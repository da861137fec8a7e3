use serde::{Deserialize, Serialize};

/// Top-level daemon configuration (§10.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub webrtc: WebrtcSettings,
    #[serde(default)]
    pub adb_expose: AdbExposeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbSettings {
    /// Path to the `adb` executable, or bare `adb` to search `PATH`.
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    /// Per-command timeout in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Retry attempts for transient ADB transport errors.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Per-subscriber video channel depth (§4.4, typical 30).
    #[serde(default = "default_video_buffer_size")]
    pub video_buffer_size: usize,
    /// Per-subscriber audio channel depth (§4.4, typical 60).
    #[serde(default = "default_audio_buffer_size")]
    pub audio_buffer_size: usize,
    /// Grace period for `Source::Stop` (§5, default 2s).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcSettings {
    /// STUN/TURN server URLs (fixed ICE server set, §4.6).
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Grace period for Session teardown (§5, default 5s).
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Peer-connection `disconnected` duration before teardown (§4.6).
    #[serde(default = "default_disconnected_timeout_ms")]
    pub disconnected_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbExposeSettings {
    /// Initial WebSocket reconnect backoff (§4.8, default 1s).
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    /// Reconnect backoff cap (§4.8, default 30s).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-stream flow-control credit window in bytes (§4.8, default 64 KiB).
    #[serde(default = "default_credit_window_bytes")]
    pub credit_window_bytes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            source: SourceSettings::default(),
            webrtc: WebrtcSettings::default(),
            adb_expose: AdbExposeSettings::default(),
        }
    }
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            command_timeout_ms: default_command_timeout_ms(),
            retries: default_retries(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            video_buffer_size: default_video_buffer_size(),
            audio_buffer_size: default_audio_buffer_size(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for WebrtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            teardown_grace_ms: default_teardown_grace_ms(),
            disconnected_timeout_ms: default_disconnected_timeout_ms(),
        }
    }
}

impl Default for AdbExposeSettings {
    fn default() -> Self {
        Self {
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            credit_window_bytes: default_credit_window_bytes(),
        }
    }
}

fn default_adb_path() -> String {
    "adb".to_string()
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_retries() -> u32 {
    1
}
fn default_video_buffer_size() -> usize {
    30
}
fn default_audio_buffer_size() -> usize {
    60
}
fn default_stop_grace_ms() -> u64 {
    2_000
}
fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_teardown_grace_ms() -> u64 {
    5_000
}
fn default_disconnected_timeout_ms() -> u64 {
    10_000
}
fn default_backoff_floor_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_credit_window_bytes() -> u32 {
    64 * 1024
}

impl Config {
    /// Validate configuration, collecting `ERROR:`/`WARNING:`-prefixed issues
    /// rather than failing on the first one (§10.4).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.adb.adb_path.trim().is_empty() {
            issues.push("ERROR: adb.adb_path must not be empty.".to_string());
        }
        if self.adb.command_timeout_ms == 0 {
            issues.push("ERROR: adb.command_timeout_ms must be greater than 0.".to_string());
        }

        if self.source.video_buffer_size == 0 {
            issues.push("ERROR: source.video_buffer_size must be greater than 0.".to_string());
        }
        if self.source.audio_buffer_size == 0 {
            issues.push("ERROR: source.audio_buffer_size must be greater than 0.".to_string());
        }
        if self.source.video_buffer_size < 10 {
            issues.push(
                "WARNING: source.video_buffer_size below 10 may drop frames on any subscriber \
                 hiccup; spec default is 30."
                    .to_string(),
            );
        }

        if self.webrtc.ice_servers.is_empty() {
            issues.push(
                "ERROR: webrtc.ice_servers must not be empty; WebRTC peers behind NAT will fail \
                 to connect."
                    .to_string(),
            );
        }

        if self.adb_expose.backoff_floor_ms == 0 {
            issues.push("ERROR: adb_expose.backoff_floor_ms must be greater than 0.".to_string());
        }
        if self.adb_expose.backoff_cap_ms < self.adb_expose.backoff_floor_ms {
            issues.push(
                "WARNING: adb_expose.backoff_cap_ms is below backoff_floor_ms; backoff will not \
                 grow."
                    .to_string(),
            );
        }
        if self.adb_expose.credit_window_bytes == 0 {
            issues.push(
                "ERROR: adb_expose.credit_window_bytes must be greater than 0, or every stream \
                 deadlocks on the first send."
                    .to_string(),
            );
        }

        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::default()
    }

    fn validate_issues(config: &Config) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues.iter().any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.adb.adb_path, "adb");
        assert_eq!(config.source.video_buffer_size, 30);
        assert_eq!(config.source.audio_buffer_size, 60);
        assert_eq!(config.webrtc.teardown_grace_ms, 5_000);
        assert_eq!(config.adb_expose.backoff_floor_ms, 1_000);
        assert_eq!(config.adb_expose.backoff_cap_ms, 30_000);
        assert_eq!(config.adb_expose.credit_window_bytes, 64 * 1024);
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_zero_video_buffer_is_error() {
        let mut config = valid_config();
        config.source.video_buffer_size = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "video_buffer_size"));
    }

    #[test]
    fn validate_small_video_buffer_is_warning_not_error() {
        let mut config = valid_config();
        config.source.video_buffer_size = 5;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "video_buffer_size"));
        assert!(!has_error(&issues, "video_buffer_size"));
    }

    #[test]
    fn validate_empty_ice_servers_is_error() {
        let mut config = valid_config();
        config.webrtc.ice_servers.clear();
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "ice_servers"));
    }

    #[test]
    fn validate_backoff_cap_below_floor_is_warning() {
        let mut config = valid_config();
        config.adb_expose.backoff_cap_ms = 500;
        config.adb_expose.backoff_floor_ms = 1_000;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "backoff_cap_ms"));
    }

    #[test]
    fn validate_zero_credit_window_is_error() {
        let mut config = valid_config();
        config.adb_expose.credit_window_bytes = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "credit_window_bytes"));
    }
}
