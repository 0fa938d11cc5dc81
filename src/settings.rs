use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Empty means the system default input.
    #[serde(default)]
    pub mic_device: String,
    /// Empty means the system default output.
    #[serde(default)]
    pub speaker_device: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,
    #[serde(default = "default_end_of_utterance_silence_ms")]
    pub end_of_utterance_silence_ms: u32,
    /// Push-to-talk: only an explicit stop ends an utterance.
    #[serde(default)]
    pub manual_endpointing: bool,
    /// webrtc-vad aggressiveness, 0 (quality) to 3 (very aggressive).
    #[serde(default)]
    pub vad_mode: u8,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_goodbye_notice")]
    pub goodbye_notice: String,
    #[serde(default = "default_true")]
    pub usage_logging: bool,
}

impl Settings {
    pub fn mic_device(&self) -> Option<&str> {
        non_empty(&self.mic_device)
    }

    pub fn speaker_device(&self) -> Option<&str> {
        non_empty(&self.speaker_device)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs.max(1))
    }

    /// Transport configuration with a freshly generated client id.
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.server_url.clone());
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs.max(1));
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs.max(1));
        config.max_missed_heartbeats = self.max_missed_heartbeats.max(1);
        config.reconnect_base = Duration::from_millis(self.reconnect_base_ms);
        config.reconnect_max_attempts = self.reconnect_max_attempts;
        config
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            mic_device: String::new(),
            speaker_device: String::new(),
            sample_rate: default_sample_rate(),
            chunk_ms: default_chunk_ms(),
            end_of_utterance_silence_ms: default_end_of_utterance_silence_ms(),
            manual_endpointing: false,
            vad_mode: 0,
            volume: default_volume(),
            connect_timeout_secs: default_connect_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            goodbye_notice: default_goodbye_notice(),
            usage_logging: true,
        }
    }
}

fn default_server_url() -> String {
    "ws://localhost:8000/ws".into()
}
fn default_sample_rate() -> u32 {
    16_000
}
fn default_chunk_ms() -> u32 {
    200
}
fn default_end_of_utterance_silence_ms() -> u32 {
    1_500
}
fn default_volume() -> f32 {
    1.0
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_missed_heartbeats() -> u32 {
    3
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_attempts() -> u32 {
    5
}
fn default_inactivity_timeout_secs() -> u64 {
    30
}
fn default_goodbye_notice() -> String {
    "Are you still there? I'll hang up for now. Talk to you later.".into()
}
fn default_true() -> bool {
    true
}

/// Data directory shared by settings and the usage log.
pub fn data_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Some(dir.join("EchoFlow"));
    }
    if let Some(home) = dirs::home_dir() {
        return Some(home.join(".echoflow"));
    }
    None
}

pub fn settings_path() -> Result<PathBuf, String> {
    data_dir()
        .map(|dir| dir.join("settings.json"))
        .ok_or_else(|| "Failed to resolve data directory".to_string())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_from(path: &Path) -> Settings {
    let mut settings: Settings = match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => return Settings::default(),
    };
    settings.volume = settings.volume.clamp(0.0, 1.0);
    settings.vad_mode = settings.vad_mode.min(3);
    settings
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    save_to(&path, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_from(&dir.path().join("nope.json"));
        assert_eq!(settings.server_url, "ws://localhost:8000/ws");
        assert_eq!(settings.chunk_ms, 200);
        assert_eq!(settings.inactivity_timeout_secs, 30);
        assert_eq!(settings.mic_device(), None);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"server_url":"wss://voice.example/ws","volume":4.0,"vad_mode":9}"#).unwrap();
        let settings = load_from(&path);
        assert_eq!(settings.server_url, "wss://voice.example/ws");
        assert_eq!(settings.volume, 1.0);
        assert_eq!(settings.vad_mode, 3);
        assert_eq!(settings.reconnect_max_attempts, 5);
    }

    #[test]
    fn files_from_older_versions_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"audio_format":"pcm16","volume":0.4}"#).unwrap();
        let settings = load_from(&path);
        assert_eq!(settings.volume, 0.4);

        save_to(&path, &settings).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("audio_format"));
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_from(&path).heartbeat_interval_secs, 30);
    }

    #[test]
    fn save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.mic_device = "USB Mic".into();
        settings.manual_endpointing = true;
        save_to(&path, &settings).unwrap();

        let loaded = load_from(&path);
        assert_eq!(loaded.mic_device(), Some("USB Mic"));
        assert!(loaded.manual_endpointing);
    }

    #[test]
    fn transport_config_follows_settings() {
        let mut settings = Settings::default();
        settings.server_url = "ws://host/ws/".into();
        settings.reconnect_base_ms = 250;
        settings.heartbeat_interval_secs = 0;
        let config = settings.transport_config();
        assert_eq!(config.reconnect_base, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert!(config.endpoint().starts_with("ws://host/ws/"));
        assert!(config.endpoint().ends_with(&config.client_id));
    }
}
