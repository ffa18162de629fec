use crate::script::Voice;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Sample rate of the whole pipeline. Recorder, player and channel must all
/// agree or the audio is corrupted.
pub const SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub story: StoryApiConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// Story/image generation backend (plain HTTP).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryApiConfig {
    #[serde(default = "default_story_base_url")]
    pub base_url: String,

    /// Sent as `X-Access-Code` when present.
    pub access_code: Option<String>,

    /// Sent as `X-OpenAI-Key` when present.
    pub api_key: Option<String>,
}

/// Realtime speech backend (persistent WebSocket).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RealtimeConfig {
    /// Relay endpoint. When set, `credential` is not required and the
    /// connection goes straight to this URL.
    pub endpoint: Option<String>,

    /// API credential for the hosted backend. One of `endpoint` or
    /// `credential` must be present to connect.
    pub credential: Option<String>,

    #[serde(default = "default_realtime_model")]
    pub model: String,

    #[serde(default)]
    pub default_voice: Voice,

    /// Server-side turn detection. Off for scripted storytelling; every
    /// utterance is an explicit one-shot request.
    #[serde(default)]
    pub turn_detection: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaybackConfig {
    /// Completing an event immediately schedules the next one when true;
    /// otherwise the caller drives each step.
    #[serde(default = "default_auto_advance")]
    pub auto_advance: bool,

    /// A `playing` event with no terminal signal within this window is
    /// reverted to `pending`.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
}

fn default_story_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview-2024-10-01".to_string()
}

fn default_auto_advance() -> bool {
    true
}

fn default_watchdog_secs() -> u64 {
    30
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credential: None,
            model: default_realtime_model(),
            default_voice: Voice::default(),
            turn_detection: false,
        }
    }
}

impl Default for StoryApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_story_base_url(),
            access_code: None,
            api_key: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            auto_advance: default_auto_advance(),
            watchdog_secs: default_watchdog_secs(),
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }
        Self::load_from(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = serde_yaml_ng::from_str("realtime:\n  credential: sk-test\n").unwrap();
        assert_eq!(config.story.base_url, "http://localhost:8000");
        assert_eq!(config.realtime.credential.as_deref(), Some("sk-test"));
        assert_eq!(config.realtime.default_voice, Voice::Sage);
        assert!(config.playback.auto_advance);
        assert_eq!(config.playback.watchdog_secs, 30);
    }

    #[test]
    fn round_trips_through_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");

        let mut config = Config::default();
        config.realtime.endpoint = Some("ws://localhost:8081".to_string());
        config.playback.auto_advance = false;
        config.save_to(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(
            loaded.realtime.endpoint.as_deref(),
            Some("ws://localhost:8081")
        );
        assert!(!loaded.playback.auto_advance);
        Ok(())
    }
}
