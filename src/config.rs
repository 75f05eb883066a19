//! Configuration management for doris-voice.
//!
//! Loads config from YAML files in standard locations. Every section falls
//! back to its defaults, so a partial file (or none at all) is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Synthesis executable (Piper-compatible, JSON lines on stdin).
    pub command: String,
    /// Extra arguments passed before the protocol flags.
    pub args: Vec<String>,
    pub model_path: String,
    /// Where the process writes per-request WAV files. Empty = system temp dir.
    pub output_dir: String,
    pub request_timeout_ms: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub queue_depth: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            command: "piper".into(),
            args: vec![],
            model_path: String::new(),
            output_dir: String::new(),
            request_timeout_ms: 15_000,
            max_restarts: 3,
            restart_window_secs: 30,
            backoff_base_ms: 250,
            backoff_max_ms: 2_000,
            queue_depth: 8,
        }
    }
}

impl SynthesisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn output_dir(&self) -> PathBuf {
        if self.output_dir.is_empty() {
            std::env::temp_dir().join("doris-voice")
        } else {
            PathBuf::from(&self.output_dir)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub poll_interval_ms: u64,
    /// How many units may be synthesized ahead of the one playing.
    pub lookahead: u64,
    /// Write every synthesized clip here as WAV (debugging).
    pub dump_dir: Option<PathBuf>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            lookahead: 1,
            dump_dir: None,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub volume: i64,
    pub speed: f32,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            volume: 80,
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub max_unit_chars: usize,
    /// Added to the built-in abbreviation list (without the trailing dot).
    pub abbreviations: Vec<String>,
    pub unit_channel_depth: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_unit_chars: 240,
            abbreviations: vec![],
            unit_channel_depth: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub strip_markdown: bool,
    pub strip_inline_code: bool,
    pub strip_urls: bool,
    pub speak_lists_as_sentences: bool,
    pub normalize_punctuation: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            strip_markdown: true,
            strip_inline_code: true,
            strip_urls: true,
            speak_lists_as_sentences: true,
            normalize_punctuation: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub model: String,
    pub host: String,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2:3b".into(),
            host: "http://localhost:11434".into(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub notifications: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    pub enabled: bool,
    pub user_name: String,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_name: "Dave".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub controls: ControlsConfig,
    pub segmenter: SegmenterConfig,
    pub speech: SpeechConfig,
    pub ollama: OllamaConfig,
    pub api: ApiConfig,
    pub feedback: FeedbackConfig,
    pub greeting: GreetingConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/doris-voice/config.yaml
    /// 3. /etc/doris-voice/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/doris-voice/config.yaml")),
                Some(PathBuf::from("/etc/doris-voice/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::parse("controls:\n  volume: 40\nsynthesis:\n  command: /opt/piper/piper\n").unwrap();
        assert_eq!(config.controls.volume, 40);
        assert_eq!(config.controls.speed, 1.0);
        assert_eq!(config.synthesis.command, "/opt/piper/piper");
        assert_eq!(config.synthesis.max_restarts, 3);
        assert_eq!(config.segmenter.max_unit_chars, 240);
        assert!(config.speech.strip_markdown);
    }

    #[test]
    fn load_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api:\n  port: 9001\nplayback:\n  lookahead: 3").unwrap();

        let config = Config::load(Some(file.path()));
        assert_eq!(config.api.port, 9001);
        assert_eq!(config.playback.lookahead, 3);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "controls: [not, a, map").unwrap();

        let config = Config::load(Some(file.path()));
        assert_eq!(config.controls.volume, 80);
        assert_eq!(config.api.port, 8768);
    }

    #[test]
    fn empty_output_dir_uses_temp() {
        let config = SynthesisConfig::default();
        assert!(config.output_dir().ends_with("doris-voice"));
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }
}
