//! YAML configuration: server address, MIDI ports, learned bindings

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discovery::ServerCandidate;
use crate::protocol::MidiBinding;

const CONFIG_DIR: &str = "mixremote";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub server: ServerConfig,
    pub midi: MidiConfig,
    /// Learned control mappings; rewritten whenever learn captures one
    pub bindings: Vec<MidiBinding>,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Last-used server URL; connected to directly when set
    pub url: Option<String>,
    /// Known servers offered when no URL is set
    pub candidates: Vec<ServerCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MidiConfig {
    /// Substring match against the input port name
    pub input_port: String,
    /// Substring match against the output port name
    pub output_port: String,
    /// Run without a surface when no port matches
    pub optional: bool,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            input_port: String::new(),
            output_port: String::new(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    /// How long an optimistic change may stay unconfirmed
    pub pending_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 3_000,
        }
    }
}

impl TimingConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }
}

impl AppConfig {
    /// Default location: `<user config dir>/mixremote/config.yaml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Load the config, falling back to defaults when the file does not
    /// exist yet. A present-but-broken file is an error, not a silent reset.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        debug!(path = %path.display(), bindings = config.bindings.len(), "Config loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_yaml::to_string(self).context("failed to serialize config")?;
        std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BindTarget;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.midi.optional);
        assert_eq!(config.timing.pending_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = AppConfig::default();
        config.server.url = Some("ws://10.0.0.1:8080/ws".to_string());
        config.server.candidates =
            vec![ServerCandidate::new("FOH", "10.0.0.1", 8080)];
        config.midi.input_port = "X-Touch".to_string();
        config.bindings.push(MidiBinding {
            control_id: "cc7@1".to_string(),
            target: BindTarget::Fader,
            channel: Some(3),
        });

        config.save(&path).unwrap();
        let reloaded = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server: [this is not a mapping").unwrap();
        assert!(AppConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "midi:\n  inputPort: X-Touch\n").unwrap();
        let config = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(config.midi.input_port, "X-Touch");
        assert_eq!(config.timing.pending_timeout_ms, 3_000);
    }
}
