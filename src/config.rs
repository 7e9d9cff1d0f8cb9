use crate::audio::BitDepth;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Whole seconds counted down before recording begins (0 starts at once)
    #[serde(default = "default_countdown_seconds")]
    pub countdown_seconds: u32,

    #[serde(default = "default_click_track_enabled")]
    pub click_track_enabled: bool,

    #[serde(default = "default_click_volume")]
    pub click_volume: f32,

    /// Guide melody playback volume during a take
    #[serde(default = "default_guide_volume")]
    pub guide_volume: f32,

    /// Input device name; the system default when unset
    #[serde(default)]
    pub input_device: Option<String>,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_export_bit_depth")]
    pub export_bit_depth: u16,

    #[serde(default = "default_primary_gain")]
    pub primary_gain: f32,

    #[serde(default = "default_guide_gain")]
    pub guide_gain: f32,

    /// Also export the take mixed with the rendered guide melody
    #[serde(default)]
    pub mix_guide_on_export: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Shell command run after each export, with GHOSTNOTE_FILE set
    #[serde(default)]
    pub post_export_hook: Option<String>,
}

fn default_countdown_seconds() -> u32 {
    3
}

fn default_click_track_enabled() -> bool {
    true
}

fn default_click_volume() -> f32 {
    0.5
}

fn default_guide_volume() -> f32 {
    0.7
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_export_bit_depth() -> u16 {
    16
}

fn default_primary_gain() -> f32 {
    1.0
}

fn default_guide_gain() -> f32 {
    0.5
}

fn default_output_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join("Music").join("ghostnote"),
        Err(_) => PathBuf::from("ghostnote"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            countdown_seconds: default_countdown_seconds(),
            click_track_enabled: default_click_track_enabled(),
            click_volume: default_click_volume(),
            guide_volume: default_guide_volume(),
            input_device: None,
            sample_rate: default_sample_rate(),
            export_bit_depth: default_export_bit_depth(),
            primary_gain: default_primary_gain(),
            guide_gain: default_guide_gain(),
            mix_guide_on_export: false,
            output_dir: default_output_dir(),
            post_export_hook: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/ghostnote/config.json)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let config = Self::load_from(&config_path)?;
        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("ghostnote").join("config.json"))
    }

    pub fn bit_depth(&self) -> Result<BitDepth> {
        BitDepth::try_from(self.export_bit_depth)
            .with_context(|| format!("Unsupported export_bit_depth: {}", self.export_bit_depth))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("click_volume", self.click_volume),
            ("guide_volume", self.guide_volume),
            ("primary_gain", self.primary_gain),
            ("guide_gain", self.guide_gain),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1", name));
            }
        }

        if !(8000..=192_000).contains(&self.sample_rate) {
            return Err(anyhow::anyhow!(
                "sample_rate must be between 8000 and 192000"
            ));
        }

        self.bit_depth()?;

        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("output_dir cannot be empty"));
        }

        Ok(())
    }
}
