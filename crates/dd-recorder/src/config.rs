use anyhow::{Context, Result};
use dd_capture::{CaptureConfig, CaptureMode};
use dd_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recorder: RecorderConfig,
    pub backend: Backend,
    pub capture: CaptureConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub name: String,
    /// Stop after this many seconds. Runs until Ctrl+C when unset.
    pub duration_secs: Option<u64>,
    /// JSON run report written on exit.
    pub report: Option<PathBuf>,
    /// Number of monitors the synthetic backend pretends to have.
    pub synthetic_outputs: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Desktop duplication on Windows, synthetic elsewhere.
    #[default]
    Auto,
    Win32,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            name: "Desktop Recorder".into(),
            duration_secs: None,
            report: None,
            synthetic_outputs: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate().context("Invalid capture settings")?;
        self.engine.validate().context("Invalid engine settings")?;

        if self.recorder.duration_secs == Some(0) {
            anyhow::bail!("Invalid duration (must be at least 1 second)");
        }

        if self.backend != Backend::Win32 && self.recorder.synthetic_outputs == 0 {
            anyhow::bail!("Synthetic backend needs at least one output");
        }

        if self.backend == Backend::Win32 && !cfg!(windows) {
            anyhow::bail!("Desktop duplication is only available on Windows");
        }

        Ok(())
    }

    pub fn describe_mode(&self) -> String {
        match &self.capture.mode {
            CaptureMode::Single { output, region: Some(region) } => {
                format!("output {} region {:?}", output, region)
            }
            CaptureMode::Single { output, region: None } => format!("output {}", output),
            CaptureMode::Desktop { output: Some(output) } => format!("desktop (output {} only)", output),
            CaptureMode::Desktop { output: None } => "desktop (all outputs)".into(),
        }
    }
}
