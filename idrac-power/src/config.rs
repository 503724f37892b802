//! Settings file and duration handling
//!
//! Handles:
//! - Optional TOML settings (`[defaults]`, `[ssh]`) with built-in defaults
//! - OS-specific settings location
//! - Human-friendly durations (`5m`, `3h`, `1d`, `24`, `0.5h`, `1h30m`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: DefaultsConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub port: u16,
    pub verify_ssl: bool,
    pub max_workers: usize,
    pub sample_interval: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub jumphost_port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            port: 443,
            verify_ssl: true,
            max_workers: crate::fleet::DEFAULT_MAX_WORKERS,
            sample_interval: "5m".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            jumphost_port: crate::model::DEFAULT_JUMPHOST_PORT,
            connect_timeout_secs: 15,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the OS-specific location.
    ///
    /// An explicit path must exist; a missing default file yields built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::config_file_path() {
                Ok(path) => (path, false),
                Err(_) => return Ok(Self::default()),
            },
        };

        if !explicit && !config_path.exists() {
            debug!("No settings file at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read settings file {}", config_path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid settings file {}", config_path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get OS-specific settings file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("idrac-power");
        path.push("config.toml");
        Ok(path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_timeout_secs.max(1))
    }
}

/// Parse `<number>[s|m|h|d]` (bare number = hours), falling back to humantime syntax
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim().to_lowercase();
    if text.is_empty() {
        bail!("Empty duration");
    }

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let duration = match (number.parse::<f64>(), unit) {
        (Ok(value), "" | "s" | "m" | "h" | "d") => {
            let scale = match unit {
                "s" => 1.0,
                "m" => 60.0,
                "d" => 86_400.0,
                _ => 3_600.0,
            };
            Duration::try_from_secs_f64(value * scale)
                .with_context(|| format!("Duration out of range: '{}'", input))?
        }
        _ => humantime::parse_duration(&text).with_context(|| {
            format!(
                "Invalid duration format: '{}'. Use formats like: 5m, 3h, 1d, 24, 0.5h",
                input.trim()
            )
        })?,
    };

    if duration.is_zero() {
        bail!("Duration must be greater than zero: '{}'", input.trim());
    }
    Ok(duration)
}

/// Largest whole-ish unit: `1d`, `2h`, `1.5h`, `5m`, `30s`
pub fn format_duration(duration: Duration) -> String {
    let hours = duration.as_secs_f64() / 3_600.0;

    if hours >= 24.0 && hours % 24.0 == 0.0 {
        return format!("{}d", (hours / 24.0) as u64);
    }
    if hours >= 1.0 {
        return trimmed(hours, "h");
    }

    let minutes = hours * 60.0;
    if minutes >= 1.0 {
        return trimmed(minutes, "m");
    }
    trimmed(hours * 3_600.0, "s")
}

fn trimmed(value: f64, unit: &str) -> String {
    if value.fract() == 0.0 {
        format!("{}{}", value as u64, unit)
    } else {
        format!("{:.1}{}", value, unit)
    }
}
