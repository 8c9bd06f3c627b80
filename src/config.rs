use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{OpenParams, PacingCorrection};
use crate::error::SettingsError;
use crate::logging::Severity;

/// Used when the minimum buffered length is zero or not a number.
pub const DEFAULT_PULSE_MIN_LENGTH: u32 = 100;

/// Audio output configuration.
///
/// Defaults are baked in at compile time from `audio.toml` (see `build.rs`);
/// a runtime file with the same layout overrides them.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    pub audio: OutputSettings,
    pub pacing: PacingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    /// Comma separated backend names, tried in order.
    pub output_methods: String,
    /// ALSA PCM name for the blocking device backend.
    pub alsa_device: Option<String>,
    /// Event server address, e.g. `tcp/localhost:5450`.
    pub flow_server: Option<String>,
    /// Simple-protocol server, `default` for the platform default.
    pub pulse_server: Option<String>,
    /// Minimum buffered audio length in bytes for the simple protocol.
    pub pulse_min_length: u32,
    /// Least severe message an opened device reports.
    pub log_level: Severity,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PacingSettings {
    pub lead_ms: u64,
    pub settle_ms: u64,
    pub max_fragment_wait_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_methods: env!("AUDIO_OUTPUT_METHODS").to_string(),
            alsa_device: Some(env!("AUDIO_ALSA_DEVICE").to_string()),
            flow_server: Some(env!("AUDIO_FLOW_SERVER").to_string()),
            pulse_server: Some(env!("AUDIO_PULSE_SERVER").to_string()),
            pulse_min_length: env!("AUDIO_PULSE_MIN_LENGTH")
                .parse()
                .unwrap_or(DEFAULT_PULSE_MIN_LENGTH),
            log_level: env!("AUDIO_LOG_LEVEL").parse().unwrap_or(Severity::Debug),
        }
    }
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            lead_ms: env!("PACING_LEAD_MS").parse().unwrap_or(100),
            settle_ms: env!("PACING_SETTLE_MS").parse().unwrap_or(50),
            max_fragment_wait_ms: env!("PACING_MAX_FRAGMENT_WAIT_MS").parse().unwrap_or(2000),
        }
    }
}

impl AudioSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply one `key=value` pair in the module settings vocabulary.
    /// The literal value `NULL` clears an optional setting.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let cleared = value == "NULL";
        let optional = |v: &str| if cleared { None } else { Some(v.to_string()) };

        match key {
            "audio_output_method" => {
                self.audio.output_methods = if cleared { String::new() } else { value.to_string() };
            }
            "audio_alsa_device" => self.audio.alsa_device = optional(value),
            "audio_flow_server" => self.audio.flow_server = optional(value),
            "audio_pulse_server" => self.audio.pulse_server = optional(value),
            "audio_pulse_min_length" => {
                self.audio.pulse_min_length = if cleared {
                    DEFAULT_PULSE_MIN_LENGTH
                } else {
                    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?
                };
            }
            "audio_log_level" => {
                self.audio.log_level = if cleared {
                    Severity::Debug
                } else {
                    value.parse().map_err(|_| SettingsError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?
                };
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Backend names from `output_methods`, in preference order.
    pub fn methods(&self) -> Vec<&str> {
        self.audio
            .output_methods
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn pacing(&self) -> PacingCorrection {
        PacingCorrection {
            lead: Duration::from_millis(self.pacing.lead_ms),
            settle: Duration::from_millis(self.pacing.settle_ms),
            max_fragment_wait: Duration::from_millis(self.pacing.max_fragment_wait_ms),
        }
    }

    /// The positional parameter list handed to every backend's open().
    pub fn open_params(&self) -> OpenParams {
        OpenParams::new(vec![
            self.audio.alsa_device.clone(),
            self.audio.flow_server.clone(),
            self.audio.pulse_server.clone(),
            Some(self.audio.pulse_min_length.to_string()),
        ])
        .with_pacing(self.pacing())
    }
}
