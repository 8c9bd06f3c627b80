//! Error types returned by the audio output layer.
//!
//! Native layers work with `anyhow::Result` and attach context; the backend
//! boundary maps those failures onto the kinds below so callers can tell a
//! format they should give up on from a write they may retry.

use thiserror::Error;

/// Failure to open a backend. Terminal for that attempt; the caller may
/// retry later or fall back to another backend.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Unknown audio backend: {0}")]
    UnknownBackend(String),

    #[error("Missing open parameter #{index} ({name})")]
    MissingParameter { index: usize, name: &'static str },

    #[error("Invalid open parameter #{index}: {reason}")]
    InvalidParameter { index: usize, reason: String },

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Connection to audio server refused: {0}")]
    ConnectionRefused(String),

    #[error("Failed to start backend thread: {0}")]
    Spawn(String),

    #[error("No audio output method could be opened (tried: {tried})")]
    NoBackendAvailable { tried: String },
}

/// Failure during a single play() call.
#[derive(Error, Debug)]
pub enum PlayError {
    #[error("Unsupported sample width: {0} bits")]
    UnsupportedBits(u16),

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Device refused {requested}-bit samples (offered {negotiated})")]
    FormatMismatch { requested: u16, negotiated: u16 },

    #[error("Device refused {requested} channels (offered {negotiated})")]
    ChannelMismatch { requested: u16, negotiated: u16 },

    #[error("Device parameter negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to open audio device: {0}")]
    DeviceOpen(String),

    #[error("Failed to query device buffer: {0}")]
    DeviceQuery(String),

    #[error("Device has had no free fragment for {waited_ms} ms")]
    DeviceStalled { waited_ms: u64 },

    #[error("Audio write failed: {0}")]
    WriteFailed(String),

    #[error("Server refused to start a flow: {0}")]
    StartFlow(String),

    #[error("Volume {0} out of range -100..=100")]
    VolumeOutOfRange(i32),

    #[error("Device is closed")]
    Closed,
}

impl PlayError {
    /// Stable numeric code per kind.
    pub fn code(&self) -> i32 {
        match self {
            PlayError::UnsupportedBits(_) => -10,
            PlayError::InvalidTrack(_) => -11,
            PlayError::FormatMismatch { .. } => -2,
            PlayError::ChannelMismatch { .. } => -4,
            PlayError::Negotiation(_) => -3,
            PlayError::DeviceOpen(_) => -20,
            PlayError::DeviceQuery(_) => -5,
            PlayError::DeviceStalled { .. } => -7,
            PlayError::WriteFailed(_) => -6,
            PlayError::StartFlow(_) => -30,
            PlayError::VolumeOutOfRange(_) => -12,
            PlayError::Closed => -1,
        }
    }

    /// Whether repeating the same play() later may succeed. Format errors
    /// never will; a dropped connection is reopened on the next call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlayError::DeviceOpen(_)
                | PlayError::DeviceQuery(_)
                | PlayError::DeviceStalled { .. }
                | PlayError::WriteFailed(_)
                | PlayError::StartFlow(_)
        )
    }
}

/// Failure to apply or load audio settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Unknown audio setting: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_are_not_transient() {
        assert!(!PlayError::UnsupportedBits(24).is_transient());
        assert!(!PlayError::FormatMismatch { requested: 16, negotiated: 8 }.is_transient());
        assert!(PlayError::WriteFailed("broken pipe".into()).is_transient());
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            PlayError::UnsupportedBits(24),
            PlayError::InvalidTrack(String::new()),
            PlayError::FormatMismatch { requested: 16, negotiated: 8 },
            PlayError::ChannelMismatch { requested: 2, negotiated: 1 },
            PlayError::Negotiation(String::new()),
            PlayError::DeviceOpen(String::new()),
            PlayError::DeviceQuery(String::new()),
            PlayError::DeviceStalled { waited_ms: 1 },
            PlayError::WriteFailed(String::new()),
            PlayError::StartFlow(String::new()),
            PlayError::VolumeOutOfRange(101),
            PlayError::Closed,
        ];
        let mut codes: Vec<i32> = errors.iter().map(PlayError::code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
