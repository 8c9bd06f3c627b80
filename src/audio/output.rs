//! The contract every audio backend implements.

use std::time::Duration;

use super::track::{ByteOrder, Track};
use crate::error::PlayError;

/// Positions in [`OpenParams`]. Each backend reads only its own slots.
pub const PARAM_ALSA_DEVICE: usize = 0;
pub const PARAM_FLOW_SERVER: usize = 1;
pub const PARAM_PULSE_SERVER: usize = 2;
pub const PARAM_PULSE_MIN_LENGTH: usize = 3;

/// Value meaning "let the platform pick".
pub const DEFAULT_TARGET: &str = "default";

/// Compensation for device double-buffering in the blocking device backend.
///
/// The first wait after a write is shortened by `lead` (capped at the
/// length of that write) so the device never runs dry while the next
/// fragment is prepared; once everything is written the backend waits
/// `lead - settle` more, `settle` approximating the time spent outside the
/// timed waits. Both values are empirical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingCorrection {
    pub lead: Duration,
    pub settle: Duration,
    /// Upper bound on polling for a free fragment before giving up.
    pub max_fragment_wait: Duration,
}

impl Default for PacingCorrection {
    fn default() -> Self {
        Self {
            lead: Duration::from_millis(100),
            settle: Duration::from_millis(50),
            max_fragment_wait: Duration::from_secs(2),
        }
    }
}

/// Backend specific, positional open parameters.
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    values: Vec<Option<String>>,
    pacing: PacingCorrection,
}

impl OpenParams {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self {
            values,
            pacing: PacingCorrection::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingCorrection) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set one slot, growing the list as needed.
    pub fn set(mut self, index: usize, value: impl Into<String>) -> Self {
        if self.values.len() <= index {
            self.values.resize(index + 1, None);
        }
        self.values[index] = Some(value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// `None` for a missing slot or the literal `default`.
    pub fn target(&self, index: usize) -> Option<&str> {
        self.get(index)
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != DEFAULT_TARGET)
    }

    pub fn pacing(&self) -> PacingCorrection {
        self.pacing
    }
}

/// Per-call settings the device handle passes down to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaySettings {
    pub volume: i32,
    pub byte_order: ByteOrder,
}

impl Default for PlaySettings {
    fn default() -> Self {
        Self {
            volume: super::track::VOLUME_DEFAULT,
            byte_order: ByteOrder::native(),
        }
    }
}

/// One audio backend bound to an open native transport.
///
/// `play` blocks the calling thread until the track has been played, an
/// error occurs or `stop` is observed. `stop` may be called from any other
/// thread at any time, including before the first `play` and after `close`;
/// it never fails and never waits for playback. Only one `play` may run at
/// a time on a given instance; `close` must not race an active `play`.
pub trait AudioOutput: Send + Sync {
    fn name(&self) -> &'static str;

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError>;

    fn stop(&self);

    /// Release every native resource. Calling it twice is harmless.
    fn close(&self);

    /// Backends that can change volume natively override this; the others
    /// read `PlaySettings::volume` on each call.
    fn set_volume(&self, _volume: i32) {}

    /// External command that can play the same data from a shell.
    fn play_command(&self) -> Option<&'static str>;
}
