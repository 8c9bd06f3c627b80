//! Interruptible streaming audio output.
//!
//! Open a [`Device`] on one of the registered backends, call
//! [`Device::play`] on a playback thread and [`Device::stop`] from any other
//! thread to cut it short.

pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use audio::{open_first, AudioOutput, ByteOrder, Device, OpenParams, Track};
pub use config::AudioSettings;
pub use error::{OpenError, PlayError, SettingsError};
pub use logging::{AudioLog, Severity};
