//! audio - Interruptible audio output backends
//!
//! One blocking `play()` per device, interruptible from another thread
//! through `stop()`. Five transports sit behind the [`AudioOutput`] trait:
//! an ALSA PCM device paced by wall clock (`alsa`), the same device driven
//! by `poll()` in non-blocking mode (`alsa-poll`), a cpal stream fed
//! through a ring buffer (`cpal`), a simple-protocol TCP sink (`pulse`) and
//! an event server playing whole-track flows (`flow`).

mod alsa_device;
pub mod cancel;
mod cpal_output;
pub mod device;
pub mod alsa_pacer;
pub mod alsa_poll;
mod event_pump;
pub mod event_server;
pub mod flow_protocol;
pub mod live;
pub mod output;
pub mod registry;
pub mod simple;
pub mod track;

pub use cancel::{CancelToken, WaitOutcome};
pub use device::{Device, DeviceState};
pub use output::{
    AudioOutput, OpenParams, PacingCorrection, PlaySettings, DEFAULT_TARGET, PARAM_ALSA_DEVICE, PARAM_FLOW_SERVER,
    PARAM_PULSE_MIN_LENGTH, PARAM_PULSE_SERVER,
};
pub use registry::{open_first, BackendEntry, BACKENDS};
pub use track::{ByteOrder, Track, VOLUME_DEFAULT, VOLUME_MAX, VOLUME_MIN};
