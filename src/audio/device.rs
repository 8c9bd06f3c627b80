//! Device handle: one open backend plus the per-handle playback settings.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use super::cancel::lock;
use super::output::{AudioOutput, OpenParams, PlaySettings};
use super::registry;
use super::track::{self, ByteOrder, Track, VOLUME_DEFAULT, VOLUME_MAX, VOLUME_MIN};
use crate::error::{OpenError, PlayError};
use crate::logging::{AudioLog, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Playing,
}

/// An open audio output.
///
/// `play` blocks; `stop` may be called from any thread while it runs.
/// Share the handle with `Arc` to do that. Closing is idempotent and also
/// happens on drop.
pub struct Device {
    backend: Box<dyn AudioOutput>,
    volume: AtomicI32,
    format: ByteOrder,
    working: AtomicBool,
    state: Mutex<DeviceState>,
    log: AudioLog,
}

impl Device {
    /// Open the backend registered under `name`. The device logs through
    /// its own threshold, see [`Device::set_log_level`].
    pub fn open(name: &str, params: &OpenParams, log: AudioLog) -> Result<Self, OpenError> {
        let entry = registry::find(name).ok_or_else(|| OpenError::UnknownBackend(name.to_string()))?;
        let log = log.scoped();
        let backend = (entry.open)(params, log.clone())?;
        Ok(Self::from_backend(backend, log))
    }

    /// Wrap an already opened backend. The device uses the host byte order
    /// and shares `log`'s threshold with the backend.
    pub fn from_backend(backend: Box<dyn AudioOutput>, log: AudioLog) -> Self {
        log.debug(format_args!("audio: opened {} output", backend.name()));
        Self {
            backend,
            volume: AtomicI32::new(VOLUME_DEFAULT),
            format: ByteOrder::native(),
            working: AtomicBool::new(false),
            state: Mutex::new(DeviceState::Open),
            log,
        }
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// Play `track`, whose 16-bit samples are in `track_order`. Samples in
    /// the other order are swapped on a private copy first.
    pub fn play(&self, track: &Track<'_>, track_order: ByteOrder) -> Result<(), PlayError> {
        {
            let mut state = lock(&self.state);
            if *state == DeviceState::Closed {
                self.log.error(format_args!("audio: play() on a closed {} device", self.name()));
                return Err(PlayError::Closed);
            }
            *state = DeviceState::Playing;
        }
        self.working.store(true, Ordering::SeqCst);

        let swapped;
        let track = if track.bits == 16 && track_order != self.format {
            swapped = track::swap_bytes(track.samples);
            Track::new(track.bits, track.num_channels, track.sample_rate, &swapped)
        } else {
            *track
        };

        let settings = PlaySettings {
            volume: self.volume(),
            byte_order: self.format,
        };
        let result = self.backend.play(&track, settings);

        self.working.store(false, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if *state == DeviceState::Playing {
            *state = DeviceState::Open;
        }
        result
    }

    /// Interrupt the current play(), if any. Never blocks on playback.
    pub fn stop(&self) {
        self.backend.stop();
    }

    pub fn close(&self) {
        let mut state = lock(&self.state);
        if *state == DeviceState::Closed {
            return;
        }
        *state = DeviceState::Closed;
        drop(state);
        self.backend.close();
        self.log.debug(format_args!("audio: closed {} output", self.name()));
    }

    pub fn set_volume(&self, volume: i32) -> Result<(), PlayError> {
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&volume) {
            self.log.warning(format_args!(
                "audio: volume {} out of range ({}..={})",
                volume, VOLUME_MIN, VOLUME_MAX
            ));
            return Err(PlayError::VolumeOutOfRange(volume));
        }
        self.volume.store(volume, Ordering::SeqCst);
        self.backend.set_volume(volume);
        Ok(())
    }

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> ByteOrder {
        self.format
    }

    /// True while a play() is running.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub fn play_command(&self) -> Option<&'static str> {
        self.backend.play_command()
    }

    /// Least severe level this device and its backend still report.
    pub fn set_log_level(&self, level: Severity) {
        self.log.set_level(level);
    }

    pub fn log_level(&self) -> Severity {
        self.log.level()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.name())
            .field("volume", &self.volume())
            .field("format", &self.format)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LiveStats, PacedLiveDriver};
    use crate::audio::live::LiveOutput;
    use std::sync::{Arc, Mutex};

    fn live_device(stats: &Arc<LiveStats>) -> Device {
        let backend = LiveOutput::with_driver(Box::new(PacedLiveDriver::new(stats.clone())), AudioLog::discard());
        Device::from_backend(Box::new(backend), AudioLog::discard())
    }

    #[test]
    fn starts_open_with_native_order_and_default_volume() {
        let stats = Arc::new(LiveStats::default());
        let device = live_device(&stats);
        assert_eq!(device.state(), DeviceState::Open);
        assert_eq!(device.format(), ByteOrder::native());
        assert_eq!(device.volume(), VOLUME_DEFAULT);
        assert!(!device.is_working());
        assert_eq!(device.name(), "cpal");
    }

    #[test]
    fn volume_is_range_checked() {
        let stats = Arc::new(LiveStats::default());
        let device = live_device(&stats);
        device.set_volume(-100).unwrap();
        device.set_volume(100).unwrap();
        assert!(matches!(device.set_volume(101), Err(PlayError::VolumeOutOfRange(101))));
        assert!(matches!(device.set_volume(-101), Err(PlayError::VolumeOutOfRange(-101))));
        assert_eq!(device.volume(), 100);
    }

    #[test]
    fn foreign_byte_order_is_swapped_before_the_backend() {
        let stats = Arc::new(LiveStats::default());
        let device = live_device(&stats);
        let foreign = match ByteOrder::native() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let samples = [0x0102i16];
        device.play(&Track::new(16, 1, 8000, &samples), foreign).unwrap();
        assert_eq!(stats.last_samples(), vec![0x0201]);
        // the caller's buffer is untouched
        assert_eq!(samples, [0x0102]);

        device.play(&Track::new(16, 1, 8000, &samples), ByteOrder::native()).unwrap();
        assert_eq!(stats.last_samples(), vec![0x0102]);
    }

    #[test]
    fn play_after_close_is_rejected() {
        let stats = Arc::new(LiveStats::default());
        let device = live_device(&stats);
        device.close();
        device.close();
        device.stop();
        let samples = [1i16; 4];
        assert!(matches!(
            device.play(&Track::new(16, 1, 8000, &samples), ByteOrder::native()),
            Err(PlayError::Closed)
        ));
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn log_level_reaches_the_backend() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let log = AudioLog::new(move |severity, args| lock(&sink).push((severity, args.to_string())));
        let stats = Arc::new(LiveStats::default());
        let backend = LiveOutput::with_driver(Box::new(PacedLiveDriver::new(stats.clone())), log.clone());
        let device = Device::from_backend(Box::new(backend), log);
        let samples = [1i16; 64];

        device.set_log_level(Severity::Warning);
        assert_eq!(device.log_level(), Severity::Warning);
        lock(&seen).clear();
        device.play(&Track::new(16, 1, 8000, &samples), ByteOrder::native()).unwrap();
        assert!(lock(&seen).iter().all(|(severity, _)| *severity <= Severity::Warning));

        device.set_log_level(Severity::Debug);
        device.play(&Track::new(16, 1, 8000, &samples), ByteOrder::native()).unwrap();
        assert!(lock(&seen).iter().any(|(severity, _)| *severity > Severity::Warning));
    }

    #[test]
    fn unknown_backend_name() {
        let err = Device::open("oss", &OpenParams::default(), AudioLog::discard()).unwrap_err();
        assert!(matches!(err, OpenError::UnknownBackend(name) if name == "oss"));
    }
}
