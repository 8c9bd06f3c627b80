//! Live-streaming backend.
//!
//! The native library owns a ring buffer and its write call blocks only
//! until one chunk fits, so the track is submitted in small chunks with a
//! stop flag checked in between. The stream is opened lazily on the first
//! play() and kept open; a failed write closes it and the next play()
//! reopens it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use super::cancel::lock;
use super::cpal_output::CpalDriver;
use super::output::{AudioOutput, OpenParams, PlaySettings};
use super::track::{self, ByteOrder, EightBit, Track};
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

pub const NAME: &str = "cpal";

/// Bytes handed to the library per write.
pub const LIVE_CHUNK_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveFormat {
    pub bits: u16,
    pub channels: u16,
    pub rate: u32,
    pub byte_order: ByteOrder,
}

/// An open live stream. `play` blocks until the chunk has been queued.
pub trait LiveSink: Send {
    fn play(&mut self, bytes: &[u8]) -> Result<()>;
}

pub trait LiveDriver: Send + Sync {
    fn open_live(&self, format: &LiveFormat) -> Result<Box<dyn LiveSink>>;
}

struct OpenStream {
    format: LiveFormat,
    sink: Box<dyn LiveSink>,
}

pub struct LiveOutput {
    driver: Box<dyn LiveDriver>,
    stream: Mutex<Option<OpenStream>>,
    stop_requested: AtomicBool,
    log: AudioLog,
}

pub fn open(_params: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let driver = CpalDriver::new(log.clone());
    Ok(Box::new(LiveOutput::with_driver(Box::new(driver), log)))
}

impl LiveOutput {
    /// Nothing is opened until the first track arrives.
    pub fn with_driver(driver: Box<dyn LiveDriver>, log: AudioLog) -> Self {
        Self {
            driver,
            stream: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            log,
        }
    }
}

impl AudioOutput for LiveOutput {
    fn name(&self) -> &'static str {
        NAME
    }

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        if track.is_empty() {
            return Ok(());
        }
        track.validate().inspect_err(|e| {
            self.log.warning(format_args!("live: unrecognized sound data format: {}", e));
        })?;

        let format = LiveFormat {
            bits: track.bits,
            channels: track.num_channels,
            rate: track.sample_rate,
            byte_order: settings.byte_order,
        };

        let mut slot = lock(&self.stream);
        if slot.as_ref().is_some_and(|open| open.format != format) {
            self.log.info(format_args!("live: track format changed, reopening the stream"));
            slot.take();
        }
        if slot.is_none() {
            let sink = self.driver.open_live(&format).map_err(|e| {
                self.log.error(format_args!("live: error opening the output stream: {:#}", e));
                PlayError::DeviceOpen(format!("{:#}", e))
            })?;
            *slot = Some(OpenStream { format, sink });
        }
        let Some(stream) = slot.as_mut() else {
            return Err(PlayError::DeviceOpen("stream vanished".into()));
        };

        let bytes = track::to_bytes(track.samples, track.bits, settings.byte_order, EightBit::Signed);
        self.log.notice(format_args!(
            "live: bytes to play: {} ({:.3} s)",
            bytes.len(),
            track.duration().as_secs_f64()
        ));

        for chunk in bytes.chunks(LIVE_CHUNK_BYTES) {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.log.info(format_args!("live: playback stopped"));
                break;
            }
            if let Err(e) = stream.sink.play(chunk) {
                slot.take();
                self.log.notice(format_args!(
                    "live: write failed ({:#}), closing the stream, it will be reopened on the next play",
                    e
                ));
                return Err(PlayError::WriteFailed(format!("{:#}", e)));
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        lock(&self.stream).take();
    }

    fn play_command(&self) -> Option<&'static str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LiveStats, PacedLiveDriver};
    use std::sync::Arc;

    fn output(stats: &Arc<LiveStats>) -> LiveOutput {
        LiveOutput::with_driver(Box::new(PacedLiveDriver::new(stats.clone())), AudioLog::discard())
    }

    #[test]
    fn stream_opens_lazily_and_is_reused() {
        let stats = Arc::new(LiveStats::default());
        let out = output(&stats);
        assert_eq!(stats.opened(), 0);

        let samples = vec![7i16; 400];
        let track = Track::new(16, 1, 44100, &samples);
        out.play(&track, PlaySettings::default()).unwrap();
        out.play(&track, PlaySettings::default()).unwrap();

        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.bytes(), 1600);
        // 800 bytes per track in 256-byte chunks
        assert_eq!(stats.chunks(), 8);
    }

    #[test]
    fn format_change_reopens() {
        let stats = Arc::new(LiveStats::default());
        let out = output(&stats);
        let samples = vec![7i16; 100];
        out.play(&Track::new(16, 1, 44100, &samples), PlaySettings::default()).unwrap();
        out.play(&Track::new(16, 1, 22050, &samples), PlaySettings::default()).unwrap();
        assert_eq!(stats.opened(), 2);
        assert_eq!(stats.live(), 1);
    }

    #[test]
    fn write_failure_closes_and_next_play_reopens() {
        let stats = Arc::new(LiveStats::default());
        let out = LiveOutput::with_driver(
            Box::new(PacedLiveDriver::new(stats.clone()).fail_on_chunk(2)),
            AudioLog::discard(),
        );
        let samples = vec![7i16; 1000];
        let track = Track::new(16, 1, 44100, &samples);

        let err = out.play(&track, PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::WriteFailed(_)));
        assert!(err.is_transient());
        assert_eq!(stats.live(), 0);

        out.play(&track, PlaySettings::default()).unwrap();
        assert_eq!(stats.opened(), 2);
    }

    #[test]
    fn empty_track_and_bad_width_do_not_open() {
        let stats = Arc::new(LiveStats::default());
        let out = output(&stats);
        out.play(&Track::new(16, 1, 8000, &[]), PlaySettings::default()).unwrap();
        let samples = [1i16; 8];
        assert!(matches!(
            out.play(&Track::new(32, 1, 8000, &samples), PlaySettings::default()),
            Err(PlayError::UnsupportedBits(32))
        ));
        assert_eq!(stats.opened(), 0);
        assert_eq!(out.play_command(), None);
    }

    #[test]
    fn close_releases_the_stream_and_is_idempotent() {
        let stats = Arc::new(LiveStats::default());
        let out = output(&stats);
        let samples = vec![0i16; 64];
        out.play(&Track::new(16, 1, 44100, &samples), PlaySettings::default()).unwrap();
        out.close();
        out.close();
        out.stop();
        assert_eq!(stats.live(), 0);
    }
}
