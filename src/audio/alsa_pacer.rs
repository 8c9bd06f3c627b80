//! Blocking device backend.
//!
//! The device is opened for each play() and closed afterwards so other
//! processes can use it in between. The native channel gives no readiness
//! feedback beyond a free-space query, so the write rate is paced by wall
//! clock: after each write the thread waits, on the cancellation token, for
//! as long as the written audio lasts.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::alsa_device::AlsaOpener;
use super::cancel::{lock, CancelToken, WaitOutcome};
use super::output::{AudioOutput, OpenParams, PacingCorrection, PlaySettings, PARAM_ALSA_DEVICE};
use super::track::{self, ByteOrder, EightBit, Track};
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

pub const NAME: &str = "alsa";
pub const PLAY_COMMAND: &str = "aplay";

/// Sleep between free-space polls when the device has no free fragment.
const FRAGMENT_RETRY_SLEEP: Duration = Duration::from_micros(100);

/// Stream parameters requested from, or granted by, the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub bits: u16,
    pub channels: u16,
    pub rate: u32,
}

/// Free space in the device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpace {
    pub fragments: usize,
    pub fragment_size: usize,
    /// Total free bytes, possibly more than `fragments * fragment_size`.
    pub bytes: usize,
}

/// An open playback device.
pub trait PcmDevice: Send {
    /// Negotiate parameters; returns what the device actually granted.
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams>;
    fn space(&mut self) -> Result<BufferSpace>;
    /// Write without blocking past the reported free space; returns bytes taken.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;
    /// Discard everything queued in hardware.
    fn reset(&mut self) -> Result<()>;
    /// Push out any partial fragment before the device is closed.
    fn sync(&mut self) -> Result<()>;
}

pub trait PcmOpener: Send + Sync {
    fn open(&self, device: &str) -> Result<Box<dyn PcmDevice>>;
}

pub struct PacedOutput {
    device_name: String,
    opener: Box<dyn PcmOpener>,
    /// Device open for the current play(), shared so stop() can reset it.
    device: Mutex<Option<Box<dyn PcmDevice>>>,
    cancel: CancelToken,
    pacing: PacingCorrection,
    log: AudioLog,
}

/// Open the backend on the ALSA device named in the parameters.
pub fn open(params: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let device = params
        .get(PARAM_ALSA_DEVICE)
        .ok_or(OpenError::MissingParameter {
            index: PARAM_ALSA_DEVICE,
            name: "alsa device",
        })?
        .to_string();
    let output = PacedOutput::open_with(device, Box::new(AlsaOpener), params.pacing(), log)?;
    Ok(Box::new(output))
}

impl PacedOutput {
    /// Open the device once so a missing device fails at open time.
    pub fn open_with(
        device_name: String,
        opener: Box<dyn PcmOpener>,
        pacing: PacingCorrection,
        log: AudioLog,
    ) -> Result<Self, OpenError> {
        match opener.open(&device_name) {
            Ok(device) => drop(device),
            Err(e) => {
                log.error(format_args!("alsa: cannot open {}: {:#}", device_name, e));
                return Err(OpenError::DeviceUnavailable(format!("{}: {:#}", device_name, e)));
            }
        }

        Ok(Self {
            device_name,
            opener,
            device: Mutex::new(None),
            cancel: CancelToken::new(),
            pacing,
            log,
        })
    }

    fn negotiate(&self, device: &mut dyn PcmDevice, requested: StreamParams) -> Result<StreamParams, PlayError> {
        let granted = device.configure(requested).map_err(|e| {
            self.log.critical(format_args!("alsa: parameter negotiation failed: {:#}", e));
            PlayError::Negotiation(format!("{:#}", e))
        })?;

        if granted.bits != requested.bits {
            self.log.critical(format_args!(
                "alsa: device doesn't support {}-bit sound format",
                requested.bits
            ));
            return Err(PlayError::FormatMismatch {
                requested: requested.bits,
                negotiated: granted.bits,
            });
        }
        if granted.channels != requested.channels {
            self.log.error(format_args!(
                "alsa: device doesn't support {} channels",
                requested.channels
            ));
            return Err(PlayError::ChannelMismatch {
                requested: requested.channels,
                negotiated: granted.channels,
            });
        }
        if granted.rate != requested.rate {
            self.log.critical(format_args!(
                "alsa: device doesn't support sample rate {}, using {} instead",
                requested.rate, granted.rate
            ));
        }
        Ok(granted)
    }

    /// Run `f` on the device currently in the shared slot.
    fn with_device<T>(&self, f: impl FnOnce(&mut dyn PcmDevice) -> Result<T>) -> Result<T> {
        let mut slot = lock(&self.device);
        match slot.as_mut() {
            Some(device) => f(device.as_mut()),
            None => anyhow::bail!("device was closed during playback"),
        }
    }

    /// Write all of `bytes`, pacing by wall clock. Returns `true` when
    /// interrupted by stop().
    fn stream(&self, bytes: &[u8], frame_bytes: usize, rate: u32) -> Result<bool, PlayError> {
        let mut offset = 0;
        let mut lead: Option<f64> = None;
        let mut starved_since: Option<Instant> = None;

        while offset < bytes.len() {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let space = self.with_device(|d| d.space()).map_err(|e| {
                self.log.error(format_args!("alsa: buffer space query failed: {:#}", e));
                PlayError::DeviceQuery(format!("{:#}", e))
            })?;

            // Nothing free: poll again shortly. Should be rare, it hurts sync.
            if space.fragments == 0 || space.fragment_size == 0 {
                let since = *starved_since.get_or_insert_with(Instant::now);
                if since.elapsed() > self.pacing.max_fragment_wait {
                    let waited_ms = since.elapsed().as_millis() as u64;
                    self.log.error(format_args!("alsa: no free fragment for {} ms, giving up", waited_ms));
                    return Err(PlayError::DeviceStalled { waited_ms });
                }
                self.log.debug(format_args!("alsa: not enough space for a single fragment, looping"));
                thread::sleep(FRAGMENT_RETRY_SLEEP);
                continue;
            }
            starved_since = None;

            self.log.debug(format_args!(
                "alsa: space for {} more fragments of {} bytes",
                space.fragments, space.fragment_size
            ));

            let room = space.fragments * space.fragment_size;
            let end = bytes.len().min(offset + room);
            let mut written = self.write_chunk(&bytes[offset..end])?;
            offset += written;

            // A tail shorter than a fragment goes out right away so it
            // cannot cause an underrun later.
            let remaining = bytes.len() - offset;
            if remaining > 0 && remaining < space.fragment_size && room + remaining < space.bytes {
                self.log.debug(format_args!("alsa: writing the rest of the data ({} bytes)", remaining));
                let extra = self.write_chunk(&bytes[offset..])?;
                offset += extra;
                written += extra;
            }

            self.log.debug(format_args!(
                "alsa: {} bytes written, {} remaining",
                written,
                bytes.len() - offset
            ));

            let mut seconds = written as f64 / frame_bytes as f64 / f64::from(rate);
            if lead.is_none() {
                let first = seconds.min(self.pacing.lead.as_secs_f64());
                lead = Some(first);
                seconds -= first;
            }

            if self.cancel.wait_timeout(Duration::from_secs_f64(seconds.max(0.0))) == WaitOutcome::Cancelled {
                self.log.info(format_args!("alsa: playback stopped"));
                return Ok(true);
            }
        }

        // Let the lead time run out, minus what was spent outside the waits.
        if let Some(lead) = lead {
            let rest = lead - self.pacing.settle.as_secs_f64();
            if rest > 0.0 {
                self.log.debug(format_args!("alsa: waiting for the resting delay, {:.3} s", rest));
                if self.cancel.wait_timeout(Duration::from_secs_f64(rest)) == WaitOutcome::Cancelled {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<usize, PlayError> {
        match self.with_device(|d| d.write(chunk)) {
            Ok(0) => Err(PlayError::WriteFailed("device accepted no data".into())),
            Ok(n) => Ok(n),
            Err(_) if self.cancel.is_cancelled() => Ok(chunk.len()),
            Err(e) => {
                self.log.error(format_args!("alsa: write failed: {:#}", e));
                Err(PlayError::WriteFailed(format!("{:#}", e)))
            }
        }
    }
}

impl AudioOutput for PacedOutput {
    fn name(&self) -> &'static str {
        NAME
    }

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError> {
        self.cancel.reset();
        if track.is_empty() {
            return Ok(());
        }
        let bytes_per_sample = track.validate().inspect_err(|e| {
            self.log.error(format_args!("alsa: unrecognized sound data format: {}", e));
        })?;

        let mut device = self.opener.open(&self.device_name).map_err(|e| {
            self.log.error(format_args!("alsa: cannot open {}: {:#}", self.device_name, e));
            PlayError::DeviceOpen(format!("{:#}", e))
        })?;

        let requested = StreamParams {
            bits: track.bits,
            channels: track.num_channels,
            rate: track.sample_rate,
        };
        let granted = self.negotiate(device.as_mut(), requested)?;

        let scaled = track::scale_volume(track.samples, settings.volume);
        let bytes = track::to_bytes(&scaled, track.bits, ByteOrder::native(), EightBit::Signed);
        let frame_bytes = bytes_per_sample * usize::from(track.num_channels);

        self.log.info(format_args!(
            "alsa: starting playback, {} bytes ({:.3} s)",
            bytes.len(),
            track.duration().as_secs_f64()
        ));

        *lock(&self.device) = Some(device);
        let outcome = self.stream(&bytes, frame_bytes, granted.rate);
        let device = lock(&self.device).take();

        if let Some(mut device) = device {
            if outcome.is_ok() {
                if let Err(e) = device.sync() {
                    self.log.warning(format_args!("alsa: flush failed: {:#}", e));
                }
            }
            drop(device);
            self.log.info(format_args!("alsa: device closed"));
        }

        outcome.map(|_| ())
    }

    fn stop(&self) {
        self.log.info(format_args!("alsa: stop() called"));
        self.cancel.cancel();
        if let Some(device) = lock(&self.device).as_mut() {
            if let Err(e) = device.reset() {
                self.log.warning(format_args!("alsa: reset failed: {:#}", e));
            }
        }
    }

    fn close(&self) {
        // Nothing stays open between play() calls.
        self.cancel.cancel();
        lock(&self.device).take();
    }

    fn play_command(&self) -> Option<&'static str> {
        Some(PLAY_COMMAND)
    }
}
