//! ALSA PCM wrappers for the paced (blocking) and poll-driven backends.

use std::io;
use std::time::{Duration, Instant};

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::poll::Descriptors;
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::alsa_pacer::{BufferSpace, PcmDevice, PcmOpener, StreamParams};
use super::alsa_poll::{self, PollPcm, PollPcmOpener, Readiness, Wakeup};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Actual sample width in bits, 0 if the device picked something else
    pub bits: u16,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

fn format_for(bits: u16) -> Option<Format> {
    match bits {
        16 if cfg!(target_endian = "big") => Some(Format::S16BE),
        16 => Some(Format::S16LE),
        8 => Some(Format::S8),
        _ => None,
    }
}

fn bits_of(format: Format) -> u16 {
    match format {
        Format::S16LE if cfg!(target_endian = "little") => 16,
        Format::S16BE if cfg!(target_endian = "big") => 16,
        Format::S8 => 8,
        _ => 0,
    }
}

/// Open a PCM device for playback without configuring it.
pub fn open_playback(device: &str) -> Result<PCM> {
    PCM::new(device, Direction::Playback, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Playback", device))
}

/// Configure hardware parameters, accepting the nearest rate and channel
/// count; the caller decides which differences are fatal.
pub fn configure_playback(pcm: &PCM, bits: u16, channels: u32, sample_rate: u32) -> Result<AlsaParams> {
    {
        let hwp = HwParams::any(pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        if let Some(format) = format_for(bits) {
            // An unsupported format is reported through the read-back below.
            let _ = hwp.set_format(format);
        }
        hwp.set_channels_near(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let hwp = pcm.hw_params_current()?;
    let params = AlsaParams {
        sample_rate: hwp.get_rate()?,
        channels: hwp.get_channels()?,
        bits: bits_of(hwp.get_format()?),
        period_size: hwp.get_period_size()? as usize,
        buffer_size: hwp.get_buffer_size()? as usize,
    };

    log::debug!(
        "ALSA Playback: rate={}, channels={}, bits={}, period_size={}, buffer_size={}",
        params.sample_rate,
        params.channels,
        params.bits,
        params.period_size,
        params.buffer_size,
    );

    Ok(params)
}

/// Opens ALSA PCM devices by name (`default`, `hw:0,0`, `plughw:1`, ...).
pub struct AlsaOpener;

impl PcmOpener for AlsaOpener {
    fn open(&self, device: &str) -> Result<Box<dyn PcmDevice>> {
        let pcm = open_playback(device)?;
        Ok(Box::new(AlsaPcm {
            pcm,
            frame_bytes: 0,
            period_size: 0,
        }))
    }
}

/// One open PCM handle. Closed when dropped.
pub struct AlsaPcm {
    pcm: PCM,
    frame_bytes: usize,
    period_size: usize,
}

impl PcmDevice for AlsaPcm {
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams> {
        let params = configure_playback(
            &self.pcm,
            requested.bits,
            u32::from(requested.channels),
            requested.rate,
        )?;
        let bytes_per_sample = usize::from(params.bits.max(8) / 8);
        self.frame_bytes = bytes_per_sample * params.channels as usize;
        self.period_size = params.period_size.max(1);
        Ok(StreamParams {
            bits: params.bits,
            channels: params.channels as u16,
            rate: params.sample_rate,
        })
    }

    fn space(&mut self) -> Result<BufferSpace> {
        let avail = match self.pcm.avail_update() {
            Ok(frames) => frames,
            Err(e) => {
                // XRUN: recover and report a fully free buffer on the next query
                self.pcm
                    .try_recover(e, true)
                    .with_context(|| "Failed to recover PCM playback")?;
                self.pcm.avail_update()?
            }
        };
        let avail = avail.max(0) as usize;
        Ok(BufferSpace {
            fragments: avail / self.period_size,
            fragment_size: self.period_size * self.frame_bytes,
            bytes: avail * self.frame_bytes,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let io = self.pcm.io_bytes();
        match io.writei(bytes) {
            Ok(frames) => Ok(frames * self.frame_bytes),
            Err(e) => {
                log::warn!("ALSA playback error: {}, recovering...", e);
                self.pcm
                    .try_recover(e, true)
                    .with_context(|| "Failed to recover PCM playback")?;
                let frames = io.writei(bytes)?;
                Ok(frames * self.frame_bytes)
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.pcm.drop()?;
        self.pcm.prepare()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.pcm.drain()?;
        Ok(())
    }
}

/// Opens ALSA PCM devices in non-blocking mode.
pub struct AlsaPollOpener;

impl PollPcmOpener for AlsaPollOpener {
    fn open_nonblocking(&self, device: &str) -> Result<Box<dyn PollPcm>> {
        let pcm = PCM::new(device, Direction::Playback, true)
            .with_context(|| format!("Failed to open PCM device '{}' for non-blocking Playback", device))?;
        Ok(Box::new(AlsaPollPcm {
            pcm,
            frame_bytes: 0,
            period_size: 0,
            buffer_size: 0,
            draining: false,
        }))
    }
}

/// Non-blocking PCM handle. `avail_min` is one period while feeding and the
/// whole buffer while draining, so POLLOUT means "room for a period" or
/// "everything played" respectively.
pub struct AlsaPollPcm {
    pcm: PCM,
    frame_bytes: usize,
    period_size: usize,
    buffer_size: usize,
    draining: bool,
}

fn would_block(e: &alsa::Error) -> bool {
    io::Error::from_raw_os_error(e.errno()).kind() == io::ErrorKind::WouldBlock
}

impl AlsaPollPcm {
    fn set_avail_min(&self, frames: usize) -> Result<()> {
        let swp = self.pcm.sw_params_current()?;
        swp.set_avail_min(frames as Frames)?;
        self.pcm.sw_params(&swp)?;
        Ok(())
    }

    /// Bring the stream back after an underrun or a system suspend.
    fn recover(&self) -> Result<()> {
        match self.pcm.state() {
            State::XRun => {
                log::warn!("ALSA playback underrun, preparing again");
                self.pcm.prepare()?;
            }
            State::Suspended => {
                log::warn!("ALSA device suspended, resuming");
                if self.pcm.resume().is_err() {
                    self.pcm.prepare()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn avail(&self) -> Result<usize> {
        let frames = match self.pcm.avail_update() {
            Ok(frames) => frames,
            Err(e) => {
                self.pcm
                    .try_recover(e, true)
                    .with_context(|| "Failed to recover PCM playback")?;
                self.pcm.avail_update()?
            }
        };
        Ok(frames.max(0) as usize)
    }
}

impl PollPcm for AlsaPollPcm {
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams> {
        let params = configure_playback(
            &self.pcm,
            requested.bits,
            u32::from(requested.channels),
            requested.rate,
        )?;
        let bytes_per_sample = usize::from(params.bits.max(8) / 8);
        self.frame_bytes = bytes_per_sample * params.channels as usize;
        self.period_size = params.period_size.max(1);
        self.buffer_size = params.buffer_size.max(self.period_size);
        self.set_avail_min(self.period_size)?;
        self.draining = false;
        Ok(StreamParams {
            bits: params.bits,
            channels: params.channels as u16,
            rate: params.sample_rate,
        })
    }

    fn period_bytes(&self) -> usize {
        self.period_size * self.frame_bytes
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let io = self.pcm.io_bytes();
        match io.writei(bytes) {
            Ok(frames) => Ok(frames * self.frame_bytes),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                log::warn!("ALSA playback error: {}, recovering...", e);
                self.pcm
                    .try_recover(e, true)
                    .with_context(|| "Failed to recover PCM playback")?;
                match io.writei(bytes) {
                    Ok(frames) => Ok(frames * self.frame_bytes),
                    Err(e) if would_block(&e) => Ok(0),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn wait(&mut self, wakeup: &Wakeup, draining: bool, timeout: Duration) -> Result<Readiness> {
        if draining != self.draining {
            let frames = if draining { self.buffer_size } else { self.period_size };
            self.set_avail_min(frames)?;
            self.draining = draining;
        }
        let wanted = if draining { self.buffer_size } else { self.period_size };
        let deadline = Instant::now() + timeout;

        let mut fds = self.pcm.get()?;
        let device_fds = fds.len();
        fds.push(wakeup.pollfd());

        loop {
            self.recover()?;
            if self.avail()? >= wanted {
                return Ok(Readiness::Ready);
            }
            // A tail below the start threshold never starts by itself.
            if draining && self.pcm.state() == State::Prepared {
                self.pcm.start()?;
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(Readiness::TimedOut);
            }
            for fd in fds.iter_mut() {
                fd.revents = 0;
            }
            alsa::poll::poll(&mut fds, alsa_poll::poll_timeout(left))?;
            if Wakeup::is_signalled(&fds[device_fds]) {
                return Ok(Readiness::Stopped);
            }
            let revents = self.pcm.revents(&fds[..device_fds])?;
            log::trace!("ALSA poll revents {:?}", revents);
        }
    }

    fn drop_pending(&mut self) -> Result<()> {
        self.pcm.drop()?;
        self.pcm.prepare()?;
        Ok(())
    }
}
