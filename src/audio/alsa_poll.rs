//! Poll-driven device backend.
//!
//! The PCM is opened non-blocking at open() and stays open for the life of
//! the handle. play() writes as much as the device takes, then sleeps in
//! `poll()` on the PCM descriptors plus one end of a socket pair. stop()
//! writes a byte to the other end, so a sleeping play() wakes at once
//! instead of at the next pacing interval.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::time::Duration;

use alsa::poll::{pollfd, Flags};
use anyhow::Result;

use super::alsa_device::AlsaPollOpener;
use super::alsa_pacer::StreamParams;
use super::cancel::lock;
use super::output::{AudioOutput, OpenParams, PacingCorrection, PlaySettings, PARAM_ALSA_DEVICE};
use super::track::{self, ByteOrder, EightBit, Track};
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

pub const NAME: &str = "alsa-poll";

/// What woke a waiting play().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The device takes more data or, when draining, has played everything.
    Ready,
    Stopped,
    TimedOut,
}

/// Self-pipe used by stop() to wake a play() sleeping in `poll()`.
#[derive(Debug)]
pub struct Wakeup {
    tx: UnixStream,
    rx: UnixStream,
}

/// `poll()` takes whole milliseconds; round up so short waits still sleep.
pub(crate) fn poll_timeout(timeout: Duration) -> i32 {
    timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32
}

impl Wakeup {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx })
    }

    pub fn notify(&self) {
        // A full socket buffer already holds a wakeup.
        let _ = (&self.tx).write(&[1]);
    }

    /// Throw away wakeups left from before the current play().
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }

    /// Descriptor to poll alongside the device's own.
    pub fn pollfd(&self) -> pollfd {
        pollfd {
            fd: self.rx.as_raw_fd(),
            events: Flags::IN.bits(),
            revents: 0,
        }
    }

    pub fn is_signalled(fd: &pollfd) -> bool {
        Flags::from_bits_truncate(fd.revents).contains(Flags::IN)
    }

    /// Sleep until notified or until `timeout` passes. True when notified.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [self.pollfd()];
        let ready = alsa::poll::poll(&mut fds, poll_timeout(timeout))?;
        Ok(ready > 0 && Self::is_signalled(&fds[0]))
    }
}

/// A PCM opened in non-blocking mode.
pub trait PollPcm: Send {
    /// Set hardware parameters and prepare for playback; returns what the
    /// device granted.
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams>;
    /// Bytes in one period with the current parameters.
    fn period_bytes(&self) -> usize;
    /// Write without blocking; `Ok(0)` when the buffer is full. Underruns
    /// and suspends are recovered here.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;
    /// Sleep until the device takes more data (or, with `draining`, has
    /// played everything), `wakeup` fires or `timeout` passes.
    fn wait(&mut self, wakeup: &Wakeup, draining: bool, timeout: Duration) -> Result<Readiness>;
    /// Discard everything still queued.
    fn drop_pending(&mut self) -> Result<()>;
}

pub trait PollPcmOpener: Send + Sync {
    fn open_nonblocking(&self, device: &str) -> Result<Box<dyn PollPcm>>;
}

pub struct PollOutput {
    device_name: String,
    opener: Box<dyn PollPcmOpener>,
    pcm: Mutex<Option<Box<dyn PollPcm>>>,
    wakeup: Wakeup,
    /// True while a play() is between its first write and its final drop.
    active: Mutex<bool>,
    stall_limit: Duration,
    log: AudioLog,
}

pub fn open(params: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let device = params
        .get(PARAM_ALSA_DEVICE)
        .ok_or(OpenError::MissingParameter {
            index: PARAM_ALSA_DEVICE,
            name: "alsa device",
        })?
        .to_string();
    let output = PollOutput::open_with(device, Box::new(AlsaPollOpener), params.pacing(), log)?;
    Ok(Box::new(output))
}

impl PollOutput {
    /// Open the device and keep it. A poll that sees no progress for
    /// `pacing.max_fragment_wait` fails the play().
    pub fn open_with(
        device_name: String,
        opener: Box<dyn PollPcmOpener>,
        pacing: PacingCorrection,
        log: AudioLog,
    ) -> Result<Self, OpenError> {
        log.info(format_args!("alsa-poll: opening {}", device_name));
        let pcm = opener.open_nonblocking(&device_name).map_err(|e| {
            log.critical(format_args!("alsa-poll: cannot open audio device {}: {:#}", device_name, e));
            OpenError::DeviceUnavailable(format!("{}: {:#}", device_name, e))
        })?;
        let wakeup = Wakeup::new().map_err(|e| {
            log.critical(format_args!("alsa-poll: stop channel creation failed: {}", e));
            OpenError::DeviceUnavailable(format!("stop channel: {}", e))
        })?;

        Ok(Self {
            device_name,
            opener,
            pcm: Mutex::new(Some(pcm)),
            wakeup,
            active: Mutex::new(false),
            stall_limit: pacing.max_fragment_wait,
            log,
        })
    }

    fn set_active(&self, active: bool) {
        let mut guard = lock(&self.active);
        if active {
            self.wakeup.clear();
        }
        *guard = active;
    }

    fn wait(&self, pcm: &mut dyn PollPcm, draining: bool) -> Result<bool, PlayError> {
        match pcm.wait(&self.wakeup, draining, self.stall_limit) {
            Ok(Readiness::Ready) => Ok(false),
            Ok(Readiness::Stopped) => Ok(true),
            Ok(Readiness::TimedOut) => {
                let waited_ms = self.stall_limit.as_millis() as u64;
                self.log.error(format_args!("alsa-poll: device made no progress for {} ms", waited_ms));
                Err(PlayError::DeviceStalled { waited_ms })
            }
            Err(e) => {
                self.log.critical(format_args!("alsa-poll: wait for poll() failed: {:#}", e));
                Err(PlayError::DeviceQuery(format!("{:#}", e)))
            }
        }
    }

    /// Feed `bytes` to the device and let it drain. Returns `true` when
    /// interrupted by stop().
    fn stream(&self, pcm: &mut dyn PollPcm, bytes: &[u8]) -> Result<bool, PlayError> {
        let mut offset = 0;
        while offset < bytes.len() {
            let written = pcm.write(&bytes[offset..]).map_err(|e| {
                self.log.critical(format_args!("alsa-poll: write to audio interface failed: {:#}", e));
                PlayError::WriteFailed(format!("{:#}", e))
            })?;
            offset += written;
            if self.wait(pcm, false)? {
                return Ok(true);
            }
        }

        self.log.info(format_args!("alsa-poll: draining"));
        self.wait(pcm, true)
    }

    fn negotiate(&self, pcm: &mut dyn PollPcm, requested: StreamParams) -> Result<StreamParams, PlayError> {
        let granted = pcm.configure(requested).map_err(|e| {
            self.log.critical(format_args!("alsa-poll: cannot set parameters: {:#}", e));
            PlayError::Negotiation(format!("{:#}", e))
        })?;
        if granted.bits != requested.bits {
            self.log.critical(format_args!("alsa-poll: cannot set sample format to {} bits", requested.bits));
            return Err(PlayError::FormatMismatch {
                requested: requested.bits,
                negotiated: granted.bits,
            });
        }
        if granted.channels != requested.channels {
            self.log.critical(format_args!("alsa-poll: cannot set channel count to {}", requested.channels));
            return Err(PlayError::ChannelMismatch {
                requested: requested.channels,
                negotiated: granted.channels,
            });
        }
        if granted.rate != requested.rate {
            self.log.warning(format_args!(
                "alsa-poll: sample rate {} not supported, using {}",
                requested.rate, granted.rate
            ));
        }
        Ok(granted)
    }
}

/// Pad `bytes` with silence up to a whole number of periods.
fn pad_to_period(mut bytes: Vec<u8>, period_bytes: usize) -> Vec<u8> {
    if period_bytes > 0 && bytes.len() % period_bytes != 0 {
        let padded = bytes.len().div_ceil(period_bytes) * period_bytes;
        bytes.resize(padded, 0);
    }
    bytes
}

impl AudioOutput for PollOutput {
    fn name(&self) -> &'static str {
        NAME
    }

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError> {
        if track.is_empty() {
            return Ok(());
        }
        track.validate().inspect_err(|e| {
            self.log.critical(format_args!("alsa-poll: unsupported sound data format: {}", e));
        })?;

        let mut slot = lock(&self.pcm);
        if slot.is_none() {
            // Dropped after an earlier failure.
            let pcm = self.opener.open_nonblocking(&self.device_name).map_err(|e| {
                self.log.critical(format_args!("alsa-poll: cannot reopen {}: {:#}", self.device_name, e));
                PlayError::DeviceOpen(format!("{:#}", e))
            })?;
            *slot = Some(pcm);
        }
        let Some(pcm) = slot.as_mut() else {
            return Err(PlayError::DeviceOpen("device vanished".into()));
        };

        let requested = StreamParams {
            bits: track.bits,
            channels: track.num_channels,
            rate: track.sample_rate,
        };
        if let Err(e) = self.negotiate(pcm.as_mut(), requested) {
            slot.take();
            return Err(e);
        }

        let scaled = track::scale_volume(track.samples, settings.volume);
        let bytes = track::to_bytes(&scaled, track.bits, ByteOrder::native(), EightBit::Signed);
        let bytes = pad_to_period(bytes, pcm.period_bytes());
        self.log.debug(format_args!("alsa-poll: {} bytes to play", bytes.len()));

        self.set_active(true);
        let outcome = self.stream(pcm.as_mut(), &bytes);
        self.set_active(false);

        if matches!(outcome, Ok(true)) {
            self.log.info(format_args!("alsa-poll: playback stopped"));
        }
        if let Err(e) = pcm.drop_pending() {
            self.log.critical(format_args!("alsa-poll: dropping pending frames failed: {:#}", e));
        }
        if outcome.is_err() {
            self.log.critical(format_args!("alsa-poll: play() abnormal exit, closing the device"));
            slot.take();
        }
        outcome.map(|_| ())
    }

    fn stop(&self) {
        let active = lock(&self.active);
        if *active {
            self.log.info(format_args!("alsa-poll: stop requested"));
            self.wakeup.notify();
        }
    }

    fn close(&self) {
        if lock(&self.pcm).take().is_some() {
            self.log.info(format_args!("alsa-poll: device closed"));
        }
    }

    fn play_command(&self) -> Option<&'static str> {
        Some(super::alsa_pacer::PLAY_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PcmStats, SimulatedPcmOpener};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn output(opener: SimulatedPcmOpener) -> PollOutput {
        PollOutput::open_with("sim".into(), Box::new(opener), PacingCorrection::default(), AudioLog::discard()).unwrap()
    }

    #[test]
    fn wakeup_interrupts_a_wait_and_clears() {
        let wakeup = Wakeup::new().unwrap();
        assert!(!wakeup.wait(Duration::from_millis(10)).unwrap());
        wakeup.notify();
        wakeup.notify();
        assert!(wakeup.wait(Duration::from_secs(1)).unwrap());
        wakeup.clear();
        assert!(!wakeup.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn padding_rounds_up_to_whole_periods() {
        assert_eq!(pad_to_period(vec![1; 10], 4).len(), 12);
        assert_eq!(pad_to_period(vec![1; 8], 4).len(), 8);
        assert_eq!(&pad_to_period(vec![1; 3], 4)[..], &[1, 1, 1, 0]);
    }

    #[test]
    fn device_stays_open_between_plays() {
        let stats = Arc::new(PcmStats::default());
        let out = output(SimulatedPcmOpener::new(stats.clone()));
        let samples = vec![100i16; 400];

        out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();
        out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();

        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.live(), 1);
        // 800 bytes padded to two 512-byte periods, twice
        assert_eq!(stats.bytes_written(), 2048);
        out.close();
        out.close();
        assert_eq!(stats.live(), 0);
        assert_eq!(out.play_command(), Some("aplay"));
    }

    #[test]
    fn plays_for_the_length_of_the_track() {
        let stats = Arc::new(PcmStats::default());
        let out = output(SimulatedPcmOpener::new(stats.clone()));
        let samples = vec![0i16; 2048];

        let start = Instant::now();
        out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "returned after {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(500), "returned after {:?}", elapsed);
    }

    #[test]
    fn stop_wakes_the_poll_immediately() {
        let stats = Arc::new(PcmStats::default());
        let out = Arc::new(output(SimulatedPcmOpener::new(stats.clone())));
        let player = out.clone();

        let handle = thread::spawn(move || {
            let samples = vec![0i16; 8000];
            let start = Instant::now();
            player.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(150));
        let stopped_at = Instant::now();
        out.stop();
        let elapsed = handle.join().unwrap();

        assert!(elapsed < Duration::from_millis(400), "stop took too long: {:?}", elapsed);
        assert!(stopped_at.elapsed() < Duration::from_millis(100));
        assert!(stats.resets() >= 1);
        assert!(stats.bytes_written() < 16000);
    }

    #[test]
    fn stop_before_play_does_not_cut_it_short() {
        let stats = Arc::new(PcmStats::default());
        let out = output(SimulatedPcmOpener::new(stats.clone()));
        out.stop();
        out.stop();

        let samples = vec![0i16; 2048];
        let start = Instant::now();
        out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(stats.bytes_written(), 4096);
    }

    #[test]
    fn stalled_device_fails_and_is_reopened_next_time() {
        let stats = Arc::new(PcmStats::default());
        let pacing = PacingCorrection {
            max_fragment_wait: Duration::from_millis(50),
            ..PacingCorrection::default()
        };
        let opener = SimulatedPcmOpener::new(stats.clone()).stalled();
        let out = PollOutput::open_with("sim".into(), Box::new(opener), pacing, AudioLog::discard()).unwrap();
        let samples = vec![0i16; 800];

        let err = out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::DeviceStalled { .. }));
        assert_eq!(stats.live(), 0);

        let _ = out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default());
        assert_eq!(stats.opened(), 2);
    }

    #[test]
    fn missing_device_fails_open() {
        let stats = Arc::new(PcmStats::default());
        let opener = SimulatedPcmOpener::new(stats).unavailable();
        let err = PollOutput::open_with("sim".into(), Box::new(opener), PacingCorrection::default(), AudioLog::discard())
            .err()
            .unwrap();
        assert!(matches!(err, OpenError::DeviceUnavailable(_)));
    }

    #[test]
    fn format_mismatch_closes_the_device() {
        let stats = Arc::new(PcmStats::default());
        let out = output(SimulatedPcmOpener::new(stats.clone()).grant_bits(8));
        let samples = vec![0i16; 80];
        let err = out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::FormatMismatch { requested: 16, negotiated: 8 }));
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.bytes_written(), 0);
    }
}
