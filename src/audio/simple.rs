//! Simple-protocol backend.
//!
//! Raw PCM is written to a sound server's simple-protocol TCP socket. Each
//! connection starts with a stream header announcing the sample spec and
//! the target buffered length; everything after it is audio. The
//! connection is kept across play() calls and recreated when a track needs
//! a different spec.
//!
//! The server buffers whatever it is sent, so the client paces itself: it
//! stays at most the target length ahead of real time and, once the data
//! is out, waits for the buffered tail to play. Every wait is on the
//! cancellation token.

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, BytesMut};

use super::cancel::{lock, CancelToken, WaitOutcome};
use super::output::{AudioOutput, OpenParams, PlaySettings, PARAM_PULSE_MIN_LENGTH, PARAM_PULSE_SERVER};
use super::track::{self, ByteOrder, EightBit, Track};
use crate::config::DEFAULT_PULSE_MIN_LENGTH;
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

pub const NAME: &str = "pulse";
pub const PLAY_COMMAND: &str = "paplay";

/// Bytes per socket write.
pub const SIMPLE_CHUNK_BYTES: usize = 256;

/// Where `default` points: the conventional simple-protocol TCP port.
pub const DEFAULT_SIMPLE_ADDR: &str = "127.0.0.1:4711";
const DEFAULT_PORT: u16 = 4711;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// First bytes of every stream header.
pub const HEADER_MAGIC: &[u8; 4] = b"SPCM";
pub const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleFormat {
    U8 = 0,
    S16Le = 3,
    S16Be = 4,
}

impl SampleFormat {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SampleFormat::U8),
            3 => Ok(SampleFormat::S16Le),
            4 => Ok(SampleFormat::S16Be),
            other => bail!("unknown sample format {}", other),
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
        }
    }
}

/// Format of the stream a connection was set up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub const INITIAL: SampleSpec = SampleSpec {
        format: SampleFormat::S16Le,
        rate: 44100,
        channels: 1,
    };

    fn for_track(track: &Track<'_>, order: ByteOrder) -> Self {
        let format = match (track.bits, order) {
            (8, _) => SampleFormat::U8,
            (_, ByteOrder::Little) => SampleFormat::S16Le,
            (_, ByteOrder::Big) => SampleFormat::S16Be,
        };
        Self {
            format,
            rate: track.sample_rate,
            channels: track.num_channels as u8,
        }
    }

    pub fn bytes_per_second(&self) -> usize {
        self.format.bytes_per_sample() * usize::from(self.channels) * self.rate as usize
    }
}

/// Stream header: magic, format `u8`, channels `u8`, rate `u32` and target
/// length `u32`, big endian.
pub fn encode_header(spec: &SampleSpec, target_length: u32, dst: &mut BytesMut) {
    dst.reserve(HEADER_LEN);
    dst.put_slice(HEADER_MAGIC);
    dst.put_u8(spec.format as u8);
    dst.put_u8(spec.channels);
    dst.put_u32(spec.rate);
    dst.put_u32(target_length);
}

/// Take a stream header off the front of `src`; `Ok(None)` while more bytes
/// are needed.
pub fn decode_header(src: &mut BytesMut) -> Result<Option<(SampleSpec, u32)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    if &src[..4] != HEADER_MAGIC {
        bail!("stream does not start with a header");
    }
    src.advance(4);
    let format = SampleFormat::from_u8(src.get_u8())?;
    let channels = src.get_u8();
    let rate = src.get_u32();
    let target_length = src.get_u32();
    Ok(Some((SampleSpec { format, rate, channels }, target_length)))
}

struct Connection {
    spec: SampleSpec,
    stream: TcpStream,
}

impl Connection {
    fn open(addr: SocketAddr, spec: SampleSpec, target_length: usize) -> Result<Self> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let mut header = BytesMut::new();
        encode_header(&spec, target_length as u32, &mut header);
        stream.write_all(&header).context("Failed to send the stream header")?;
        Ok(Self { spec, stream })
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.stream.write_all(chunk).context("Failed to write audio data")
    }
}

pub struct SimpleOutput {
    addr: SocketAddr,
    min_length: usize,
    connection: Mutex<Option<Connection>>,
    cancel: CancelToken,
    log: AudioLog,
}

/// Resolve a server string: `default`, `host`, `host:port` or
/// `tcp:host:port`.
pub fn resolve_server(server: Option<&str>) -> Result<SocketAddr> {
    let server = server.unwrap_or(DEFAULT_SIMPLE_ADDR);
    let server = server.strip_prefix("tcp:").unwrap_or(server);
    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_PORT)
    };
    with_port
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", with_port))?
        .next()
        .with_context(|| format!("No address for {}", with_port))
}

/// Zero or non-numeric values fall back to the default.
pub fn parse_min_length(value: Option<&str>) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_PULSE_MIN_LENGTH as usize)
}

pub fn open(params: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let addr = resolve_server(params.target(PARAM_PULSE_SERVER)).map_err(|e| OpenError::InvalidParameter {
        index: PARAM_PULSE_SERVER,
        reason: format!("{:#}", e),
    })?;
    let min_length = parse_min_length(params.get(PARAM_PULSE_MIN_LENGTH));
    Ok(Box::new(SimpleOutput::connect(addr, min_length, log)?))
}

fn seconds(bytes: usize, bytes_per_second: usize) -> Duration {
    Duration::from_secs_f64(bytes as f64 / bytes_per_second.max(1) as f64)
}

impl SimpleOutput {
    /// Connect once with the initial sample spec so an unreachable server
    /// fails at open time. `min_length` is the target buffered length in
    /// bytes announced to the server.
    pub fn connect(addr: SocketAddr, min_length: usize, log: AudioLog) -> Result<Self, OpenError> {
        let connection = Connection::open(addr, SampleSpec::INITIAL, min_length).map_err(|e| {
            log.error(format_args!("pulse: cannot connect to server: {:#}", e));
            OpenError::ConnectionRefused(format!("{:#}", e))
        })?;
        Ok(Self {
            addr,
            min_length,
            connection: Mutex::new(Some(connection)),
            cancel: CancelToken::new(),
            log,
        })
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Write `bytes` in chunks, never more than the target length ahead of
    /// real time. Returns `true` when interrupted by stop().
    fn stream(&self, connection: &mut Connection, bytes: &[u8]) -> Result<bool> {
        let rate = connection.spec.bytes_per_second();
        let start = Instant::now();
        let mut written: usize = 0;

        for chunk in bytes.chunks(SIMPLE_CHUNK_BYTES) {
            let played = (start.elapsed().as_secs_f64() * rate as f64) as usize;
            let ahead = written.saturating_sub(played);
            if ahead + chunk.len() > self.min_length {
                let excess = ahead + chunk.len() - self.min_length;
                if self.cancel.wait_timeout(seconds(excess, rate)) == WaitOutcome::Cancelled {
                    return Ok(true);
                }
            } else if self.cancel.is_cancelled() {
                return Ok(true);
            }
            connection.write_chunk(chunk)?;
            written += chunk.len();
        }

        // The server still holds up to the target length; let it play out.
        let rest = seconds(written, rate).saturating_sub(start.elapsed());
        Ok(self.cancel.wait_timeout(rest) == WaitOutcome::Cancelled)
    }
}

impl AudioOutput for SimpleOutput {
    fn name(&self) -> &'static str {
        NAME
    }

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError> {
        self.cancel.reset();
        if track.is_empty() {
            return Ok(());
        }
        track.validate().inspect_err(|e| {
            self.log.warning(format_args!("pulse: unsupported sound data format: {}", e));
        })?;
        if track.num_channels > u16::from(u8::MAX) {
            return Err(PlayError::InvalidTrack(format!("{} channels", track.num_channels)));
        }
        self.log.info(format_args!("pulse: starting playback"));

        let spec = SampleSpec::for_track(track, settings.byte_order);
        let mut slot = lock(&self.connection);

        if slot.as_ref().is_some_and(|c| c.spec != spec) {
            slot.take();
            self.log.info(format_args!(
                "pulse: reopening connection due to change in track parameters sample_rate:{} bps:{} channels:{}",
                track.sample_rate, track.bits, track.num_channels
            ));
        }
        if slot.is_none() {
            let connection = Connection::open(self.addr, spec, self.min_length).map_err(|e| {
                self.log.error(format_args!("pulse: unable to reconnect to server: {:#}", e));
                PlayError::DeviceOpen(format!("{:#}", e))
            })?;
            *slot = Some(connection);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(PlayError::DeviceOpen("connection vanished".into()));
        };

        let bytes = track::to_bytes(track.samples, track.bits, settings.byte_order, EightBit::Unsigned);
        self.log.debug(format_args!(
            "pulse: bytes to play: {}, ({:.3} secs)",
            bytes.len(),
            track.duration().as_secs_f64()
        ));

        match self.stream(connection, &bytes) {
            Ok(true) => {
                self.log.info(format_args!("pulse: playback stopped"));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                slot.take();
                self.log.notice(format_args!(
                    "pulse: write failed: {:#} - closing device - re-open it in next run",
                    e
                ));
                Err(PlayError::WriteFailed(format!("{:#}", e)))
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn close(&self) {
        self.cancel.cancel();
        if lock(&self.connection).take().is_some() {
            self.log.debug(format_args!("pulse: connection closed"));
        }
    }

    fn play_command(&self) -> Option<&'static str> {
        Some(PLAY_COMMAND)
    }
}
