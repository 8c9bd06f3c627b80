//! Event-server backend.
//!
//! The whole track is handed to the server as one flow. The server gives
//! no progress feedback, so play() blocks in a single timed wait for the
//! clip's duration; stop() stops the flow and cuts that wait short.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;

use super::cancel::{lock, CancelToken, WaitOutcome};
use super::event_pump::EventPump;
use super::flow_protocol::{FlowFormat, Request, MAX_FLOW_DATA};
use super::output::{AudioOutput, OpenParams, PlaySettings, PARAM_FLOW_SERVER};
use super::track::{self, ByteOrder, EightBit, Track, VOLUME_MIN};
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

pub const NAME: &str = "flow";

/// Environment variable consulted when the server is `default`.
pub const SERVER_ENV: &str = "AUDIOSERVER";
pub const DEFAULT_FLOW_SERVER: &str = "localhost:5450";
const DEFAULT_PORT: u16 = 5450;

/// How long play() waits for the server to accept a flow.
const START_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FlowOutput {
    pump: EventPump,
    start_timeout: Duration,
    /// Id of the flow currently playing, 0 when idle.
    flow: Mutex<u32>,
    done: CancelToken,
    log: AudioLog,
}

/// Resolve `tcp/host:port`, `host:port` or `host`; `None` means the
/// `AUDIOSERVER` environment variable or the local default.
pub fn resolve_server(server: Option<&str>) -> Result<SocketAddr> {
    let server = match server {
        Some(s) => s.to_string(),
        None => std::env::var(SERVER_ENV).unwrap_or_else(|_| DEFAULT_FLOW_SERVER.to_string()),
    };
    let server = server.strip_prefix("tcp/").unwrap_or(&server);
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

/// Server gain for a volume in `VOLUME_MIN..=VOLUME_MAX`.
pub fn flow_volume(volume: i32) -> u32 {
    (((volume - VOLUME_MIN) / 2) * 1500).max(0) as u32
}

pub fn open(params: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let addr = resolve_server(params.target(PARAM_FLOW_SERVER)).map_err(|e| {
        log.critical(format_args!("flow: can't resolve the audio server: {:#}", e));
        OpenError::InvalidParameter {
            index: PARAM_FLOW_SERVER,
            reason: format!("{:#}", e),
        }
    })?;
    Ok(Box::new(FlowOutput::connect(addr, log)?))
}

impl FlowOutput {
    pub fn connect(addr: SocketAddr, log: AudioLog) -> Result<Self, OpenError> {
        let pump = EventPump::start(addr, log.clone()).inspect_err(|e| {
            log.critical(format_args!("flow: can't connect to the audio server: {}", e));
        })?;
        Ok(Self {
            pump,
            start_timeout: START_TIMEOUT,
            flow: Mutex::new(0),
            done: CancelToken::new(),
            log,
        })
    }

    /// How long play() waits for the server to accept a flow.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    fn flow_request(track: &Track<'_>, volume: i32) -> Request {
        let (format, bits) = if track.bits == 8 {
            (FlowFormat::LinearSigned8, 8)
        } else {
            (FlowFormat::LinearSigned16Lsb, 16)
        };
        let data = track::to_bytes(track.samples, bits, ByteOrder::Little, EightBit::Signed);
        Request::PlayFromData {
            format,
            channels: track.num_channels as u8,
            rate: track.sample_rate,
            volume: flow_volume(volume),
            frames: track.num_samples() as u32,
            data: Bytes::from(data),
        }
    }
}

impl AudioOutput for FlowOutput {
    fn name(&self) -> &'static str {
        NAME
    }

    fn play(&self, track: &Track<'_>, settings: PlaySettings) -> Result<(), PlayError> {
        self.done.reset();
        if track.is_empty() {
            return Ok(());
        }
        let bytes_per_sample = track.validate().inspect_err(|e| {
            self.log.warning(format_args!("flow: unsupported sound data format: {}", e));
        })?;
        if track.num_channels > u16::from(u8::MAX) {
            return Err(PlayError::InvalidTrack(format!("{} channels", track.num_channels)));
        }
        let data_len = track.num_samples() * usize::from(track.num_channels) * bytes_per_sample;
        if data_len > MAX_FLOW_DATA {
            self.log.error(format_args!(
                "flow: track of {} bytes exceeds the {} byte flow limit",
                data_len, MAX_FLOW_DATA
            ));
            return Err(PlayError::InvalidTrack(format!("{} bytes of sample data", data_len)));
        }

        let request = Self::flow_request(track, settings.volume);
        let flow = self.pump.start_flow(request, self.start_timeout).inspect_err(|e| {
            self.log.error(format_args!("flow: couldn't start data flow: {}", e));
        })?;

        {
            let mut current = lock(&self.flow);
            if self.done.is_cancelled() {
                // stop() ran while the flow was being set up and found nothing to stop.
                self.pump.stop_flow(flow);
                return Ok(());
            }
            *current = flow;
        }

        let length = track.duration();
        let start = Instant::now();
        if self.done.wait_timeout(length) == WaitOutcome::Cancelled {
            self.log.info(format_args!(
                "flow: playback stopped after {:.3} of {:.3} s",
                start.elapsed().as_secs_f64(),
                length.as_secs_f64()
            ));
        }

        *lock(&self.flow) = 0;
        Ok(())
    }

    fn stop(&self) {
        let mut current = lock(&self.flow);
        if *current != 0 && !self.pump.stop_flow(*current) {
            self.log.debug(format_args!("flow: event pump is gone, flow {} not stopped", *current));
        }
        *current = 0;
        // Cancelled under the flow lock so play() sees either the id cleared or the token set.
        self.done.cancel();
    }

    fn close(&self) {
        self.done.cancel();
        self.pump.shutdown();
        *lock(&self.flow) = 0;
    }

    fn play_command(&self) -> Option<&'static str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFlowServer;

    #[test]
    fn volume_mapping() {
        assert_eq!(flow_volume(-100), 0);
        assert_eq!(flow_volume(0), 75000);
        assert_eq!(flow_volume(100), 150000);
    }

    #[test]
    fn server_addresses() {
        assert_eq!(resolve_server(Some("tcp/127.0.0.1:8000")).unwrap().port(), 8000);
        assert_eq!(resolve_server(Some("127.0.0.1")).unwrap().port(), 5450);
    }

    #[test]
    fn connect_refused() {
        let addr = FakeFlowServer::unused_addr();
        let err = FlowOutput::connect(addr, AudioLog::discard()).err().unwrap();
        assert!(matches!(err, OpenError::ConnectionRefused(_)));
    }

    #[test]
    fn short_track_plays_for_its_duration() {
        let server = FakeFlowServer::start();
        let out = FlowOutput::connect(server.addr(), AudioLog::discard()).unwrap();
        let samples = vec![3i16; 800];

        let start = Instant::now();
        out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap();
        let elapsed = start.elapsed();
        out.close();

        assert!(elapsed >= Duration::from_millis(95), "{:?}", elapsed);
        let started = server.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].frames, 800);
        assert_eq!(started[0].volume, 75000);
        assert_eq!(started[0].data_len, 1600);
        assert!(server.stopped().is_empty());
    }

    #[test]
    fn refused_flow_is_a_play_error() {
        let server = FakeFlowServer::start_refusing();
        let out = FlowOutput::connect(server.addr(), AudioLog::discard()).unwrap();
        let samples = vec![3i16; 80];
        let err = out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::StartFlow(_)));
        out.close();
    }

    #[test]
    fn flow_started_after_play_gave_up_is_stopped() {
        let server = FakeFlowServer::start_slow(Duration::from_millis(400));
        let out = FlowOutput::connect(server.addr(), AudioLog::discard())
            .unwrap()
            .with_start_timeout(Duration::from_millis(100));
        let samples = vec![3i16; 8000];

        let err = out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::StartFlow(_)));

        // The server starts the flow late; the pump stops it on arrival.
        assert_eq!(server.wait_for_stop(), Some(1));
        assert_eq!(server.started().len(), 1);
        out.close();
    }

    #[test]
    fn oversized_track_is_rejected_before_sending() {
        let server = FakeFlowServer::start();
        let out = FlowOutput::connect(server.addr(), AudioLog::discard()).unwrap();
        let samples = vec![0i16; MAX_FLOW_DATA / 2 + 1];

        let err = out.play(&Track::new(16, 1, 44100, &samples), PlaySettings::default()).unwrap_err();
        assert!(matches!(err, PlayError::InvalidTrack(_)));
        out.close();
        assert!(server.wait_until_idle());
        assert!(server.started().is_empty());
    }

    #[test]
    fn stop_and_close_in_any_order() {
        let server = FakeFlowServer::start();
        let out = FlowOutput::connect(server.addr(), AudioLog::discard()).unwrap();
        out.stop();
        out.stop();
        out.close();
        out.close();
        out.stop();
        let samples = vec![3i16; 80];
        assert!(matches!(
            out.play(&Track::new(16, 1, 8000, &samples), PlaySettings::default()),
            Err(PlayError::StartFlow(_))
        ));
    }
}
