//! Test doubles for the native transports.
//!
//! Each double counts what it opens and closes so tests can check that
//! open/play/close cycles leave nothing behind. The network fakes listen
//! on loopback and record what the backends send.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::BytesMut;

use crate::audio::cancel::lock;
use crate::audio::alsa_pacer::{BufferSpace, PcmDevice, PcmOpener, StreamParams};
use crate::audio::alsa_poll::{PollPcm, PollPcmOpener, Readiness, Wakeup};
use crate::audio::flow_protocol::{self, Event, Request, ServerError};
use crate::audio::live::{LiveDriver, LiveFormat, LiveSink};
use crate::audio::simple::{self, SampleSpec};
use crate::audio::track;

const POLL: Duration = Duration::from_millis(5);
const PATIENCE: Duration = Duration::from_secs(5);

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < PATIENCE {
        if done() {
            return true;
        }
        thread::sleep(POLL);
    }
    done()
}

// ---------------------------------------------------------------------------
// Blocking device

/// Counters shared by a [`SimulatedPcmOpener`] and every device it opens.
#[derive(Debug, Default)]
pub struct PcmStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    bytes_written: AtomicUsize,
    syncs: AtomicUsize,
    resets: AtomicUsize,
}

impl PcmStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Devices currently open.
    pub fn live(&self) -> usize {
        self.opened() - self.closed.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

const SIM_FRAGMENTS: usize = 16;
const SIM_FRAGMENT_SIZE: usize = 512;

/// Opens simulated devices whose buffer drains in real time at the granted
/// rate: 16 fragments of 512 bytes.
#[derive(Debug, Clone)]
pub struct SimulatedPcmOpener {
    stats: Arc<PcmStats>,
    unavailable: bool,
    stalled: bool,
    grant_bits: Option<u16>,
    grant_channels: Option<u16>,
    grant_rate: Option<u32>,
}

impl SimulatedPcmOpener {
    pub fn new(stats: Arc<PcmStats>) -> Self {
        Self {
            stats,
            unavailable: false,
            stalled: false,
            grant_bits: None,
            grant_channels: None,
            grant_rate: None,
        }
    }

    /// Every open fails.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// The device never reports a free fragment.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn grant_bits(mut self, bits: u16) -> Self {
        self.grant_bits = Some(bits);
        self
    }

    pub fn grant_channels(mut self, channels: u16) -> Self {
        self.grant_channels = Some(channels);
        self
    }

    pub fn grant_rate(mut self, rate: u32) -> Self {
        self.grant_rate = Some(rate);
        self
    }
}

impl PcmOpener for SimulatedPcmOpener {
    fn open(&self, device: &str) -> Result<Box<dyn PcmDevice>> {
        if self.unavailable {
            bail!("no such device: {}", device);
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedPcm {
            config: self.clone(),
            bytes_per_second: 0.0,
            queued: 0.0,
            last_drain: Instant::now(),
        }))
    }
}

struct SimulatedPcm {
    config: SimulatedPcmOpener,
    bytes_per_second: f64,
    queued: f64,
    last_drain: Instant,
}

impl SimulatedPcm {
    fn capacity() -> usize {
        SIM_FRAGMENTS * SIM_FRAGMENT_SIZE
    }

    fn drain(&mut self) {
        let now = Instant::now();
        let played = now.duration_since(self.last_drain).as_secs_f64() * self.bytes_per_second;
        self.queued = (self.queued - played).max(0.0);
        self.last_drain = now;
    }

    fn free(&mut self) -> usize {
        self.drain();
        Self::capacity().saturating_sub(self.queued.ceil() as usize)
    }
}

impl PcmDevice for SimulatedPcm {
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams> {
        let granted = StreamParams {
            bits: self.config.grant_bits.unwrap_or(requested.bits),
            channels: self.config.grant_channels.unwrap_or(requested.channels),
            rate: self.config.grant_rate.unwrap_or(requested.rate),
        };
        let frame_bytes = usize::from(granted.bits / 8) * usize::from(granted.channels);
        self.bytes_per_second = (frame_bytes as f64) * f64::from(granted.rate);
        Ok(granted)
    }

    fn space(&mut self) -> Result<BufferSpace> {
        if self.config.stalled {
            return Ok(BufferSpace {
                fragments: 0,
                fragment_size: SIM_FRAGMENT_SIZE,
                bytes: 0,
            });
        }
        let free = self.free();
        Ok(BufferSpace {
            fragments: free / SIM_FRAGMENT_SIZE,
            fragment_size: SIM_FRAGMENT_SIZE,
            bytes: free,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let taken = bytes.len().min(self.free());
        self.queued += taken as f64;
        self.config.stats.bytes_written.fetch_add(taken, Ordering::SeqCst);
        Ok(taken)
    }

    fn reset(&mut self) -> Result<()> {
        self.queued = 0.0;
        self.config.stats.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.config.stats.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SimulatedPcm {
    fn drop(&mut self) {
        self.config.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

const SIM_PERIOD_FRAMES: usize = 256;
const SIM_PERIODS: usize = 4;

impl PollPcmOpener for SimulatedPcmOpener {
    /// Non-blocking variant: four periods of 256 frames, ready once a whole
    /// period is free.
    fn open_nonblocking(&self, device: &str) -> Result<Box<dyn PollPcm>> {
        if self.unavailable {
            bail!("no such device: {}", device);
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedPollPcm {
            config: self.clone(),
            bytes_per_second: 0.0,
            period_bytes: 0,
            queued: 0.0,
            last_drain: Instant::now(),
        }))
    }
}

struct SimulatedPollPcm {
    config: SimulatedPcmOpener,
    bytes_per_second: f64,
    period_bytes: usize,
    queued: f64,
    last_drain: Instant,
}

impl SimulatedPollPcm {
    fn capacity(&self) -> usize {
        self.period_bytes * SIM_PERIODS
    }

    fn drain(&mut self) {
        let now = Instant::now();
        let played = now.duration_since(self.last_drain).as_secs_f64() * self.bytes_per_second;
        self.queued = (self.queued - played).max(0.0);
        self.last_drain = now;
    }
}

impl PollPcm for SimulatedPollPcm {
    fn configure(&mut self, requested: StreamParams) -> Result<StreamParams> {
        let granted = StreamParams {
            bits: self.config.grant_bits.unwrap_or(requested.bits),
            channels: self.config.grant_channels.unwrap_or(requested.channels),
            rate: self.config.grant_rate.unwrap_or(requested.rate),
        };
        let frame_bytes = usize::from(granted.bits / 8) * usize::from(granted.channels);
        self.bytes_per_second = (frame_bytes as f64) * f64::from(granted.rate);
        self.period_bytes = SIM_PERIOD_FRAMES * frame_bytes;
        self.queued = 0.0;
        self.last_drain = Instant::now();
        Ok(granted)
    }

    fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.config.stalled {
            return Ok(0);
        }
        self.drain();
        let free = self.capacity().saturating_sub(self.queued.ceil() as usize);
        let taken = bytes.len().min(free);
        self.queued += taken as f64;
        self.config.stats.bytes_written.fetch_add(taken, Ordering::SeqCst);
        Ok(taken)
    }

    fn wait(&mut self, wakeup: &Wakeup, draining: bool, timeout: Duration) -> Result<Readiness> {
        self.drain();
        let until_ready = if self.config.stalled || self.bytes_per_second <= 0.0 {
            None
        } else {
            let target = if draining {
                0.0
            } else {
                self.capacity().saturating_sub(self.period_bytes) as f64
            };
            Some(Duration::from_secs_f64((self.queued - target).max(0.0) / self.bytes_per_second))
        };

        match until_ready {
            Some(delay) if delay <= timeout => {
                if wakeup.wait(delay)? {
                    return Ok(Readiness::Stopped);
                }
                Ok(Readiness::Ready)
            }
            _ => {
                if wakeup.wait(timeout)? {
                    return Ok(Readiness::Stopped);
                }
                Ok(Readiness::TimedOut)
            }
        }
    }

    fn drop_pending(&mut self) -> Result<()> {
        self.queued = 0.0;
        self.config.stats.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SimulatedPollPcm {
    fn drop(&mut self) {
        self.config.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Live stream

#[derive(Debug, Default)]
pub struct LiveStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    bytes: AtomicUsize,
    chunks: AtomicUsize,
    last_samples: Mutex<Vec<i16>>,
}

impl LiveStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.opened() - self.closed.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    /// Samples of the most recent chunk, decoded in the stream's format.
    pub fn last_samples(&self) -> Vec<i16> {
        lock(&self.last_samples).clone()
    }
}

/// Live driver whose sinks sleep for as long as each chunk would play.
pub struct PacedLiveDriver {
    stats: Arc<LiveStats>,
    attempts: Arc<AtomicUsize>,
    fail_on_chunk: Option<usize>,
}

impl PacedLiveDriver {
    pub fn new(stats: Arc<LiveStats>) -> Self {
        Self {
            stats,
            attempts: Arc::new(AtomicUsize::new(0)),
            fail_on_chunk: None,
        }
    }

    /// The `n`th chunk written through this driver (1-based) fails.
    pub fn fail_on_chunk(mut self, n: usize) -> Self {
        self.fail_on_chunk = Some(n);
        self
    }
}

impl LiveDriver for PacedLiveDriver {
    fn open_live(&self, format: &LiveFormat) -> Result<Box<dyn LiveSink>> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(PacedSink {
            stats: self.stats.clone(),
            attempts: self.attempts.clone(),
            fail_on_chunk: self.fail_on_chunk,
            format: *format,
        }))
    }
}

struct PacedSink {
    stats: Arc<LiveStats>,
    attempts: Arc<AtomicUsize>,
    fail_on_chunk: Option<usize>,
    format: LiveFormat,
}

impl LiveSink for PacedSink {
    fn play(&mut self, bytes: &[u8]) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_chunk == Some(attempt) {
            bail!("device disappeared");
        }
        let frame_bytes = usize::from(self.format.bits / 8) * usize::from(self.format.channels);
        let seconds = bytes.len() as f64 / frame_bytes.max(1) as f64 / f64::from(self.format.rate.max(1));
        thread::sleep(Duration::from_secs_f64(seconds));

        *lock(&self.stats.last_samples) = track::from_bytes(bytes, self.format.bits, self.format.byte_order);
        self.stats.bytes.fetch_add(bytes.len(), Ordering::SeqCst);
        self.stats.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for PacedSink {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Loopback servers

/// Accept loop shared by the fake servers; stops when dropped.
struct Acceptor {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    disconnections: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl Acceptor {
    fn start<F>(serve: F) -> Self
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(e) => panic!("cannot bind a loopback listener: {}", e),
        };
        let addr = listener.local_addr().unwrap_or_else(|e| panic!("no local address: {}", e));
        listener
            .set_nonblocking(true)
            .unwrap_or_else(|e| panic!("cannot make the listener non-blocking: {}", e));

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));
        let disconnections = Arc::new(AtomicUsize::new(0));
        let serve = Arc::new(serve);

        let worker = {
            let running = running.clone();
            let connections = connections.clone();
            let disconnections = disconnections.clone();
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::SeqCst);
                            let _ = stream.set_nonblocking(false);
                            let serve = serve.clone();
                            let disconnections = disconnections.clone();
                            thread::spawn(move || {
                                serve(stream);
                                disconnections.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                        Err(_) => thread::sleep(POLL),
                    }
                }
            })
        };

        Self {
            addr,
            running,
            connections,
            disconnections,
            worker: Some(worker),
        }
    }

    fn wait_for_connections(&self, n: usize) -> bool {
        wait_until(|| self.connections.load(Ordering::SeqCst) >= n)
    }

    fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst) - self.disconnections.load(Ordering::SeqCst)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// An address nothing listens on.
fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|e| panic!("cannot bind: {}", e));
    listener.local_addr().unwrap_or_else(|e| panic!("no local address: {}", e))
}

/// Simple-protocol sound server stand-in. Records the stream header of
/// every connection and the audio that follows it.
pub struct FakeSimpleServer {
    acceptor: Acceptor,
    received: Arc<Mutex<Vec<u8>>>,
    streams: Arc<Mutex<Vec<(SampleSpec, u32)>>>,
}

impl FakeSimpleServer {
    /// Audio is taken as fast as it arrives.
    pub fn start() -> Self {
        Self::spawn(false)
    }

    /// Audio is consumed at the byte rate announced in the stream header,
    /// like a sound card behind the server would.
    pub fn start_realtime() -> Self {
        Self::spawn(true)
    }

    fn spawn(realtime: bool) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let streams = Arc::new(Mutex::new(Vec::new()));
        let (sink, seen) = (received.clone(), streams.clone());
        let acceptor = Acceptor::start(move |stream| serve_pcm(stream, &sink, &seen, realtime));
        Self {
            acceptor,
            received,
            streams,
        }
    }

    /// Sample spec and target length announced by each connection, in
    /// connection order.
    pub fn streams(&self) -> Vec<(SampleSpec, u32)> {
        lock(&self.streams).clone()
    }

    pub fn unused_addr() -> SocketAddr {
        unused_addr()
    }

    pub fn addr(&self) -> SocketAddr {
        self.acceptor.addr
    }

    pub fn connections(&self) -> usize {
        self.acceptor.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` connections have been accepted.
    pub fn wait_for_connections(&self, n: usize) -> bool {
        self.acceptor.wait_for_connections(n)
    }

    /// Wait until every accepted connection has been closed by the client.
    pub fn wait_until_idle(&self) -> bool {
        wait_until(|| self.acceptor.open_connections() == 0)
    }

    /// Wait for at least `n` bytes and return everything received so far.
    pub fn wait_for_bytes(&self, n: usize) -> Vec<u8> {
        wait_until(|| lock(&self.received).len() >= n);
        lock(&self.received).clone()
    }
}

fn serve_pcm(mut stream: TcpStream, received: &Mutex<Vec<u8>>, streams: &Mutex<Vec<(SampleSpec, u32)>>, realtime: bool) {
    let mut inbox = BytesMut::with_capacity(4096);
    let mut spec: Option<SampleSpec> = None;
    let mut buf = [0u8; 512];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        inbox.extend_from_slice(&buf[..n]);
        let Some(current) = spec else {
            match simple::decode_header(&mut inbox) {
                Ok(Some((header, target))) => {
                    lock(streams).push((header, target));
                    spec = Some(header);
                }
                Ok(None) => continue,
                Err(_) => return,
            }
            let audio = inbox.split();
            lock(received).extend_from_slice(&audio);
            continue;
        };
        let audio = inbox.split();
        lock(received).extend_from_slice(&audio);
        if realtime {
            let seconds = audio.len() as f64 / current.bytes_per_second().max(1) as f64;
            thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

/// A flow the fake event server was asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedFlow {
    pub flow: u32,
    pub channels: u8,
    pub rate: u32,
    pub volume: u32,
    pub frames: u32,
    pub data_len: usize,
}

#[derive(Debug, Default)]
struct FlowLog {
    started: Mutex<Vec<StartedFlow>>,
    stopped: Mutex<Vec<u32>>,
    next_flow: AtomicUsize,
}

/// Event server that accepts (or refuses) every flow and records stops.
pub struct FakeFlowServer {
    acceptor: Acceptor,
    log: Arc<FlowLog>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FlowBehaviour {
    refuse: bool,
    reply_delay: Duration,
}

impl FakeFlowServer {
    pub fn start() -> Self {
        Self::spawn(FlowBehaviour::default())
    }

    /// Every flow request is answered with a server error.
    pub fn start_refusing() -> Self {
        Self::spawn(FlowBehaviour {
            refuse: true,
            ..FlowBehaviour::default()
        })
    }

    /// Flows are started, but the answer is held back for `delay`.
    pub fn start_slow(delay: Duration) -> Self {
        Self::spawn(FlowBehaviour {
            reply_delay: delay,
            ..FlowBehaviour::default()
        })
    }

    fn spawn(behaviour: FlowBehaviour) -> Self {
        let log = Arc::new(FlowLog::default());
        let shared = log.clone();
        let acceptor = Acceptor::start(move |stream| serve_flows(stream, &shared, behaviour));
        Self { acceptor, log }
    }

    pub fn unused_addr() -> SocketAddr {
        unused_addr()
    }

    pub fn addr(&self) -> SocketAddr {
        self.acceptor.addr
    }

    pub fn connections(&self) -> usize {
        self.acceptor.connections.load(Ordering::SeqCst)
    }

    pub fn wait_for_connections(&self, n: usize) -> bool {
        self.acceptor.wait_for_connections(n)
    }

    pub fn wait_until_idle(&self) -> bool {
        wait_until(|| self.acceptor.open_connections() == 0)
    }

    pub fn started(&self) -> Vec<StartedFlow> {
        lock(&self.log.started).clone()
    }

    pub fn stopped(&self) -> Vec<u32> {
        lock(&self.log.stopped).clone()
    }

    /// Wait for the first StopFlow request.
    pub fn wait_for_stop(&self) -> Option<u32> {
        wait_until(|| !lock(&self.log.stopped).is_empty());
        lock(&self.log.stopped).first().copied()
    }
}

fn serve_flows(mut stream: TcpStream, log: &FlowLog, behaviour: FlowBehaviour) {
    let mut inbox = BytesMut::with_capacity(4096);
    let mut outbox = BytesMut::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => inbox.extend_from_slice(&buf[..n]),
        }
        let mut delay = Duration::ZERO;
        loop {
            let (serial, request) = match flow_protocol::decode_request(&mut inbox) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            match request {
                Request::PlayFromData {
                    channels,
                    rate,
                    volume,
                    frames,
                    data,
                    ..
                } if !behaviour.refuse => {
                    let flow = log.next_flow.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    lock(&log.started).push(StartedFlow {
                        flow,
                        channels,
                        rate,
                        volume,
                        frames,
                        data_len: data.len(),
                    });
                    flow_protocol::encode_event(serial, &Event::FlowStarted { flow }, &mut outbox);
                    delay = behaviour.reply_delay;
                }
                Request::PlayFromData { .. } => {
                    let err = ServerError {
                        error_code: 11,
                        request_code: 1,
                        minor_code: 0,
                        resource_id: 0,
                    };
                    flow_protocol::encode_event(serial, &Event::Error(err), &mut outbox);
                }
                Request::StopFlow { flow } => {
                    lock(&log.stopped).push(flow);
                    flow_protocol::encode_event(0, &Event::FlowDone { flow }, &mut outbox);
                }
            }
        }
        if !outbox.is_empty() {
            thread::sleep(delay);
            if stream.write_all(&outbox).is_err() {
                return;
            }
            outbox.clear();
        }
    }
}
