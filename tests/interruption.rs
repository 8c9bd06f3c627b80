use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use voice_audio_out::audio::alsa_pacer::PacedOutput;
use voice_audio_out::audio::alsa_poll::PollOutput;
use voice_audio_out::audio::event_server::FlowOutput;
use voice_audio_out::audio::live::LiveOutput;
use voice_audio_out::audio::simple::SimpleOutput;
use voice_audio_out::audio::{PacingCorrection, PlaySettings};
use voice_audio_out::testing::{
    PcmStats, FakeFlowServer, FakeSimpleServer, LiveStats, PacedLiveDriver, SimulatedPcmOpener,
};
use voice_audio_out::{AudioLog, AudioOutput, ByteOrder, Device, Track};

const RATE: u32 = 8000;

fn one_second() -> Vec<i16> {
    (0..RATE).map(|n| ((n % 64) as i16 - 32) * 256).collect()
}

fn paced_device(stats: &Arc<PcmStats>) -> Device {
    let backend = PacedOutput::open_with(
        "sim".into(),
        Box::new(SimulatedPcmOpener::new(stats.clone())),
        PacingCorrection::default(),
        AudioLog::discard(),
    )
    .unwrap();
    Device::from_backend(Box::new(backend), AudioLog::discard())
}

fn poll_device(stats: &Arc<PcmStats>) -> Device {
    let backend = PollOutput::open_with(
        "sim".into(),
        Box::new(SimulatedPcmOpener::new(stats.clone())),
        PacingCorrection::default(),
        AudioLog::discard(),
    )
    .unwrap();
    Device::from_backend(Box::new(backend), AudioLog::discard())
}

fn pulse_device(server: &FakeSimpleServer) -> Device {
    let backend = SimpleOutput::connect(server.addr(), 1600, AudioLog::discard()).unwrap();
    Device::from_backend(Box::new(backend), AudioLog::discard())
}

fn live_device(stats: &Arc<LiveStats>) -> Device {
    let backend = LiveOutput::with_driver(Box::new(PacedLiveDriver::new(stats.clone())), AudioLog::discard());
    Device::from_backend(Box::new(backend), AudioLog::discard())
}

/// Play one second of audio on a helper thread, stop it after `after`, and
/// return how long play() took.
fn play_and_stop(device: Arc<Device>, after: Duration) -> Duration {
    let player = device.clone();
    let handle = thread::spawn(move || {
        let samples = one_second();
        let start = Instant::now();
        player.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
        start.elapsed()
    });
    thread::sleep(after);
    device.stop();
    device.stop();
    handle.join().unwrap()
}

#[test]
fn blocking_device_plays_in_real_time() {
    let stats = Arc::new(PcmStats::default());
    let device = paced_device(&stats);
    let samples = one_second();

    let start = Instant::now();
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(800), "finished too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1300), "finished too late: {:?}", elapsed);
    assert_eq!(stats.bytes_written(), 16000);
    assert_eq!(stats.live(), 0);
}

#[test]
fn blocking_device_stops_within_one_pacing_interval() {
    let stats = Arc::new(PcmStats::default());
    let device = Arc::new(paced_device(&stats));

    let elapsed = play_and_stop(device.clone(), Duration::from_millis(200));

    assert!(elapsed < Duration::from_millis(500), "stop took too long: {:?}", elapsed);
    assert!(stats.bytes_written() < 16000);
    assert!(stats.resets() >= 1);
    assert_eq!(stats.live(), 0);
}

#[test]
fn stop_before_play_has_no_effect_on_it() {
    let stats = Arc::new(PcmStats::default());
    let device = paced_device(&stats);
    device.stop();
    device.stop();

    let samples = vec![0i16; 2400];
    let start = Instant::now();
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(stats.bytes_written(), 4800);
}

#[test]
fn poll_device_plays_in_real_time_and_wakes_on_stop() {
    let stats = Arc::new(PcmStats::default());
    let device = Arc::new(poll_device(&stats));
    let samples = one_second();

    let start = Instant::now();
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "finished too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1300), "finished too late: {:?}", elapsed);

    let elapsed = play_and_stop(device.clone(), Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(350), "stop took too long: {:?}", elapsed);
    assert_eq!(stats.opened(), 1);
    device.close();
    assert_eq!(stats.live(), 0);
}

#[test]
fn pulse_plays_in_real_time() {
    let server = FakeSimpleServer::start_realtime();
    let device = pulse_device(&server);
    let samples = one_second();

    let start = Instant::now();
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    let elapsed = start.elapsed();
    device.close();

    assert!(elapsed >= Duration::from_millis(800), "finished too early: {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1300), "finished too late: {:?}", elapsed);
    assert_eq!(server.wait_for_bytes(16000).len(), 16000);
    assert!(server.streams().iter().all(|(_, target)| *target == 1600));
}

#[test]
fn pulse_stops_within_one_chunk() {
    let server = FakeSimpleServer::start_realtime();
    let device = Arc::new(pulse_device(&server));

    let elapsed = play_and_stop(device.clone(), Duration::from_millis(200));

    assert!(elapsed < Duration::from_millis(400), "stop took too long: {:?}", elapsed);
    // at most the target length ahead of the 200 ms already played
    let sent = server.wait_for_bytes(0).len();
    assert!(sent < 16000, "whole track sent: {}", sent);
    assert!(sent <= 3200 + 1600 + 512, "{} bytes sent before stop", sent);

    // the initial connection, then one for the track's spec, which survives
    let samples = vec![0i16; 400];
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    assert_eq!(server.connections(), 2);
}

#[test]
fn live_stream_stops_between_chunks() {
    let stats = Arc::new(LiveStats::default());
    let device = Arc::new(live_device(&stats));

    let elapsed = play_and_stop(device.clone(), Duration::from_millis(200));

    assert!(elapsed < Duration::from_millis(400), "stop took too long: {:?}", elapsed);
    assert!(stats.bytes() < 16000);

    // the stream stays open for the next track
    let samples = vec![0i16; 400];
    device.play(&Track::new(16, 1, RATE, &samples), ByteOrder::native()).unwrap();
    assert_eq!(stats.opened(), 1);
}

#[test]
fn flow_stop_cuts_the_wait_short_and_stops_the_flow() {
    let server = FakeFlowServer::start();
    let backend = FlowOutput::connect(server.addr(), AudioLog::discard()).unwrap();
    let device = Arc::new(Device::from_backend(Box::new(backend), AudioLog::discard()));

    let elapsed = play_and_stop(device.clone(), Duration::from_millis(200));

    assert!(elapsed < Duration::from_millis(500), "stop took too long: {:?}", elapsed);
    assert_eq!(server.wait_for_stop(), Some(1));
    assert_eq!(server.started().len(), 1);
    device.close();
    assert!(server.wait_until_idle());
}

#[test]
fn stop_is_harmless_after_close_for_every_backend() {
    let paced_stats = Arc::new(PcmStats::default());
    let poll_stats = Arc::new(PcmStats::default());
    let live_stats = Arc::new(LiveStats::default());
    let simple_server = FakeSimpleServer::start();
    let flow_server = FakeFlowServer::start();

    let backends: Vec<Box<dyn AudioOutput>> = vec![
        Box::new(
            PacedOutput::open_with(
                "sim".into(),
                Box::new(SimulatedPcmOpener::new(paced_stats.clone())),
                PacingCorrection::default(),
                AudioLog::discard(),
            )
            .unwrap(),
        ),
        Box::new(
            PollOutput::open_with(
                "sim".into(),
                Box::new(SimulatedPcmOpener::new(poll_stats.clone())),
                PacingCorrection::default(),
                AudioLog::discard(),
            )
            .unwrap(),
        ),
        Box::new(LiveOutput::with_driver(
            Box::new(PacedLiveDriver::new(live_stats.clone())),
            AudioLog::discard(),
        )),
        Box::new(SimpleOutput::connect(simple_server.addr(), 100, AudioLog::discard()).unwrap()),
        Box::new(FlowOutput::connect(flow_server.addr(), AudioLog::discard()).unwrap()),
    ];

    let empty = Track::new(16, 1, RATE, &[]);
    for backend in &backends {
        backend.stop();
        backend.play(&empty, PlaySettings::default()).unwrap();
        backend.close();
        backend.stop();
        backend.close();
    }

    assert_eq!(paced_stats.live(), 0);
    assert_eq!(poll_stats.live(), 0);
    assert_eq!(live_stats.opened(), 0);
    assert!(simple_server.wait_until_idle());
    assert!(flow_server.wait_until_idle());
    assert!(flow_server.started().is_empty());
}

#[test]
fn repeated_cycles_release_every_resource() {
    const CYCLES: usize = 5;
    let samples = vec![100i16; 441];

    let paced_stats = Arc::new(PcmStats::default());
    let poll_stats = Arc::new(PcmStats::default());
    let live_stats = Arc::new(LiveStats::default());
    let simple_server = FakeSimpleServer::start();
    let flow_server = FakeFlowServer::start();

    for _ in 0..CYCLES {
        let device = paced_device(&paced_stats);
        device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
        device.close();

        let device = poll_device(&poll_stats);
        device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
        drop(device);

        let device = live_device(&live_stats);
        device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
        drop(device);

        let backend = SimpleOutput::connect(simple_server.addr(), 100, AudioLog::discard()).unwrap();
        let device = Device::from_backend(Box::new(backend), AudioLog::discard());
        device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
        device.close();

        let backend = FlowOutput::connect(flow_server.addr(), AudioLog::discard()).unwrap();
        let device = Device::from_backend(Box::new(backend), AudioLog::discard());
        device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
        device.close();
    }

    assert_eq!(paced_stats.opened(), 2 * CYCLES);
    assert_eq!(paced_stats.live(), 0);
    assert_eq!(poll_stats.opened(), CYCLES);
    assert_eq!(poll_stats.live(), 0);
    assert_eq!(live_stats.opened(), CYCLES);
    assert_eq!(live_stats.live(), 0);
    assert!(simple_server.wait_for_connections(CYCLES));
    assert_eq!(simple_server.connections(), CYCLES);
    assert!(simple_server.wait_until_idle());
    assert!(flow_server.wait_for_connections(CYCLES));
    assert_eq!(flow_server.connections(), CYCLES);
    assert!(flow_server.wait_until_idle());
    assert_eq!(flow_server.started().len(), CYCLES);
}
