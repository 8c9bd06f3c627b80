use std::sync::Arc;

use voice_audio_out::audio::live::LiveOutput;
use voice_audio_out::audio::registry::{self, open_first_in, BackendEntry};
use voice_audio_out::audio::{OpenParams, PARAM_FLOW_SERVER, PARAM_PULSE_MIN_LENGTH, PARAM_PULSE_SERVER};
use voice_audio_out::testing::{FakeFlowServer, FakeSimpleServer, LiveStats, PacedLiveDriver};
use voice_audio_out::{AudioLog, AudioOutput, AudioSettings, ByteOrder, OpenError, Severity, Track};

fn open_missing(_: &OpenParams, _: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    Err(OpenError::DeviceUnavailable("unplugged".into()))
}

fn open_paced(_: &OpenParams, log: AudioLog) -> Result<Box<dyn AudioOutput>, OpenError> {
    let driver = PacedLiveDriver::new(Arc::new(LiveStats::default()));
    Ok(Box::new(LiveOutput::with_driver(Box::new(driver), log)))
}

const TABLE: [BackendEntry; 2] = [
    BackendEntry {
        name: "unplugged",
        open: open_missing,
        play_command: None,
    },
    BackendEntry {
        name: "paced",
        open: open_paced,
        play_command: None,
    },
];

#[test]
fn falls_back_to_the_next_method() {
    let device = open_first_in(&TABLE, ["unplugged", "paced"], &OpenParams::default(), AudioLog::discard()).unwrap();
    assert_eq!(device.name(), "cpal");

    let samples = vec![0i16; 100];
    device.play(&Track::new(16, 1, 8000, &samples), ByteOrder::native()).unwrap();
}

#[test]
fn each_opened_device_has_its_own_log_level() {
    let log = AudioLog::discard();
    let first = open_first_in(&TABLE, ["paced"], &OpenParams::default(), log.clone()).unwrap();
    let second = open_first_in(&TABLE, ["paced"], &OpenParams::default(), log.clone()).unwrap();

    first.set_log_level(Severity::Critical);
    assert_eq!(first.log_level(), Severity::Critical);
    assert_eq!(second.log_level(), Severity::Debug);
    assert_eq!(log.level(), Severity::Debug);
}

#[test]
fn reports_everything_it_tried() {
    let err = open_first_in(&TABLE, ["unplugged", "nowhere"], &OpenParams::default(), AudioLog::discard())
        .unwrap_err();
    match err {
        OpenError::NoBackendAvailable { tried } => assert_eq!(tried, "unplugged,nowhere"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn network_backends_fail_to_open_without_a_server() {
    let addr = FakeSimpleServer::unused_addr();
    let params = OpenParams::default()
        .set(PARAM_PULSE_SERVER, addr.to_string())
        .set(PARAM_FLOW_SERVER, format!("tcp/{}", addr));

    let err = registry::open_first(["pulse", "flow"], &params, AudioLog::discard()).unwrap_err();
    assert!(matches!(err, OpenError::NoBackendAvailable { .. }));

    let err = registry::open_first(["flow"], &params, AudioLog::discard()).unwrap_err();
    assert!(matches!(err, OpenError::ConnectionRefused(_)));
}

#[test]
fn settings_select_and_address_the_backend() {
    let server = FakeSimpleServer::start();
    let mut settings = AudioSettings::default();
    settings.apply("audio_output_method", "flow,pulse").unwrap();
    settings.apply("audio_flow_server", &format!("tcp/{}", FakeFlowServer::unused_addr())).unwrap();
    settings.apply("audio_pulse_server", &server.addr().to_string()).unwrap();
    settings.apply("audio_pulse_min_length", "0").unwrap();

    let params = settings.open_params();
    assert_eq!(params.get(PARAM_PULSE_MIN_LENGTH), Some("0"));

    let device = registry::open_first(settings.methods(), &params, AudioLog::discard()).unwrap();
    assert_eq!(device.name(), "pulse");
    assert_eq!(device.play_command(), Some("paplay"));

    let samples = vec![0x0101i16; 200];
    device.play(&Track::new(16, 1, 44100, &samples), ByteOrder::native()).unwrap();
    device.close();
    assert_eq!(server.wait_for_bytes(400).len(), 400);
}
