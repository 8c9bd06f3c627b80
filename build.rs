use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Defaults {
    audio: Audio,
    pacing: Pacing,
}

#[derive(Deserialize)]
struct Audio {
    output_methods: String,
    alsa_device: String,
    flow_server: String,
    pulse_server: String,
    pulse_min_length: u32,
    log_level: String,
}

#[derive(Deserialize)]
struct Pacing {
    lead_ms: u64,
    settle_ms: u64,
    max_fragment_wait_ms: u64,
}

// 在编译时读取 audio.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=audio.toml");

    let defaults_path = Path::new("audio.toml");
    if !defaults_path.exists() {
        panic!("audio.toml not found!");
    }

    let defaults_str = fs::read_to_string(defaults_path).expect("Failed to read audio.toml");
    let defaults: Defaults = toml::from_str(&defaults_str).expect("Failed to parse audio.toml");

    // 音频输出配置
    println!("cargo:rustc-env=AUDIO_OUTPUT_METHODS={}", defaults.audio.output_methods);
    println!("cargo:rustc-env=AUDIO_ALSA_DEVICE={}", defaults.audio.alsa_device);
    println!("cargo:rustc-env=AUDIO_FLOW_SERVER={}", defaults.audio.flow_server);
    println!("cargo:rustc-env=AUDIO_PULSE_SERVER={}", defaults.audio.pulse_server);
    println!("cargo:rustc-env=AUDIO_PULSE_MIN_LENGTH={}", defaults.audio.pulse_min_length);
    println!("cargo:rustc-env=AUDIO_LOG_LEVEL={}", defaults.audio.log_level);

    // Pacing corrections for the blocking device backend
    println!("cargo:rustc-env=PACING_LEAD_MS={}", defaults.pacing.lead_ms);
    println!("cargo:rustc-env=PACING_SETTLE_MS={}", defaults.pacing.settle_ms);
    println!("cargo:rustc-env=PACING_MAX_FRAGMENT_WAIT_MS={}", defaults.pacing.max_fragment_wait_ms);
}
