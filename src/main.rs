use std::sync::Arc;

use anyhow::Context;
use voice_audio_out::{open_first, AudioLog, AudioSettings, ByteOrder, Track};

const TONE_RATE: u32 = 16000;
const TONE_HZ: f32 = 440.0;

/// One second of a sine tone at 16 bits, mono.
fn tone() -> Vec<i16> {
    (0..TONE_RATE)
        .map(|n| {
            let t = n as f32 / TONE_RATE as f32;
            ((t * TONE_HZ * std::f32::consts::TAU).sin() * 0.3 * f32::from(i16::MAX)) as i16
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，第一个参数为可选的 TOML 文件
    let settings = match std::env::args().nth(1) {
        Some(path) => AudioSettings::load(&path).with_context(|| format!("Failed to load settings from {}", path))?,
        None => AudioSettings::default(),
    };

    let device = Arc::new(open_first(settings.methods(), &settings.open_params(), AudioLog::to_log())?);
    device.set_log_level(settings.audio.log_level);
    log::info!(
        "Playing a test tone through {} (shell equivalent: {})",
        device.name(),
        device.play_command().unwrap_or("none")
    );

    let player = device.clone();
    let mut playback = tokio::task::spawn_blocking(move || {
        let samples = tone();
        player.play(&Track::new(16, 1, TONE_RATE, &samples), ByteOrder::native())
    });

    let outcome = tokio::select! {
        result = &mut playback => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl+C received, stopping playback");
            device.stop();
            playback.await
        }
    };

    device.close();
    outcome.context("Playback thread panicked")??;
    log::info!("Done");
    Ok(())
}
