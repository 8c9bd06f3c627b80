//! cpal output stream behind a blocking, chunked write interface.
//!
//! `cpal::Stream` must stay on the thread that built it, so each open
//! stream gets a small owner thread that builds it, reports readiness and
//! then parks until the sink is dropped. Samples reach the audio callback
//! through an `rtrb` ring buffer; the callback plays silence when it runs
//! dry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, Producer, RingBuffer};

use super::live::{LiveDriver, LiveFormat, LiveSink};
use super::track;
use crate::logging::AudioLog;

/// Ring buffer length in milliseconds of audio.
const RING_MS: u32 = 100;
/// Poll interval while the ring buffer is full.
const FULL_POLL: Duration = Duration::from_millis(1);
/// A write that makes no progress for this long fails.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

pub struct CpalDriver {
    log: AudioLog,
}

impl CpalDriver {
    pub fn new(log: AudioLog) -> Self {
        Self { log }
    }
}

impl LiveDriver for CpalDriver {
    fn open_live(&self, format: &LiveFormat) -> Result<Box<dyn LiveSink>> {
        let capacity = (format.rate * u32::from(format.channels) * RING_MS / 1000).max(1024) as usize;
        let (producer, consumer) = RingBuffer::<i16>::new(capacity);
        let failed = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let worker = {
            let format = *format;
            let failed = failed.clone();
            let log = self.log.clone();
            thread::Builder::new()
                .name("live-output".into())
                .spawn(move || {
                    let stream = match build_stream(&format, consumer, failed, log) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // Returns once the sink drops its sender.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                })
                .context("Failed to spawn live output thread")?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                anyhow::bail!("live output thread exited during setup");
            }
        }

        Ok(Box::new(CpalSink {
            producer,
            format: *format,
            failed,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        }))
    }
}

fn build_stream(
    format: &LiveFormat,
    mut consumer: Consumer<i16>,
    failed: Arc<AtomicBool>,
    log: AudioLog,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No default output device found")?;

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = consumer.pop().unwrap_or(0);
                }
            },
            move |err| {
                log.error(format_args!("live: output stream error: {}", err));
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .with_context(|| format!("Failed to build output stream {:?}", config))?;
    stream.play().context("Failed to start output stream")?;
    Ok(stream)
}

struct CpalSink {
    producer: Producer<i16>,
    format: LiveFormat,
    failed: Arc<AtomicBool>,
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSink for CpalSink {
    fn play(&mut self, bytes: &[u8]) -> Result<()> {
        let samples = track::from_bytes(bytes, self.format.bits, self.format.byte_order);
        let mut pending = samples.as_slice();
        let mut last_progress = Instant::now();

        while let Some((&sample, rest)) = pending.split_first() {
            if self.failed.load(Ordering::SeqCst) {
                anyhow::bail!("output stream failed");
            }
            match self.producer.push(sample) {
                Ok(()) => {
                    pending = rest;
                    last_progress = Instant::now();
                }
                Err(_) => {
                    if self.producer.is_abandoned() {
                        anyhow::bail!("output stream closed");
                    }
                    if last_progress.elapsed() > STALL_TIMEOUT {
                        anyhow::bail!("output stream stopped consuming samples");
                    }
                    thread::sleep(FULL_POLL);
                }
            }
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
