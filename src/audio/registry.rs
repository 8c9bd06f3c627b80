//! Backend lookup by name.
//!
//! Each backend contributes one [`BackendEntry`] through its own
//! `*_plugin()` function; [`BACKENDS`] lists the ones compiled in.

use super::device::Device;
use super::output::{AudioOutput, OpenParams};
use super::{alsa_pacer, alsa_poll, event_server, live, simple};
use crate::error::OpenError;
use crate::logging::AudioLog;

pub type OpenFn = fn(&OpenParams, AudioLog) -> Result<Box<dyn AudioOutput>, OpenError>;

#[derive(Clone, Copy)]
pub struct BackendEntry {
    pub name: &'static str,
    pub open: OpenFn,
    pub play_command: Option<&'static str>,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("play_command", &self.play_command)
            .finish()
    }
}

pub const fn alsa_plugin() -> BackendEntry {
    BackendEntry {
        name: alsa_pacer::NAME,
        open: alsa_pacer::open,
        play_command: Some(alsa_pacer::PLAY_COMMAND),
    }
}

pub const fn alsa_poll_plugin() -> BackendEntry {
    BackendEntry {
        name: alsa_poll::NAME,
        open: alsa_poll::open,
        play_command: Some(alsa_pacer::PLAY_COMMAND),
    }
}

pub const fn cpal_plugin() -> BackendEntry {
    BackendEntry {
        name: live::NAME,
        open: live::open,
        play_command: None,
    }
}

pub const fn pulse_plugin() -> BackendEntry {
    BackendEntry {
        name: simple::NAME,
        open: simple::open,
        play_command: Some(simple::PLAY_COMMAND),
    }
}

pub const fn flow_plugin() -> BackendEntry {
    BackendEntry {
        name: event_server::NAME,
        open: event_server::open,
        play_command: None,
    }
}

pub static BACKENDS: [BackendEntry; 5] = [
    pulse_plugin(),
    alsa_plugin(),
    alsa_poll_plugin(),
    cpal_plugin(),
    flow_plugin(),
];

pub fn find(name: &str) -> Option<&'static BackendEntry> {
    find_in(&BACKENDS, name)
}

pub fn find_in<'a>(table: &'a [BackendEntry], name: &str) -> Option<&'a BackendEntry> {
    let name = name.trim();
    table.iter().find(|entry| entry.name.eq_ignore_ascii_case(name))
}

/// Open the first backend in `methods` that works.
pub fn open_first<'m>(
    methods: impl IntoIterator<Item = &'m str>,
    params: &OpenParams,
    log: AudioLog,
) -> Result<Device, OpenError> {
    open_first_in(&BACKENDS, methods, params, log)
}

/// [`open_first`] over an explicit table. Unknown names are skipped with a
/// warning; the last open failure is returned when nothing opens.
pub fn open_first_in<'m>(
    table: &[BackendEntry],
    methods: impl IntoIterator<Item = &'m str>,
    params: &OpenParams,
    log: AudioLog,
) -> Result<Device, OpenError> {
    let mut tried = Vec::new();
    let mut last_error = None;

    for method in methods {
        tried.push(method.to_string());
        let Some(entry) = find_in(table, method) else {
            log.warning(format_args!("audio: unknown output method '{}'", method));
            last_error = Some(OpenError::UnknownBackend(method.to_string()));
            continue;
        };
        let device_log = log.scoped();
        match (entry.open)(params, device_log.clone()) {
            Ok(backend) => {
                log.info(format_args!("audio: using the {} output method", entry.name));
                return Ok(Device::from_backend(backend, device_log));
            }
            Err(e) => {
                log.warning(format_args!("audio: output method {} failed: {}", entry.name, e));
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) if tried.len() == 1 => e,
        _ => OpenError::NoBackendAvailable {
            tried: tried.join(","),
        },
    })
}
