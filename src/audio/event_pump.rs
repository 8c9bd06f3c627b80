//! Background pump for the event server connection.
//!
//! A dedicated thread runs a current-thread tokio runtime that owns the
//! socket for its whole life. One task `select!`s over the shutdown signal,
//! requests from the playback side and events from the server, so the
//! connection is only ever touched from that thread and is dropped there
//! after the loop exits.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc as async_mpsc, watch};

use super::cancel::lock;
use super::flow_protocol::{self, Event, Request, ServerError};
use crate::error::{OpenError, PlayError};
use crate::logging::AudioLog;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Abandoned requests remembered in case their answer still arrives.
const ABANDONED_LIMIT: usize = 32;

type FlowReply = Result<u32, ServerError>;

enum PumpRequest {
    Start {
        serial: u32,
        request: Request,
        reply: SyncSender<FlowReply>,
    },
    Stop {
        serial: u32,
        flow: u32,
    },
    /// The caller stopped waiting for `serial`; a flow it still starts is
    /// stopped straight away.
    Abandon {
        serial: u32,
    },
}

/// Request serials, shared by the playback side and the pump. Never 0,
/// which the server uses for unsolicited events.
#[derive(Debug, Default)]
struct Serials(AtomicU32);

impl Serials {
    fn next(&self) -> u32 {
        loop {
            let serial = self.0.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }
}

pub struct EventPump {
    requests: async_mpsc::UnboundedSender<PumpRequest>,
    serials: Arc<Serials>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventPump {
    /// Connect to `addr` on a new pump thread. Returns once the connection
    /// is up, or with the reason it could not be made.
    pub fn start(addr: SocketAddr, log: AudioLog) -> Result<Self, OpenError> {
        let (requests_tx, requests_rx) = async_mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let serials = Arc::new(Serials::default());
        let pump_serials = serials.clone();

        let worker = thread::Builder::new()
            .name("flow-events".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to build runtime: {}", e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            let _ = ready_tx.send(Err(format!("{}: {}", addr, e)));
                            return;
                        }
                        Err(_) => {
                            let _ = ready_tx.send(Err(format!("{}: connect timed out", addr)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    pump(stream, requests_rx, shutdown_rx, pump_serials, log).await;
                });
            })
            .map_err(|e| OpenError::Spawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                requests: requests_tx,
                serials,
                shutdown: shutdown_tx,
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(reason)) => {
                let _ = worker.join();
                Err(OpenError::ConnectionRefused(reason))
            }
            Err(_) => {
                let _ = worker.join();
                Err(OpenError::Spawn("event pump exited during setup".into()))
            }
        }
    }

    /// Ask the server to start a flow and wait up to `timeout` for its id.
    ///
    /// On timeout the request is abandoned: the pump forgets it and stops
    /// the flow if the server starts it later. An answer that slips in
    /// before the pump sees the abandon is still returned.
    pub fn start_flow(&self, request: Request, timeout: Duration) -> Result<u32, PlayError> {
        let serial = self.serials.next();
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.requests
            .send(PumpRequest::Start {
                serial,
                request,
                reply: reply_tx,
            })
            .map_err(|_| PlayError::StartFlow("connection to the event server is closed".into()))?;

        let reply = match reply_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                let _ = self.requests.send(PumpRequest::Abandon { serial });
                // The pump drops the reply sender when it handles the abandon.
                match reply_rx.recv_timeout(timeout) {
                    Ok(reply) => Ok(reply),
                    Err(_) => Err(PlayError::StartFlow("no reply from the event server".into())),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(PlayError::StartFlow(
                "connection to the event server was lost".into(),
            )),
            Ok(reply) => Ok(reply),
        }?;

        reply.map_err(|err| {
            PlayError::StartFlow(format!(
                "server error {} for request {}",
                err.error_code, err.request_code
            ))
        })
    }

    /// Queue a stop request. Never waits for the server.
    pub fn stop_flow(&self, flow: u32) -> bool {
        let serial = self.serials.next();
        self.requests.send(PumpRequest::Stop { serial, flow }).is_ok()
    }

    /// Signal the pump to exit and join it. The connection is closed by the
    /// time this returns. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Requests waiting for an answer from the server.
#[derive(Default)]
struct Pending {
    waiting: HashMap<u32, SyncSender<FlowReply>>,
    abandoned: VecDeque<u32>,
}

impl Pending {
    fn abandon(&mut self, serial: u32) {
        if self.waiting.remove(&serial).is_none() {
            return;
        }
        if self.abandoned.len() == ABANDONED_LIMIT {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(serial);
    }

    /// True when `serial` had been abandoned; forgets it either way.
    fn take_abandoned(&mut self, serial: u32) -> bool {
        match self.abandoned.iter().position(|&s| s == serial) {
            Some(index) => {
                self.abandoned.remove(index);
                true
            }
            None => false,
        }
    }
}

async fn pump(
    stream: TcpStream,
    mut requests: async_mpsc::UnboundedReceiver<PumpRequest>,
    mut shutdown: watch::Receiver<bool>,
    serials: Arc<Serials>,
    log: AudioLog,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut write_buf = BytesMut::new();
    let mut pending = Pending::default();

    log.debug(format_args!("flow: event pump running"));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            request = requests.recv() => {
                let Some(request) = request else { break };
                match request {
                    PumpRequest::Start { serial, request, reply } => {
                        flow_protocol::encode_request(serial, &request, &mut write_buf);
                        pending.waiting.insert(serial, reply);
                    }
                    PumpRequest::Stop { serial, flow } => {
                        flow_protocol::encode_request(serial, &Request::StopFlow { flow }, &mut write_buf);
                    }
                    PumpRequest::Abandon { serial } => {
                        log.debug(format_args!("flow: request {} abandoned", serial));
                        pending.abandon(serial);
                        continue;
                    }
                }
                if let Err(e) = writer.write_all(&write_buf).await {
                    log.error(format_args!("flow: write to the event server failed: {}", e));
                    break;
                }
                write_buf.clear();
            }
            read = reader.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        log.error(format_args!("flow: event server closed the connection"));
                        break;
                    }
                    Ok(_) => {
                        let orphans = match dispatch(&mut read_buf, &mut pending, &log) {
                            Ok(orphans) => orphans,
                            Err(e) => {
                                log.error(format_args!("flow: bad data from the event server: {:#}", e));
                                break;
                            }
                        };
                        if orphans.is_empty() {
                            continue;
                        }
                        for flow in orphans {
                            log.info(format_args!("flow: stopping flow {} nobody waits for", flow));
                            let stop = Request::StopFlow { flow };
                            flow_protocol::encode_request(serials.next(), &stop, &mut write_buf);
                        }
                        if let Err(e) = writer.write_all(&write_buf).await {
                            log.error(format_args!("flow: write to the event server failed: {}", e));
                            break;
                        }
                        write_buf.clear();
                    }
                    Err(e) => {
                        log.error(format_args!("flow: read from the event server failed: {}", e));
                        break;
                    }
                }
            }
        }
    }

    // Dropping the senders wakes any play() still waiting for a flow id.
    pending.waiting.clear();
    log.debug(format_args!("flow: event pump stopped"));
}

/// Hand decoded events to their waiting requests. Returns the flows that
/// were started for requests nobody waits for any more.
fn dispatch(buf: &mut BytesMut, pending: &mut Pending, log: &AudioLog) -> anyhow::Result<Vec<u32>> {
    let mut orphans = Vec::new();
    while let Some((serial, event)) = flow_protocol::decode_event(buf)? {
        match event {
            Event::FlowStarted { flow } => {
                log.debug(format_args!("flow: flow {} started (request {})", flow, serial));
                match pending.waiting.remove(&serial) {
                    Some(reply) => {
                        if reply.send(Ok(flow)).is_err() {
                            orphans.push(flow);
                        }
                    }
                    None if pending.take_abandoned(serial) => orphans.push(flow),
                    None => {}
                }
            }
            Event::FlowDone { flow } => {
                log.debug(format_args!("flow: flow {} done", flow));
            }
            Event::Error(err) => {
                report_server_error(serial, &err, log);
                if let Some(reply) = pending.waiting.remove(&serial) {
                    let _ = reply.send(Err(err));
                }
                pending.take_abandoned(serial);
            }
        }
    }
    Ok(orphans)
}

/// Errors arrive on the pump thread, so they can only be logged.
fn report_server_error(serial: u32, err: &ServerError, log: &AudioLog) {
    log.warning(format_args!("flow: non-fatal server error"));
    log.warning(format_args!("flow: serial number of failed request: {}", serial));
    log.warning(format_args!("flow: error code: {}", err.error_code));
    log.info(format_args!("flow: resource id: {}", err.resource_id));
    log.info(format_args!("flow: request code: {}", err.request_code));
    log.debug(format_args!("flow: minor code: {}", err.minor_code));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(pending: &mut Pending, serial: u32) -> mpsc::Receiver<FlowReply> {
        let (tx, rx) = mpsc::sync_channel(1);
        pending.waiting.insert(serial, tx);
        rx
    }

    #[test]
    fn serials_skip_zero() {
        let serials = Serials(AtomicU32::new(u32::MAX - 1));
        assert_eq!(serials.next(), u32::MAX);
        assert_eq!(serials.next(), 1);
    }

    #[test]
    fn late_start_for_an_abandoned_request_is_an_orphan() {
        let mut pending = Pending::default();
        let _rx = waiting(&mut pending, 7);
        let answered = waiting(&mut pending, 8);
        pending.abandon(7);
        assert_eq!(pending.waiting.len(), 1);

        let mut buf = BytesMut::new();
        flow_protocol::encode_event(7, &Event::FlowStarted { flow: 40 }, &mut buf);
        flow_protocol::encode_event(8, &Event::FlowStarted { flow: 41 }, &mut buf);
        flow_protocol::encode_event(9, &Event::FlowStarted { flow: 42 }, &mut buf);

        let orphans = dispatch(&mut buf, &mut pending, &AudioLog::discard()).unwrap();
        assert_eq!(orphans, vec![40]);
        assert_eq!(answered.try_recv(), Ok(Ok(41)));
        assert!(pending.waiting.is_empty());
        assert!(pending.abandoned.is_empty());
    }

    #[test]
    fn abandoned_list_is_bounded() {
        let mut pending = Pending::default();
        let receivers: Vec<_> = (1..=100).map(|serial| waiting(&mut pending, serial)).collect();
        for serial in 1..=100 {
            pending.abandon(serial);
        }
        // unknown serials are not remembered
        pending.abandon(500);

        assert!(pending.waiting.is_empty());
        assert_eq!(pending.abandoned.len(), ABANDONED_LIMIT);
        assert_eq!(pending.abandoned.front(), Some(&(100 - ABANDONED_LIMIT as u32 + 1)));
        drop(receivers);
    }

    #[test]
    fn dropped_waiter_turns_its_flow_into_an_orphan() {
        let mut pending = Pending::default();
        drop(waiting(&mut pending, 3));

        let mut buf = BytesMut::new();
        flow_protocol::encode_event(3, &Event::FlowStarted { flow: 9 }, &mut buf);
        let orphans = dispatch(&mut buf, &mut pending, &AudioLog::discard()).unwrap();
        assert_eq!(orphans, vec![9]);
    }
}
