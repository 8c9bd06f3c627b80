//! Wire format spoken with the event server.
//!
//! Every message is a 9-byte header (opcode `u8`, serial `u32`, payload
//! length `u32`, big endian) followed by the payload. Requests carry the
//! serial chosen by the client; replies and errors echo it, unsolicited
//! events use serial 0.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 9;
/// Upper bound on a single payload, about three minutes of 16-bit stereo.
pub const MAX_PAYLOAD: usize = 32 * 1024 * 1024;
/// Fixed fields of a PlayFromData payload, ahead of the sample data.
pub const PLAY_FROM_DATA_FIELDS: usize = 14;
/// Largest sample data one flow can carry.
pub const MAX_FLOW_DATA: usize = MAX_PAYLOAD - PLAY_FROM_DATA_FIELDS;

const OP_PLAY_FROM_DATA: u8 = 0x01;
const OP_STOP_FLOW: u8 = 0x02;
const EV_FLOW_STARTED: u8 = 0x81;
const EV_FLOW_DONE: u8 = 0x82;
const EV_ERROR: u8 = 0x8f;

/// Sample layout of a flow's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowFormat {
    LinearSigned8 = 1,
    LinearSigned16Lsb = 2,
}

impl FlowFormat {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FlowFormat::LinearSigned8),
            2 => Ok(FlowFormat::LinearSigned16Lsb),
            other => bail!("unknown flow format {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Play a whole sound in one flow; the server answers `FlowStarted`
    /// or `Error` with the same serial.
    PlayFromData {
        format: FlowFormat,
        channels: u8,
        rate: u32,
        volume: u32,
        frames: u32,
        data: Bytes,
    },
    StopFlow { flow: u32 },
}

/// Non-fatal error reported by the server for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerError {
    pub error_code: u8,
    pub request_code: u8,
    pub minor_code: u8,
    pub resource_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    FlowStarted { flow: u32 },
    FlowDone { flow: u32 },
    Error(ServerError),
}

pub fn encode_request(serial: u32, request: &Request, dst: &mut BytesMut) {
    match request {
        Request::PlayFromData {
            format,
            channels,
            rate,
            volume,
            frames,
            data,
        } => {
            put_header(dst, OP_PLAY_FROM_DATA, serial, PLAY_FROM_DATA_FIELDS + data.len());
            dst.put_u8(*format as u8);
            dst.put_u8(*channels);
            dst.put_u32(*rate);
            dst.put_u32(*volume);
            dst.put_u32(*frames);
            dst.put_slice(data);
        }
        Request::StopFlow { flow } => {
            put_header(dst, OP_STOP_FLOW, serial, 4);
            dst.put_u32(*flow);
        }
    }
}

pub fn encode_event(serial: u32, event: &Event, dst: &mut BytesMut) {
    match event {
        Event::FlowStarted { flow } => {
            put_header(dst, EV_FLOW_STARTED, serial, 4);
            dst.put_u32(*flow);
        }
        Event::FlowDone { flow } => {
            put_header(dst, EV_FLOW_DONE, serial, 4);
            dst.put_u32(*flow);
        }
        Event::Error(err) => {
            put_header(dst, EV_ERROR, serial, 7);
            dst.put_u8(err.error_code);
            dst.put_u8(err.request_code);
            dst.put_u8(err.minor_code);
            dst.put_u32(err.resource_id);
        }
    }
}

/// Take one complete request off the front of `src`; `Ok(None)` while
/// more bytes are needed.
pub fn decode_request(src: &mut BytesMut) -> Result<Option<(u32, Request)>> {
    let Some((opcode, serial, mut payload)) = split_frame(src)? else {
        return Ok(None);
    };
    let request = match opcode {
        OP_PLAY_FROM_DATA => {
            need(&payload, PLAY_FROM_DATA_FIELDS, "PlayFromData")?;
            let format = FlowFormat::from_u8(payload.get_u8())?;
            let channels = payload.get_u8();
            let rate = payload.get_u32();
            let volume = payload.get_u32();
            let frames = payload.get_u32();
            Request::PlayFromData {
                format,
                channels,
                rate,
                volume,
                frames,
                data: payload.freeze(),
            }
        }
        OP_STOP_FLOW => {
            need(&payload, 4, "StopFlow")?;
            Request::StopFlow {
                flow: payload.get_u32(),
            }
        }
        other => bail!("unknown request opcode {:#04x}", other),
    };
    Ok(Some((serial, request)))
}

/// Take one complete event off the front of `src`; `Ok(None)` while more
/// bytes are needed.
pub fn decode_event(src: &mut BytesMut) -> Result<Option<(u32, Event)>> {
    let Some((opcode, serial, mut payload)) = split_frame(src)? else {
        return Ok(None);
    };
    let event = match opcode {
        EV_FLOW_STARTED => {
            need(&payload, 4, "FlowStarted")?;
            Event::FlowStarted {
                flow: payload.get_u32(),
            }
        }
        EV_FLOW_DONE => {
            need(&payload, 4, "FlowDone")?;
            Event::FlowDone {
                flow: payload.get_u32(),
            }
        }
        EV_ERROR => {
            need(&payload, 7, "Error")?;
            Event::Error(ServerError {
                error_code: payload.get_u8(),
                request_code: payload.get_u8(),
                minor_code: payload.get_u8(),
                resource_id: payload.get_u32(),
            })
        }
        other => bail!("unknown event opcode {:#04x}", other),
    };
    Ok(Some((serial, event)))
}

fn put_header(dst: &mut BytesMut, opcode: u8, serial: u32, len: usize) {
    dst.reserve(HEADER_LEN + len);
    dst.put_u8(opcode);
    dst.put_u32(serial);
    dst.put_u32(len as u32);
}

fn split_frame(src: &mut BytesMut) -> Result<Option<(u8, u32, BytesMut)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = &src[..HEADER_LEN];
    let opcode = header.get_u8();
    let serial = header.get_u32();
    let len = header.get_u32() as usize;
    if len > MAX_PAYLOAD {
        bail!("frame payload of {} bytes exceeds the limit", len);
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    Ok(Some((opcode, serial, src.split_to(len))))
}

fn need(payload: &BytesMut, len: usize, what: &str) -> Result<()> {
    if payload.len() < len {
        bail!("{} payload too short: {} bytes", what, payload.len());
    }
    Ok(())
}
