//! WebSocket handshake and frame codec.
//!
//! Outbound frames are never masked. Frames the server emits on its own are
//! always final; a decoded [`Frame`] keeps its `fin` bit when re-encoded.
//! Inbound frames are decoded only once header, mask key and
//! payload are all buffered.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::connection::MAX_POST_SIZE;
use crate::error::Error;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header: 2 bytes, 8 bytes of length, 4 bytes of mask.
pub const MAX_HEADER_LEN: usize = 14;

/// Inbound payloads share the POST body ceiling.
pub const MAX_FRAME_PAYLOAD: usize = MAX_POST_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0f {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xa => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xa,
            Opcode::Reserved(other) => other & 0x0f,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Already unmasked.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        put_header(self.fin, self.opcode, self.payload.len(), out);
        out.extend_from_slice(&self.payload);
    }
}

/// Cloneable handle for pushing frames into an upgraded connection from
/// outside its callbacks, e.g. from a timer or a worker task.
///
/// Frames are queued until the connection is upgraded and then written in
/// order. A [`Opcode::Close`] frame closes the socket once it is flushed.
#[derive(Debug, Clone)]
pub struct WebSocketSender {
    tx: mpsc::UnboundedSender<Frame>,
}

pub type PushReceiver = mpsc::UnboundedReceiver<Frame>;

pub(crate) fn push_channel() -> (WebSocketSender, PushReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WebSocketSender { tx }, rx)
}

impl WebSocketSender {
    pub fn send(&self, opcode: Opcode, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send_frame(Frame::new(opcode, payload))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.send(Opcode::Text, text.into())
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        self.tx.send(frame).map_err(|_| Error::Closed)
    }

    /// True once the connection behind this handle is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

pub fn encode_header(opcode: Opcode, len: usize, out: &mut BytesMut) {
    put_header(true, opcode, len, out);
}

fn put_header(fin: bool, opcode: Opcode, len: usize, out: &mut BytesMut) {
    out.reserve(10);
    let fin_bit = if fin { 0x80 } else { 0x00 };
    out.put_u8(fin_bit | opcode.as_u8());
    if len <= 125 {
        out.put_u8(len as u8);
    } else if len < 65536 {
        out.put_u8(126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(127);
        out.put_u64(len as u64);
    }
}

pub fn encode_frame(opcode: Opcode, payload: &[u8], out: &mut BytesMut) {
    encode_header(opcode, payload.len(), out);
    out.extend_from_slice(payload);
}

/// Pull one complete frame off the front of `input`.
///
/// Returns `Ok(None)` without consuming anything while the frame is still
/// incomplete.
pub fn decode_frame(input: &mut BytesMut) -> Result<Option<Frame>, Error> {
    let peek = &input[..input.len().min(MAX_HEADER_LEN)];
    if peek.len() < 2 {
        return Ok(None);
    }

    let (len, mut header_len) = match peek[1] & 0x7f {
        126 => {
            if peek.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([peek[2], peek[3]])), 4)
        }
        127 => {
            if peek.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&peek[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    if len >> 63 != 0 {
        return Err(Error::InvalidFrame("payload length has its top bit set"));
    }
    if len > MAX_FRAME_PAYLOAD as u64 {
        return Err(Error::InvalidFrame("payload too large"));
    }
    let len = len as usize;

    let mask = if peek[1] & 0x80 != 0 {
        if peek.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&peek[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    if input.len() < header_len + len {
        return Ok(None);
    }

    let fin = input[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(input[0]);
    input.advance(header_len);
    let mut payload = input.split_to(len).to_vec();
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}
