//! Control-socket datagram framing.
//!
//! Every datagram starts with a fixed 16-byte header:
//!
//! ```text
//! u32  length     payload bytes including this header
//! u32  sequence
//! u32  opcode
//! u32  flags      bit 0: handles accompany this datagram out-of-band
//! ```
//!
//! A reply reuses the request's opcode with [`REPLY_BIT`] set and carries a
//! `u32` status as the first payload word. Events use opcodes in the
//! [`EVENT_OPCODE_PREFIX`] range and start their payload with a `u64`
//! timestamp.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{MAX_DATAGRAM_SIZE, MAX_DIAGNOSTIC_BYTES};

/// Size of the fixed datagram header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Set on the opcode of every reply.
pub const REPLY_BIT: u32 = 0x8000_0000;

/// High byte of every event opcode.
pub const EVENT_OPCODE_PREFIX: u32 = 0xFF00_0000;

/// Flag bit 0: OS handles accompany this datagram as ancillary data.
pub const FLAG_HAS_HANDLES: u32 = 1 << 0;

/// Decoding and framing errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("datagram too short: {0}")]
    TooShort(usize),
    #[error("datagram length field {field} disagrees with received {received}")]
    LengthMismatch { field: u32, received: usize },
    #[error("datagram larger than maximum: {0}")]
    TooLarge(usize),
    #[error("unknown opcode: {0:#x}")]
    UnknownOpcode(u32),
    #[error("unknown status: {0}")]
    UnknownStatus(u32),
    #[error("truncated payload for {0}")]
    Truncated(&'static str),
    #[error("invalid enum value {value} for {name}")]
    InvalidEnum { name: &'static str, value: u32 },
    #[error("string field not valid UTF-8")]
    BadString,
}

/// Request status, the first payload word of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// Client misuse; the request had no effect.
    InvalidArg = 1,
    /// Operation out of order (e.g. `begin_frame` without `wait_frame`).
    CallOrder = 2,
    /// A client or swapchain cap was hit.
    ResourceExhausted = 3,
    /// A bounded wait expired.
    TimeoutExpired = 4,
    /// Transport failure; the session is going away.
    IpcFailure = 5,
    /// Internal invariant violation; the session is going away.
    Runtime = 6,
    /// The device backing the session was lost.
    DeviceLost = 7,
    /// `begin_frame` superseded an already-begun frame.
    FrameDiscarded = 8,
}

impl Status {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::InvalidArg,
            2 => Self::CallOrder,
            3 => Self::ResourceExhausted,
            4 => Self::TimeoutExpired,
            5 => Self::IpcFailure,
            6 => Self::Runtime,
            7 => Self::DeviceLost,
            8 => Self::FrameDiscarded,
            other => return Err(ProtoError::UnknownStatus(other)),
        })
    }
}

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    InstanceCreate = 1,
    SystemGetProperties = 2,
    SessionCreate = 3,
    SwapchainCreate = 4,
    SwapchainAcquire = 5,
    SwapchainWait = 6,
    SwapchainRelease = 7,
    SwapchainDestroy = 8,
    BeginSession = 9,
    EndSession = 10,
    RequestExit = 11,
    WaitFrame = 12,
    BeginFrame = 13,
    EndFrame = 14,
    PollEvent = 15,
    DeviceUpdateInput = 16,
    DeviceGetPose = 17,
    DeviceSetOutput = 18,
    SystemGetClients = 19,
    SystemGetClientInfo = 20,
    SystemSetPrimaryClient = 21,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            1 => Self::InstanceCreate,
            2 => Self::SystemGetProperties,
            3 => Self::SessionCreate,
            4 => Self::SwapchainCreate,
            5 => Self::SwapchainAcquire,
            6 => Self::SwapchainWait,
            7 => Self::SwapchainRelease,
            8 => Self::SwapchainDestroy,
            9 => Self::BeginSession,
            10 => Self::EndSession,
            11 => Self::RequestExit,
            12 => Self::WaitFrame,
            13 => Self::BeginFrame,
            14 => Self::EndFrame,
            15 => Self::PollEvent,
            16 => Self::DeviceUpdateInput,
            17 => Self::DeviceGetPose,
            18 => Self::DeviceSetOutput,
            19 => Self::SystemGetClients,
            20 => Self::SystemGetClientInfo,
            21 => Self::SystemSetPrimaryClient,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }
}

/// What kind of datagram a raw opcode word denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    Request(Opcode),
    Reply(Opcode),
    Event(u32),
}

/// A framed control-socket datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u32,
    /// Raw opcode word, including the reply bit or event prefix.
    pub opcode: u32,
    pub flags: u32,
    pub payload: Bytes,
}

impl Datagram {
    /// Frame a request.
    pub fn request(sequence: u32, opcode: Opcode, payload: Bytes) -> Self {
        Self {
            sequence,
            opcode: opcode as u32,
            flags: 0,
            payload,
        }
    }

    /// Frame a reply to `opcode`, prefixing the payload with `status`.
    pub fn reply(sequence: u32, opcode: Opcode, status: Status, payload: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32_le(status as u32);
        buf.put_slice(&payload);
        Self {
            sequence,
            opcode: opcode as u32 | REPLY_BIT,
            flags: 0,
            payload: buf.freeze(),
        }
    }

    /// Frame a failing reply carrying a bounded diagnostic message.
    pub fn error_reply(sequence: u32, opcode: Opcode, status: Status, diagnostic: &str) -> Self {
        let mut msg = diagnostic.as_bytes();
        if msg.len() > MAX_DIAGNOSTIC_BYTES {
            // Truncate on a char boundary.
            let mut end = MAX_DIAGNOSTIC_BYTES;
            while !diagnostic.is_char_boundary(end) {
                end -= 1;
            }
            msg = &diagnostic.as_bytes()[..end];
        }
        let mut buf = BytesMut::with_capacity(4 + 4 + msg.len());
        buf.put_u32_le(status as u32);
        buf.put_u32_le(msg.len() as u32);
        buf.put_slice(msg);
        Self {
            sequence,
            opcode: opcode as u32 | REPLY_BIT,
            flags: 0,
            payload: buf.freeze(),
        }
    }

    /// Mark that OS handles accompany this datagram.
    pub fn with_handles(mut self) -> Self {
        self.flags |= FLAG_HAS_HANDLES;
        self
    }

    pub fn has_handles(&self) -> bool {
        self.flags & FLAG_HAS_HANDLES != 0
    }

    /// Classify the raw opcode word.
    pub fn kind(&self) -> Result<DatagramKind, ProtoError> {
        if self.opcode & EVENT_OPCODE_PREFIX == EVENT_OPCODE_PREFIX {
            Ok(DatagramKind::Event(self.opcode & !EVENT_OPCODE_PREFIX))
        } else if self.opcode & REPLY_BIT != 0 {
            Ok(DatagramKind::Reply(Opcode::from_u32(
                self.opcode & !REPLY_BIT,
            )?))
        } else {
            Ok(DatagramKind::Request(Opcode::from_u32(self.opcode)?))
        }
    }

    pub fn encode(&self) -> Bytes {
        let len = HEADER_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32_le(len as u32);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.opcode);
        buf.put_u32_le(self.flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, ProtoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtoError::TooShort(bytes.len()));
        }
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtoError::TooLarge(bytes.len()));
        }

        let length = bytes.get_u32_le();
        // The length field counts the full datagram; 4 bytes were consumed.
        let received = bytes.len() + 4;
        if length as usize != received {
            return Err(ProtoError::LengthMismatch {
                field: length,
                received,
            });
        }

        let sequence = bytes.get_u32_le();
        let opcode = bytes.get_u32_le();
        let flags = bytes.get_u32_le();

        Ok(Self {
            sequence,
            opcode,
            flags,
            payload: bytes,
        })
    }

    /// Split a reply payload into its status word and the remainder.
    pub fn reply_parts(&self) -> Result<(Status, Bytes), ProtoError> {
        if self.payload.len() < 4 {
            return Err(ProtoError::Truncated("reply status"));
        }
        let mut payload = self.payload.clone();
        let status = Status::from_u32(payload.get_u32_le())?;
        Ok((status, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let dgram = Datagram::request(7, Opcode::WaitFrame, Bytes::from(vec![1, 2, 3, 4]));
        let encoded = dgram.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 4);
        let decoded = Datagram::decode(encoded).unwrap();
        assert_eq!(decoded, dgram);
        assert_eq!(
            decoded.kind().unwrap(),
            DatagramKind::Request(Opcode::WaitFrame)
        );
    }

    #[test]
    fn reply_carries_status_first() {
        let dgram = Datagram::reply(9, Opcode::BeginFrame, Status::FrameDiscarded, Bytes::new());
        let decoded = Datagram::decode(dgram.encode()).unwrap();
        assert_eq!(
            decoded.kind().unwrap(),
            DatagramKind::Reply(Opcode::BeginFrame)
        );
        let (status, rest) = decoded.reply_parts().unwrap();
        assert_eq!(status, Status::FrameDiscarded);
        assert!(rest.is_empty());
    }

    #[test]
    fn error_reply_diagnostic_is_bounded() {
        let long = "x".repeat(4 * MAX_DIAGNOSTIC_BYTES);
        let dgram = Datagram::error_reply(1, Opcode::EndFrame, Status::InvalidArg, &long);
        let (status, mut rest) = dgram.reply_parts().unwrap();
        assert_eq!(status, Status::InvalidArg);
        let len = rest.get_u32_le() as usize;
        assert_eq!(len, MAX_DIAGNOSTIC_BYTES);
        assert_eq!(rest.len(), len);
    }

    #[test]
    fn too_short_rejected() {
        let err = Datagram::decode(Bytes::from(vec![0u8; 3])).unwrap_err();
        assert!(matches!(err, ProtoError::TooShort(3)));
    }

    #[test]
    fn length_mismatch_rejected() {
        let dgram = Datagram::request(0, Opcode::PollEvent, Bytes::new());
        let mut encoded = BytesMut::from(&dgram.encode()[..]);
        encoded.extend_from_slice(&[0xAA]); // trailing garbage
        let err = Datagram::decode(encoded.freeze()).unwrap_err();
        assert!(matches!(err, ProtoError::LengthMismatch { .. }));
    }

    #[test]
    fn event_kind_detected() {
        let dgram = Datagram {
            sequence: 0,
            opcode: EVENT_OPCODE_PREFIX | 3,
            flags: 0,
            payload: Bytes::new(),
        };
        assert_eq!(dgram.kind().unwrap(), DatagramKind::Event(3));
    }

    #[test]
    fn handles_flag() {
        let dgram = Datagram::request(0, Opcode::SwapchainCreate, Bytes::new()).with_handles();
        assert!(dgram.has_handles());
        let decoded = Datagram::decode(dgram.encode()).unwrap();
        assert!(decoded.has_handles());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let dgram = Datagram {
            sequence: 0,
            opcode: 999,
            flags: 0,
            payload: Bytes::new(),
        };
        assert!(matches!(
            dgram.kind(),
            Err(ProtoError::UnknownOpcode(999))
        ));
    }
}
