//! Outbound event payloads.
//!
//! Events travel over the same connection as replies, in per-client order,
//! with opcode `0xFF000000 | kind` and a leading `u64` timestamp.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::need;
use crate::wire::{Datagram, DatagramKind, ProtoError, EVENT_OPCODE_PREFIX};

/// Visible OpenXR-style session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum SessionState {
    Idle = 0,
    Ready = 1,
    Synchronized = 2,
    Visible = 3,
    Focused = 4,
    Stopping = 5,
    LossPending = 6,
    Exiting = 7,
}

impl SessionState {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Synchronized,
            3 => Self::Visible,
            4 => Self::Focused,
            5 => Self::Stopping,
            6 => Self::LossPending,
            7 => Self::Exiting,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "session state",
                    value,
                })
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Ready => "READY",
            Self::Synchronized => "SYNCHRONIZED",
            Self::Visible => "VISIBLE",
            Self::Focused => "FOCUSED",
            Self::Stopping => "STOPPING",
            Self::LossPending => "LOSS_PENDING",
            Self::Exiting => "EXITING",
        }
    }
}

/// Event kind discriminants on the wire.
pub const EVENT_SESSION_STATE_CHANGED: u32 = 1;
pub const EVENT_OVERLAY_VISIBILITY_CHANGED: u32 = 2;
pub const EVENT_LOSS_PENDING: u32 = 3;
pub const EVENT_EXITING: u32 = 4;
pub const EVENT_HAPTIC_STOP: u32 = 5;

/// A delivered event, timestamp plus payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The session moved to a new state.
    SessionStateChanged { state: SessionState },
    /// An overlay's visibility flipped because the primary changed.
    OverlayVisibilityChanged { visible: bool },
    /// The session is about to be lost; `loss_time_ns` is when.
    LossPending { loss_time_ns: u64 },
    /// The session must exit.
    Exiting,
    /// A haptic output was stopped.
    HapticStop { device_id: u32, output_name: u32 },
}

impl Event {
    fn kind(&self) -> u32 {
        match self {
            Self::SessionStateChanged { .. } => EVENT_SESSION_STATE_CHANGED,
            Self::OverlayVisibilityChanged { .. } => EVENT_OVERLAY_VISIBILITY_CHANGED,
            Self::LossPending { .. } => EVENT_LOSS_PENDING,
            Self::Exiting => EVENT_EXITING,
            Self::HapticStop { .. } => EVENT_HAPTIC_STOP,
        }
    }

    /// Frame this event as a control-socket datagram.
    pub fn into_datagram(self, sequence: u32, timestamp_ns: u64) -> Datagram {
        let mut buf = BytesMut::new();
        buf.put_u64_le(timestamp_ns);
        match self {
            Self::SessionStateChanged { state } => buf.put_u32_le(state as u32),
            Self::OverlayVisibilityChanged { visible } => buf.put_u32_le(visible as u32),
            Self::LossPending { loss_time_ns } => buf.put_u64_le(loss_time_ns),
            Self::Exiting => {}
            Self::HapticStop {
                device_id,
                output_name,
            } => {
                buf.put_u32_le(device_id);
                buf.put_u32_le(output_name);
            }
        }
        Datagram {
            sequence,
            opcode: EVENT_OPCODE_PREFIX | self.kind(),
            flags: 0,
            payload: buf.freeze(),
        }
    }

    /// Encode as `kind, timestamp, payload`, the shape embedded in
    /// `poll_event` replies.
    pub fn encode_body(&self, timestamp_ns: u64, buf: &mut impl BufMut) {
        buf.put_u32_le(self.kind());
        buf.put_u64_le(timestamp_ns);
        match self {
            Self::SessionStateChanged { state } => buf.put_u32_le(*state as u32),
            Self::OverlayVisibilityChanged { visible } => buf.put_u32_le(*visible as u32),
            Self::LossPending { loss_time_ns } => buf.put_u64_le(*loss_time_ns),
            Self::Exiting => {}
            Self::HapticStop {
                device_id,
                output_name,
            } => {
                buf.put_u32_le(*device_id);
                buf.put_u32_le(*output_name);
            }
        }
    }

    /// Inverse of [`Event::encode_body`].
    pub fn decode_body(buf: &mut impl Buf) -> Result<(u64, Self), ProtoError> {
        need(buf, 4 + 8, "event body")?;
        let kind = buf.get_u32_le();
        let timestamp_ns = buf.get_u64_le();
        let event = match kind {
            EVENT_SESSION_STATE_CHANGED => {
                need(buf, 4, "session state event")?;
                Event::SessionStateChanged {
                    state: SessionState::from_u32(buf.get_u32_le())?,
                }
            }
            EVENT_OVERLAY_VISIBILITY_CHANGED => {
                need(buf, 4, "overlay visibility event")?;
                Event::OverlayVisibilityChanged {
                    visible: buf.get_u32_le() != 0,
                }
            }
            EVENT_LOSS_PENDING => {
                need(buf, 8, "loss pending event")?;
                Event::LossPending {
                    loss_time_ns: buf.get_u64_le(),
                }
            }
            EVENT_EXITING => Event::Exiting,
            EVENT_HAPTIC_STOP => {
                need(buf, 8, "haptic stop event")?;
                Event::HapticStop {
                    device_id: buf.get_u32_le(),
                    output_name: buf.get_u32_le(),
                }
            }
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "event kind",
                    value,
                })
            }
        };
        Ok((timestamp_ns, event))
    }

    /// Parse an event datagram back into `(timestamp_ns, event)`.
    pub fn from_datagram(dgram: &Datagram) -> Result<(u64, Self), ProtoError> {
        let kind = match dgram.kind()? {
            DatagramKind::Event(kind) => kind,
            _ => return Err(ProtoError::UnknownOpcode(dgram.opcode)),
        };
        let mut payload: Bytes = dgram.payload.clone();
        need(&payload, 8, "event timestamp")?;
        let timestamp_ns = payload.get_u64_le();
        let event = match kind {
            EVENT_SESSION_STATE_CHANGED => {
                need(&payload, 4, "session state event")?;
                Event::SessionStateChanged {
                    state: SessionState::from_u32(payload.get_u32_le())?,
                }
            }
            EVENT_OVERLAY_VISIBILITY_CHANGED => {
                need(&payload, 4, "overlay visibility event")?;
                Event::OverlayVisibilityChanged {
                    visible: payload.get_u32_le() != 0,
                }
            }
            EVENT_LOSS_PENDING => {
                need(&payload, 8, "loss pending event")?;
                Event::LossPending {
                    loss_time_ns: payload.get_u64_le(),
                }
            }
            EVENT_EXITING => Event::Exiting,
            EVENT_HAPTIC_STOP => {
                need(&payload, 8, "haptic stop event")?;
                Event::HapticStop {
                    device_id: payload.get_u32_le(),
                    output_name: payload.get_u32_le(),
                }
            }
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "event kind",
                    value,
                })
            }
        };
        Ok((timestamp_ns, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_roundtrip() {
        let event = Event::SessionStateChanged {
            state: SessionState::Focused,
        };
        let dgram = event.into_datagram(3, 999);
        let (ts, parsed) = Event::from_datagram(&dgram).unwrap();
        assert_eq!(ts, 999);
        assert_eq!(parsed, event);
    }

    #[test]
    fn all_kinds_roundtrip() {
        let events = [
            Event::SessionStateChanged {
                state: SessionState::LossPending,
            },
            Event::OverlayVisibilityChanged { visible: true },
            Event::LossPending { loss_time_ns: 42 },
            Event::Exiting,
            Event::HapticStop {
                device_id: 1,
                output_name: 2,
            },
        ];
        for event in events {
            let dgram = event.into_datagram(0, 1);
            let decoded = Datagram::decode(dgram.encode()).unwrap();
            let (_, parsed) = Event::from_datagram(&decoded).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn body_roundtrip() {
        let event = Event::HapticStop {
            device_id: 2,
            output_name: 1,
        };
        let mut buf = BytesMut::new();
        event.encode_body(77, &mut buf);
        let (ts, parsed) = Event::decode_body(&mut buf.freeze()).unwrap();
        assert_eq!(ts, 77);
        assert_eq!(parsed, event);
    }

    #[test]
    fn session_states_are_ordered() {
        // The synchronize-before-visible-before-focused progression relies
        // on the derive order.
        assert!(SessionState::Synchronized < SessionState::Visible);
        assert!(SessionState::Visible < SessionState::Focused);
    }

    #[test]
    fn unknown_event_kind_rejected() {
        let dgram = Datagram {
            sequence: 0,
            opcode: EVENT_OPCODE_PREFIX | 77,
            flags: 0,
            payload: {
                let mut buf = BytesMut::new();
                buf.put_u64_le(0);
                buf.freeze()
            },
        };
        assert!(Event::from_datagram(&dgram).is_err());
    }
}
