//! Core MONXRT protocol types, framing, and constants.
//!
//! This crate provides:
//! - Datagram framing for the control socket (length, sequence, opcode, flags)
//! - Request/reply/event payload codecs
//! - The shared-memory region layout (header, device table, input snapshots,
//!   per-client render slots)
//! - Status codes shared between service and clients
//!
//! All wire data is little-endian. Out-of-band OS handles travel as socket
//! ancillary data and are never part of the byte payload; the `has_handles`
//! flag only announces that they accompany the datagram.

#![forbid(unsafe_code)]

pub mod events;
pub mod messages;
pub mod shm;
pub mod types;
pub mod wire;

pub use events::{Event, SessionState};
pub use types::*;
pub use wire::{Datagram, Opcode, ProtoError, Status};

/// Protocol version spoken on the control socket and stamped into shared
/// memory.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum concurrently connected clients.
pub const MAX_CLIENTS: usize = 64;

/// Maximum layers a single client may submit per frame.
pub const MAX_LAYERS: usize = 16;

/// Maximum devices exposed through the shared-memory device table.
pub const MAX_DEVICES: usize = 32;

/// Maximum input snapshots across all devices.
pub const MAX_INPUTS: usize = 1024;

/// Maximum output descriptors across all devices.
pub const MAX_OUTPUTS: usize = 128;

/// Maximum images in one swapchain.
pub const MAX_SWAPCHAIN_IMAGES: usize = 8;

/// Maximum swapchains a single client may hold.
pub const MAX_CLIENT_SWAPCHAINS: usize = 8;

/// Slots in the per-client outbound event ring.
pub const EVENT_QUEUE_SIZE: usize = 32;

/// Largest datagram the control socket will accept.
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024;

/// Longest diagnostic message attached to a failing reply, in bytes.
pub const MAX_DIAGNOSTIC_BYTES: usize = 256;
