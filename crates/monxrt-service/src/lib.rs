//! The MONXRT runtime service.
//!
//! A long-lived process that arbitrates one HMD and its peripherals across
//! multiple client applications:
//!
//! - [`server`]: process-wide state: the client table, active-primary
//!   selection, and session/visibility fan-out
//! - [`client`]: one worker per connected client, reading requests off the
//!   control socket
//! - [`dispatch`]: request decoding and the handler for every operation
//! - [`session`]: the per-client session state machine and frame
//!   bookkeeping
//! - [`events`]: bounded per-client ring of outbound events
//! - [`device`]: the device capability and the built-in stub device set
//! - [`shm`]: the shared-memory region: device table, input snapshots,
//!   per-client render slots
//! - [`socket`]: seqpacket control socket with handle passing
//! - [`render_loop`]: the dedicated render task

pub mod client;
pub mod device;
pub mod dispatch;
pub mod events;
pub mod render_loop;
pub mod server;
pub mod session;
pub mod shm;
pub mod socket;
