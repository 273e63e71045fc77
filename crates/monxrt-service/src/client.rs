//! Per-client worker.
//!
//! One worker per connected socket. It blocks reading requests, dispatches
//! each one, and on any transport or fatal error tears its session down:
//! the session gets `LOSS_PENDING` and `EXITING`, swapchains go to the GC
//! stack, and the slot frees up for the next connection. The render loop
//! keeps serving every other client throughout.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch;
use crate::server::Server;
use crate::socket::ClientConn;

/// Run one client's request loop to completion. Consumes the connection;
/// returns once the client is gone and the slot has been released.
pub fn client_worker(server: Arc<Server>, index: usize, conn: ClientConn) {
    info!(index, "client worker started");

    while server.running() {
        let (dgram, _handles) = match conn.recv() {
            Ok(received) => received,
            Err(err) => {
                debug!(index, %err, "client connection closed");
                break;
            }
        };

        if let Err(err) = dispatch::handle_request(&server, index, &conn, dgram) {
            warn!(index, %err, "fatal request failure, ending session");
            break;
        }
    }

    conn.shutdown();
    server.teardown_client(index);
    info!(index, "client worker finished");
}

/// Accept-side hook: claim a slot and spawn the worker thread. On a full
/// house the connection is dropped immediately.
pub fn start_client(server: &Arc<Server>, conn: ClientConn) {
    let index = match server.claim_slot("(connecting)", 0) {
        Ok(index) => index,
        Err(err) => {
            warn!(%err, "rejecting client");
            conn.shutdown();
            return;
        }
    };

    let worker_server = Arc::clone(server);
    let spawned = std::thread::Builder::new()
        .name(format!("monxrt-client-{index}"))
        .spawn(move || client_worker(worker_server, index, conn));
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn client worker");
        server.teardown_client(index);
    }
}
