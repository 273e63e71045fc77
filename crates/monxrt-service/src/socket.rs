//! The control socket.
//!
//! A connection-oriented seqpacket socket on a filesystem path, so every
//! request and reply is one framed datagram and message boundaries survive
//! the kernel. OS handles (the shared-memory fd, swapchain image fds)
//! travel as `SCM_RIGHTS` ancillary data alongside the datagram that
//! announces them.
//!
//! When the supervisor passes a pre-bound socket via the `LISTEN_FDS`
//! convention, that socket is used and the path argument is ignored.

use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use monxrt_common::{Error, Result};
use monxrt_proto::wire::Datagram;
use monxrt_proto::{MAX_CLIENTS, MAX_DATAGRAM_SIZE, MAX_SWAPCHAIN_IMAGES};
use rustix::net::{
    accept, bind_unix, listen, recvmsg, sendmsg, socket_with, AddressFamily, RecvAncillaryBuffer,
    RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
    SocketAddrUnix, SocketFlags, SocketType,
};
use tracing::{debug, info, warn};

/// Default socket path when the host environment provides none.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/monxrt_comp_ipc";

/// First fd passed by the `LISTEN_FDS` convention.
const LISTEN_FDS_START: i32 = 3;

/// The listening side.
pub struct ControlListener {
    fd: OwnedFd,
    /// Unlinked on drop when we bound it ourselves.
    owned_path: Option<PathBuf>,
}

impl ControlListener {
    /// Take a pre-bound listening socket from the supervisor, if one was
    /// passed.
    pub fn from_activation() -> Option<Self> {
        let pid_matches = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map(|pid| pid == std::process::id())
            .unwrap_or(false);
        let fd_count: i32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
        if !pid_matches || fd_count < 1 {
            return None;
        }

        info!("using socket-activation fd");
        // The supervisor owns the lifecycle; fd 3 is ours by convention.
        let fd = unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START) };
        Some(Self {
            fd,
            owned_path: None,
        })
    }

    /// Bind and listen on `path`, replacing any stale socket file.
    pub fn bind(path: &Path) -> Result<Self> {
        let fd = socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )
        .map_err(std::io::Error::from)?;

        // A previous unclean shutdown may have left the file behind.
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let addr = SocketAddrUnix::new(path)
            .map_err(|_| Error::validation(format!("socket path too long: {}", path.display())))?;
        bind_unix(&fd, &addr).map_err(std::io::Error::from)?;
        listen(&fd, MAX_CLIENTS as i32).map_err(std::io::Error::from)?;

        info!(path = %path.display(), "listening");
        Ok(Self {
            fd,
            owned_path: Some(path.to_path_buf()),
        })
    }

    /// Accept one client connection. Blocks.
    pub fn accept(&self) -> Result<ClientConn> {
        let fd = accept(&self.fd).map_err(std::io::Error::from)?;
        debug!("client connected");
        Ok(ClientConn { fd })
    }

    /// The raw listening fd, for epoll registration.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        if let Some(path) = &self.owned_path {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %err, "failed to unlink socket");
            }
        }
    }
}

/// One connected client.
pub struct ClientConn {
    fd: OwnedFd,
}

impl ClientConn {
    /// Connect to a service socket. The client side of the same protocol;
    /// also what the test suite drives.
    pub fn connect(path: &Path) -> Result<Self> {
        let fd = socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )
        .map_err(std::io::Error::from)?;
        let addr = SocketAddrUnix::new(path)
            .map_err(|_| Error::validation(format!("socket path too long: {}", path.display())))?;
        rustix::net::connect_unix(&fd, &addr).map_err(std::io::Error::from)?;
        Ok(Self { fd })
    }

    /// Send one datagram, with optional out-of-band handles.
    pub fn send(&self, datagram: &Datagram, handles: &[BorrowedFd<'_>]) -> Result<()> {
        debug_assert!(handles.len() <= MAX_SWAPCHAIN_IMAGES);
        debug_assert_eq!(!handles.is_empty(), datagram.has_handles());

        let encoded = datagram.encode();
        let iov = [std::io::IoSlice::new(&encoded)];

        let mut space = [0u8; rustix::cmsg_space!(ScmRights(MAX_SWAPCHAIN_IMAGES))];
        let mut control = SendAncillaryBuffer::new(&mut space);
        if !handles.is_empty() {
            let pushed = control.push(SendAncillaryMessage::ScmRights(handles));
            if !pushed {
                return Err(Error::runtime("ancillary buffer too small for handles"));
            }
        }

        let sent = sendmsg(&self.fd, &iov, &mut control, SendFlags::empty())
            .map_err(|e| Error::ipc(format!("send: {e}")))?;
        if sent != encoded.len() {
            return Err(Error::ipc(format!(
                "short send: {sent} of {} bytes",
                encoded.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram and any handles riding with it. Blocks; a
    /// cleanly closed peer surfaces as `IpcFailure`.
    pub fn recv(&self) -> Result<(Datagram, Vec<OwnedFd>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];

        let mut space = [0u8; rustix::cmsg_space!(ScmRights(MAX_SWAPCHAIN_IMAGES))];
        let mut control = RecvAncillaryBuffer::new(&mut space);

        let ret = recvmsg(
            &self.fd,
            &mut iov,
            &mut control,
            RecvFlags::CMSG_CLOEXEC,
        )
        .map_err(|e| Error::ipc(format!("recv: {e}")))?;

        if ret.bytes == 0 {
            return Err(Error::ipc("peer closed the connection"));
        }

        let mut handles = Vec::new();
        for message in control.drain() {
            if let RecvAncillaryMessage::ScmRights(fds) = message {
                handles.extend(fds);
            }
        }

        let datagram = Datagram::decode(Bytes::copy_from_slice(&buf[..ret.bytes]))
            .map_err(|e| Error::ipc(format!("malformed datagram: {e}")))?;
        Ok((datagram, handles))
    }

    /// Shut the connection down so a blocked `recv` on another thread
    /// returns.
    pub fn shutdown(&self) {
        let _ = rustix::net::shutdown(&self.fd, rustix::net::Shutdown::ReadWrite);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monxrt_proto::wire::Opcode;
    use monxrt_proto::Status;
    use std::os::fd::AsFd;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("monxrt-test-{}-{}", std::process::id(), name))
    }

    /// A connected seqpacket pair: one end through the listener, one via
    /// the client constructor.
    fn pair(name: &str) -> (ClientConn, ClientConn) {
        let path = temp_path(name);
        let listener = ControlListener::bind(&path).unwrap();
        let client = ClientConn::connect(&path).unwrap();
        let server_side = listener.accept().unwrap();
        (server_side, client)
    }

    #[test]
    fn datagram_roundtrip_over_socket() {
        let (server, client) = pair("roundtrip");
        let request = Datagram::request(1, Opcode::PollEvent, Bytes::new());
        client.send(&request, &[]).unwrap();

        let (received, handles) = server.recv().unwrap();
        assert_eq!(received, request);
        assert!(handles.is_empty());

        let reply = Datagram::reply(1, Opcode::PollEvent, Status::Ok, Bytes::new());
        server.send(&reply, &[]).unwrap();
        let (received, _) = client.recv().unwrap();
        assert_eq!(received.reply_parts().unwrap().0, Status::Ok);
    }

    #[test]
    fn handles_survive_the_trip() {
        let (server, client) = pair("handles");

        let memfd = rustix::fs::memfd_create("monxrt-test", rustix::fs::MemfdFlags::CLOEXEC)
            .unwrap();
        rustix::fs::ftruncate(&memfd, 128).unwrap();

        let datagram =
            Datagram::reply(2, Opcode::SwapchainCreate, Status::Ok, Bytes::new()).with_handles();
        server.send(&datagram, &[memfd.as_fd()]).unwrap();

        let (received, handles) = client.recv().unwrap();
        assert!(received.has_handles());
        assert_eq!(handles.len(), 1);

        // The received fd refers to the same 128-byte object.
        let stat = rustix::fs::fstat(&handles[0]).unwrap();
        assert_eq!(stat.st_size, 128);
    }

    #[test]
    fn closed_peer_is_ipc_failure() {
        let (server, client) = pair("closed");
        drop(client);
        assert!(matches!(server.recv(), Err(Error::IpcFailure(_))));
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let path = temp_path("stale");
        std::fs::write(&path, b"stale").unwrap();
        let listener = ControlListener::bind(&path).unwrap();
        drop(listener);
        assert!(!path.exists(), "socket file should be unlinked on drop");
    }
}
