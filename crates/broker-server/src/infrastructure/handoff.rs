//! Control channel between the broker and a ComputeProcess worker that
//! owns its client socket directly.
//!
//! # How a socket changes hands (for beginners)
//!
//! The broker and the worker share one Unix datagram socket pair.  The
//! worker's end is installed as file descriptor [`CONTROL_FD`] in the child
//! and announced through [`CONTROL_FD_ENV`].  Every datagram is one JSON
//! [`ControlMessage`]:
//!
//! | direction       | message        | attached descriptor       |
//! |-----------------|----------------|---------------------------|
//! | broker → worker | `socket`       | the client's TCP socket   |
//! | worker → broker | `socketClosed` | none                      |
//!
//! A `socket` message arrives after the broker has sent the handshake `ok`
//! reply and stopped touching the connection.  `buffered` holds bytes the
//! broker had already read past the hello; the worker decodes them before
//! reading from the descriptor.  When `compression` is set, the worker
//! replays `inflateHistory` through a fresh raw inflater so that its context
//! matches the client's.  Its own outbound deflater may start fresh.
//!
//! When a client socket ends, the worker reports `socketClosed` with the
//! `socketId` it was given (and `clean` set if the client sent a Close
//! frame) so the broker can move the logical connection Offline.  A
//! reconnecting client produces another `socket` message on the same
//! channel.
//!
//! Descriptors travel as `SCM_RIGHTS` ancillary data, which is why this
//! module talks to `libc` directly.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use uuid::Uuid;

use crate::infrastructure::framed_socket::SocketHandoff;

/// Descriptor number of the control channel inside the worker.
pub const CONTROL_FD: RawFd = 3;
/// Environment variable announcing [`CONTROL_FD`] to the worker.
pub const CONTROL_FD_ENV: &str = "SESSION_BROKER_CONTROL_FD";

/// Largest datagram either side sends or accepts.
pub const MAX_CONTROL_MESSAGE: usize = 64 * 1024;

/// One datagram on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// A client socket follows as ancillary data.
    #[serde(rename_all = "camelCase")]
    Socket {
        /// Names this socket in the matching `socketClosed`.
        socket_id: Uuid,
        compression: bool,
        /// Base64 of the bytes read but not yet decoded.
        buffered: String,
        /// Base64 of each compressed client message inflated so far.
        inflate_history: Vec<String>,
    },
    /// A socket received earlier has ended.
    #[serde(rename_all = "camelCase")]
    SocketClosed { socket_id: Uuid, clean: bool },
}

impl ControlMessage {
    /// The `socket` announcement for `handoff`.
    pub fn socket(socket_id: Uuid, handoff: &SocketHandoff) -> Self {
        ControlMessage::Socket {
            socket_id,
            compression: handoff.compression,
            buffered: STANDARD.encode(&handoff.buffered),
            inflate_history: handoff
                .inflate_history
                .iter()
                .map(|message| STANDARD.encode(message))
                .collect(),
        }
    }
}

/// Decoded `buffered` and `inflateHistory` fields of a `socket` message.
///
/// # Errors
///
/// Returns an error if either field is not valid base64.
pub fn decode_socket_payload(
    buffered: &str,
    inflate_history: &[String],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), base64::DecodeError> {
    let buffered = STANDARD.decode(buffered)?;
    let history = inflate_history
        .iter()
        .map(|message| STANDARD.decode(message))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((buffered, history))
}

/// One end of the control channel.
#[derive(Debug)]
pub struct ControlChannel {
    socket: UnixDatagram,
}

impl ControlChannel {
    /// Creates a connected pair: the broker's end, and the descriptor to
    /// install in the worker.  Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket pair cannot be created.
    pub fn pair() -> io::Result<(Self, OwnedFd)> {
        let (local, remote) = std::os::unix::net::UnixDatagram::pair()?;
        Ok((Self::from_std(local)?, OwnedFd::from(remote)))
    }

    /// Wraps an inherited end, e.g. [`CONTROL_FD`] inside a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be registered with the
    /// runtime.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Self::from_std(std::os::unix::net::UnixDatagram::from(fd))
    }

    fn from_std(socket: std::os::unix::net::UnixDatagram) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UnixDatagram::from_std(socket)?,
        })
    }

    /// Sends `message`, with `descriptor` attached when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not fit in one datagram or the
    /// peer is gone.
    pub async fn send(&self, message: &ControlMessage, descriptor: Option<&OwnedFd>) -> io::Result<()> {
        let payload = serde_json::to_vec(message).map_err(io::Error::other)?;
        if payload.len() > MAX_CONTROL_MESSAGE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("control message of {} bytes is too large", payload.len()),
            ));
        }
        let raw = descriptor.map(AsRawFd::as_raw_fd);
        self.socket
            .async_io(Interest::WRITABLE, || {
                send_with_descriptor(self.socket.as_raw_fd(), &payload, raw)
            })
            .await?;
        Ok(())
    }

    /// Receives the next message and its descriptor, if one was attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel fails, the peer is gone, or the
    /// datagram is not a [`ControlMessage`].
    pub async fn recv(&self) -> io::Result<(ControlMessage, Option<OwnedFd>)> {
        let mut buf = vec![0u8; MAX_CONTROL_MESSAGE];
        let (n, descriptor) = self
            .socket
            .async_io(Interest::READABLE, || {
                recv_with_descriptor(self.socket.as_raw_fd(), &mut buf)
            })
            .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control channel closed",
            ));
        }
        let message = serde_json::from_slice(&buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((message, descriptor))
    }
}

/// Installs `fd` as [`CONTROL_FD`] in a freshly forked child.  Runs
/// between fork and exec, so it only makes async-signal-safe calls.
pub(crate) fn install_control_fd(fd: RawFd) -> io::Result<()> {
    if fd == CONTROL_FD {
        // dup2 onto itself would leave close-on-exec set.
        // SAFETY: fcntl on a descriptor we own; no memory is touched.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    // SAFETY: dup2 between two descriptor numbers; the new one does not
    // inherit close-on-exec.
    if unsafe { libc::dup2(fd, CONTROL_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── SCM_RIGHTS ────────────────────────────────────────────────────────────────

const FD_SIZE: u32 = mem::size_of::<RawFd>() as u32;

fn send_with_descriptor(socket: RawFd, payload: &[u8], descriptor: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = descriptor {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        // SAFETY: `control` is CMSG_SPACE(FD_SIZE) bytes, so the first
        // header and its data fit inside it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("no room for SCM_RIGHTS header"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            ptr::copy_nonoverlapping(
                (&fd as *const RawFd).cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                FD_SIZE as usize,
            );
        }
    }

    // SAFETY: `msg` points at `iov` and `control`, both alive for the call.
    let sent = unsafe { libc::sendmsg(socket, &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

fn recv_with_descriptor(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: `msg` points at `iov` and `control`, both alive for the call.
    let received = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut descriptor = None;
    // SAFETY: the kernel filled `control` and set msg_controllen; the
    // CMSG_* walk stays within it.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let mut fd: RawFd = -1;
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut fd as *mut RawFd).cast::<u8>(),
                    FD_SIZE as usize,
                );
                if fd >= 0 {
                    descriptor = Some(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::other("descriptor dropped: control data truncated"));
    }
    Ok((received as usize, descriptor))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
