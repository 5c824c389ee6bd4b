// src/bus.rs
//
// Frame transport over Linux SocketCAN.
//
// The bridge owns one raw CAN socket for its lifetime. Receive filters are
// installed so the kernel only queues discovery traffic and the control-range
// identifier pairs; everything else on the bus never reaches us. The send
// buffer is set to zero so writes block when the bus is saturated instead of
// silently dropping frames.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions, StandardId,
};

use crate::error::IoError;
use crate::protocol::{CAN_DATA_SIZE, CTL_BASE, CTL_MASK, DISCOVERY_FILTER, DISCOVERY_MASK};

/// Receive poll timeout and socket read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Small kernel receive queue; the dispatch loop drains promptly.
const RECV_BUF_SIZE: libc::c_int = 512;

/// Send seam for everything that talks to the bus. The dispatch loop and the
/// liveness scheduler are written against this trait so their state machines
/// can be driven by a recording mock in tests.
pub trait FrameTx {
    /// Write one frame. `data` must fit a classic CAN payload.
    fn send_frame(&self, id: u32, data: &[u8]) -> Result<(), IoError>;
}

/// The raw CAN socket plus the interface it is bound to.
pub struct CanBus {
    socket: CanSocket,
    interface: String,
}

impl CanBus {
    /// Open and configure the transport on a named interface.
    ///
    /// Fails with `IoError::Transport` on any setup step: missing interface,
    /// permission problems, bind conflicts.
    pub fn open(interface: &str) -> Result<Self, IoError> {
        let socket =
            CanSocket::open(interface).map_err(|e| IoError::transport(interface, e))?;

        // Zero the send buffer: a saturated bus must block the sender, not
        // drop frames (see the socketcan-qdisc write-up).
        set_sock_buf(socket.as_raw_fd(), libc::SO_SNDBUF, 0)
            .map_err(|e| IoError::transport(interface, format!("SO_SNDBUF: {}", e)))?;
        set_sock_buf(socket.as_raw_fd(), libc::SO_RCVBUF, RECV_BUF_SIZE)
            .map_err(|e| IoError::transport(interface, format!("SO_RCVBUF: {}", e)))?;

        // Only discovery responses and the control-range pairs reach us
        let filters = [
            CanFilter::new(DISCOVERY_FILTER, DISCOVERY_MASK),
            CanFilter::new(CTL_BASE, CTL_MASK),
        ];
        socket
            .set_filters(&filters)
            .map_err(|e| IoError::transport(interface, format!("set filters: {}", e)))?;

        socket
            .set_read_timeout(READ_TIMEOUT)
            .map_err(|e| IoError::transport(interface, format!("read timeout: {}", e)))?;

        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    /// Read one frame. Only called after poll readiness; timeouts and
    /// non-data frames map to `None`.
    pub fn recv(&self) -> Result<Option<(u32, Vec<u8>)>, IoError> {
        match self.socket.read_frame() {
            Ok(CanFrame::Data(f)) => Ok(Some((f.raw_id(), f.data().to_vec()))),
            // Remote/error frames are not part of this protocol
            Ok(_) => Ok(None),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(IoError::io(format!("{}: read: {}", self.interface, e))),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl FrameTx for CanBus {
    fn send_frame(&self, id: u32, data: &[u8]) -> Result<(), IoError> {
        if data.len() > CAN_DATA_SIZE {
            return Err(IoError::invalid(format!(
                "payload length {} exceeds CAN frame limit",
                data.len()
            )));
        }

        let sid = u16::try_from(id)
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(|| IoError::invalid(format!("identifier 0x{:X} not standard", id)))?;
        let frame = CanFrame::new(sid, data)
            .ok_or_else(|| IoError::invalid("frame construction failed"))?;

        self.socket
            .write_frame(&frame)
            .map_err(|e| IoError::io(format!("{}: write 0x{:03X}: {}", self.interface, id, e)))
    }
}

/// setsockopt for the SOL_SOCKET buffer sizes the socketcan crate does not cover.
fn set_sock_buf(fd: RawFd, opt: libc::c_int, val: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
