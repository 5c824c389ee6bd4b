// src/vport.rs
//
// Virtual port allocation: one PTY pair per discovered node, exposed through
// a symlink named from the node's hardware id so the same device always
// shows up at the same path.

use std::ffi::CStr;
use std::fs::Permissions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::IoError;
use crate::logging::tlog;
use crate::protocol::{ctl_id, display_hw_id, HardwareId, PINGS_BEFORE_DISCONNECT};
use crate::table::{PortRecord, PortTable, Retired};
use crate::watch::{Inotify, WATCH_OPEN_CLOSE};

/// Deterministic symlink path for a hardware id:
/// `<dir>/<base>_<12 lowercase hex digits>`.
pub fn port_link_path(link_dir: &Path, link_base: &str, hw_id: &HardwareId) -> PathBuf {
    link_dir.join(format!("{}_{}", link_base, hex::encode(hw_id)))
}

/// Allocate (or re-identify) the virtual port for a discovered node.
///
/// A port number that is already in the table means the device reset and
/// announced itself again: the existing record is reused untouched. Otherwise
/// a PTY pair is created, linked, watched, and appended to the table.
///
/// Any resource failure returns `IoError::Resource` with nothing appended;
/// partially created resources are wound back first.
pub fn allocate(
    table: &mut PortTable,
    port: u16,
    hw_id: &HardwareId,
    inotify: &Inotify,
    link_dir: &Path,
    link_base: &str,
) -> Result<usize, IoError> {
    if let Some(index) = table.index_of_port(port) {
        tlog!("[vport] device reset, port {} reused", port);
        return Ok(index);
    }

    let (master, peer) = open_pty()?;
    set_nonblocking(master.as_raw_fd())
        .map_err(|e| IoError::resource(format!("master O_NONBLOCK: {}", e)))?;
    set_cloexec(master.as_raw_fd());
    set_cloexec(peer.as_raw_fd());

    let peer_path = tty_path(peer.as_raw_fd())
        .map_err(|e| IoError::resource(format!("ttyname: {}", e)))?;

    let link_path = port_link_path(link_dir, link_base, hw_id);
    // A stale link from a previous run must not block the new one
    let _ = std::fs::remove_file(&link_path);
    std::os::unix::fs::symlink(&peer_path, &link_path).map_err(|e| {
        IoError::resource(format!("symlink {}: {}", link_path.display(), e))
    })?;
    if let Err(e) = std::fs::set_permissions(&peer_path, Permissions::from_mode(0o666)) {
        let _ = std::fs::remove_file(&link_path);
        return Err(IoError::resource(format!(
            "chmod {}: {}",
            peer_path.display(),
            e
        )));
    }

    let watch = match inotify.add_watch(&link_path, WATCH_OPEN_CLOSE) {
        Ok(wd) => wd,
        Err(e) => {
            let _ = std::fs::remove_file(&link_path);
            return Err(e);
        }
    };

    let record = PortRecord {
        port,
        ctl_id: ctl_id(port),
        hw_id: *hw_id,
        countdown: PINGS_BEFORE_DISCONNECT,
        active: false,
        watch,
        master,
        peer,
        link_path: link_path.clone(),
    };
    let index = table.push(record);

    tlog!(
        "[vport] {} -> {} (hw {}, CANID 0x{:03X})",
        link_path.display(),
        peer_path.display(),
        display_hw_id(hw_id),
        ctl_id(port)
    );
    Ok(index)
}

/// Free an evicted port's resources: drop the watch, delete the symlink,
/// close both PTY ends. Deletion failures are logged, never fatal.
pub fn release(retired: Retired, inotify: &Inotify) {
    inotify.rm_watch(retired.watch);
    if let Err(e) = std::fs::remove_file(&retired.link_path) {
        tlog!("[vport] unlink {}: {}", retired.link_path.display(), e);
    }
    // master and peer close when `retired` drops
}

// ============================================================================
// PTY plumbing
// ============================================================================

/// Open a PTY pair with a zeroed termios: raw line discipline, no echo;
/// echoed input would come straight back to the master and loop onto the bus.
fn open_pty() -> Result<(OwnedFd, OwnedFd), IoError> {
    let mut master: libc::c_int = -1;
    let mut peer: libc::c_int = -1;
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut peer,
            std::ptr::null_mut(),
            &mut termios,
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(IoError::resource(format!(
            "openpty: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(peer)) })
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// Resolve the device path of a tty descriptor.
fn tty_path(fd: RawFd) -> std::io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc));
    }
    let cstr = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(
        std::str::from_utf8(cstr.to_bytes())
            .map_err(|_| std::io::Error::other("non-utf8 tty name"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CAN_DATA_SIZE;
    use std::fs::File;

    const HW: HardwareId = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    #[test]
    fn test_port_link_path_naming() {
        let path = port_link_path(Path::new("/tmp"), "ttyCAN0", &HW);
        assert_eq!(path, PathBuf::from("/tmp/ttyCAN0_010203040506"));
    }

    #[test]
    fn test_allocate_creates_link_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let transport = File::open("/dev/null").unwrap();
        let mut table = PortTable::new(transport.as_raw_fd());

        let index = allocate(&mut table, 3, &HW, &inotify, dir.path(), "ttyCAN0").unwrap();
        assert_eq!(index, 0);
        assert_eq!(table.port_count(), 1);
        assert_eq!(table.handles().len(), 2);

        let record = table.record(index);
        assert_eq!(record.port, 3);
        assert_eq!(record.ctl_id, 0x186);
        assert_eq!(record.countdown, PINGS_BEFORE_DISCONNECT);
        assert!(!record.active);

        let link = dir.path().join("ttyCAN0_010203040506");
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.to_string_lossy().contains("/dev/pts/"));

        // Data written to the peer is readable on the (non-blocking) master
        let n = unsafe {
            libc::write(
                record.peer.as_raw_fd(),
                b"ping\x7E".as_ptr() as *const libc::c_void,
                5,
            )
        };
        assert_eq!(n, 5);
        let mut buf = [0u8; CAN_DATA_SIZE];
        let n = unsafe {
            libc::read(
                record.master.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"ping\x7E");
    }

    #[test]
    fn test_reallocate_same_port_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let transport = File::open("/dev/null").unwrap();
        let mut table = PortTable::new(transport.as_raw_fd());

        let first = allocate(&mut table, 3, &HW, &inotify, dir.path(), "ttyCAN0").unwrap();
        let second = allocate(&mut table, 3, &HW, &inotify, dir.path(), "ttyCAN0").unwrap();
        assert_eq!(first, second);
        assert_eq!(table.port_count(), 1);
        assert_eq!(table.handles().len(), 2);
    }

    #[test]
    fn test_release_removes_link() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let transport = File::open("/dev/null").unwrap();
        let mut table = PortTable::new(transport.as_raw_fd());

        allocate(&mut table, 1, &HW, &inotify, dir.path(), "ttyCAN0").unwrap();
        let link = dir.path().join("ttyCAN0_010203040506");
        assert!(link.symlink_metadata().is_ok());

        table.evict(0);
        for retired in table.take_graveyard() {
            release(retired, &inotify);
        }
        assert!(link.symlink_metadata().is_err());
        assert_eq!(table.port_count(), 0);
    }
}
