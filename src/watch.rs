// src/watch.rs
//
// Inotify plumbing for virtual-port open/close tracking.
//
// Each port's symlink gets a watch for IN_OPEN / IN_CLOSE so the bridge can
// tell when something on the host side opens or drops the tty. The kernel
// hands back a packed byte stream of variable-length records; `Events`
// decodes it into typed events, validating record framing before advancing.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::IoError;

/// IN_CLOSE is the pair of close events, write and no-write.
const IN_CLOSE: u32 = (libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE) as u32;

/// Watch mask used for every port symlink.
pub const WATCH_OPEN_CLOSE: u32 = libc::IN_OPEN as u32 | IN_CLOSE;

/// Fixed part of a kernel inotify record: wd + mask + cookie + len.
const EVENT_HEADER_SIZE: usize = 16;

/// Buffer large enough for a burst of events; a drain call never needs more.
pub const EVENT_BUF_SIZE: usize = 4096;

// ============================================================================
// Inotify handle
// ============================================================================

/// Non-blocking inotify instance owned by the bridge.
#[derive(Debug)]
pub struct Inotify {
    fd: OwnedFd,
}

impl Inotify {
    /// Create a non-blocking, close-on-exec inotify instance.
    pub fn new() -> Result<Self, IoError> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(IoError::resource(format!(
                "inotify_init1: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Add a watch on `path`, returning the watch descriptor.
    pub fn add_watch(&self, path: &Path, mask: u32) -> Result<i32, IoError> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| IoError::resource("watch path contains NUL"))?;
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), cpath.as_ptr(), mask) };
        if wd < 0 {
            return Err(IoError::resource(format!(
                "inotify_add_watch {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(wd)
    }

    /// Remove a watch. Best-effort: the watch may already be gone if the
    /// link was deleted externally.
    pub fn rm_watch(&self, wd: i32) {
        unsafe {
            libc::inotify_rm_watch(self.fd.as_raw_fd(), wd);
        }
    }

    /// Non-blocking read of pending events into `buf`.
    /// Returns the number of bytes filled; 0 when nothing is pending.
    pub fn drain(&self, buf: &mut [u8]) -> usize {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n > 0 {
            n as usize
        } else {
            0
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// ============================================================================
// Typed event decoding
// ============================================================================

/// One decoded watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub wd: i32,
    pub mask: u32,
}

impl WatchEvent {
    pub fn is_open(&self) -> bool {
        self.mask & libc::IN_OPEN as u32 != 0
    }

    pub fn is_close(&self) -> bool {
        self.mask & IN_CLOSE != 0
    }
}

/// Lazy decoder over a drained event buffer.
///
/// Stops at the first record whose header or name extends past the buffer,
/// so a truncated read can never cause an over-read.
pub struct Events<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Events<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl Iterator for Events<'_> {
    type Item = WatchEvent;

    fn next(&mut self) -> Option<WatchEvent> {
        if self.pos + EVENT_HEADER_SIZE > self.buf.len() {
            return None;
        }
        let rec = &self.buf[self.pos..];
        let wd = i32::from_ne_bytes(rec[0..4].try_into().unwrap());
        let mask = u32::from_ne_bytes(rec[4..8].try_into().unwrap());
        let name_len = u32::from_ne_bytes(rec[12..16].try_into().unwrap()) as usize;

        let total = EVENT_HEADER_SIZE + name_len;
        if self.pos + total > self.buf.len() {
            // Malformed or truncated record
            self.pos = self.buf.len();
            return None;
        }
        self.pos += total;
        Some(WatchEvent { wd, mask })
    }
}
