// src/table.rs
//
// The port table: one record per known remote node, plus the index-aligned
// list of pollable descriptors handed to poll(2). Slot 0 of the handle list
// is always the CAN socket; slot i+1 belongs to records[i].
//
// Eviction does not free OS resources directly. The evicting context only
// unlinks the record and parks its owned resources on the graveyard; the
// dispatch thread (the only thread that polls) frees them after its next
// poll returns. Removal from the poll set therefore happens-before any
// descriptor is closed, and poll never sees a dead fd.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::protocol::HardwareId;

/// One known remote node and its virtual port.
#[derive(Debug)]
pub struct PortRecord {
    /// Logical port number assigned by the host registry
    pub port: u16,
    /// Base identifier: host->device traffic and keepalives
    pub ctl_id: u32,
    /// Hardware id announced in discovery
    pub hw_id: HardwareId,
    /// Ticks left before eviction; reset by any inbound traffic
    pub countdown: u32,
    /// Gates bus->port forwarding only; latched by the end-of-packet marker
    pub active: bool,
    /// Inotify watch on the port symlink
    pub watch: i32,
    /// PTY controller side, non-blocking
    pub master: OwnedFd,
    /// PTY user side, held open so the master never reports hangup while
    /// no host process has the tty
    pub peer: OwnedFd,
    /// Symlink exposed to users
    pub link_path: PathBuf,
}

impl PortRecord {
    /// Identifier the device transmits on.
    pub fn data_id(&self) -> u32 {
        self.ctl_id + 1
    }
}

/// Resources of an evicted record, awaiting release on the dispatch thread.
#[derive(Debug)]
pub struct Retired {
    pub master: OwnedFd,
    pub peer: OwnedFd,
    pub watch: i32,
    pub link_path: PathBuf,
}

impl From<PortRecord> for Retired {
    fn from(rec: PortRecord) -> Self {
        Retired {
            master: rec.master,
            peer: rec.peer,
            watch: rec.watch,
            link_path: rec.link_path,
        }
    }
}

/// What a poll-set entry referred to when the snapshot was taken. Readiness
/// is only acted on after re-resolving the token against the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollToken {
    Transport,
    Port(u16),
}

/// Record vector plus the aligned pollable-handle vector.
#[derive(Debug)]
pub struct PortTable {
    records: Vec<PortRecord>,
    handles: Vec<RawFd>,
    graveyard: Vec<Retired>,
}

impl PortTable {
    pub fn new(transport_fd: RawFd) -> Self {
        Self {
            records: Vec::new(),
            handles: vec![transport_fd],
            graveyard: Vec::new(),
        }
    }

    /// `handles.len() == records.len() + 1`, slot 0 is the transport, and
    /// every other slot matches its record's descriptor.
    fn check_alignment(&self) {
        debug_assert_eq!(self.handles.len(), self.records.len() + 1);
        debug_assert!(self
            .records
            .iter()
            .zip(&self.handles[1..])
            .all(|(r, fd)| r.master.as_raw_fd() == *fd));
    }

    pub fn transport_fd(&self) -> RawFd {
        self.handles[0]
    }

    pub fn port_count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[PortRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> &PortRecord {
        &self.records[index]
    }

    pub fn record_mut(&mut self, index: usize) -> &mut PortRecord {
        &mut self.records[index]
    }

    pub fn handles(&self) -> &[RawFd] {
        &self.handles
    }

    pub fn index_of_port(&self, port: u16) -> Option<usize> {
        self.records.iter().position(|r| r.port == port)
    }

    pub fn find_by_port_mut(&mut self, port: u16) -> Option<&mut PortRecord> {
        self.records.iter_mut().find(|r| r.port == port)
    }

    /// Match an inbound frame identifier against the records' data ids.
    pub fn find_by_data_id_mut(&mut self, id: u32) -> Option<&mut PortRecord> {
        self.records.iter_mut().find(|r| r.data_id() == id)
    }

    pub fn find_by_watch_mut(&mut self, wd: i32) -> Option<&mut PortRecord> {
        self.records.iter_mut().find(|r| r.watch == wd)
    }

    /// Append a record, registering its descriptor for polling.
    /// Returns the new record's index.
    pub fn push(&mut self, record: PortRecord) -> usize {
        self.handles.push(record.master.as_raw_fd());
        self.records.push(record);
        self.check_alignment();
        self.records.len() - 1
    }

    /// Unlink the record at `index`, compacting both vectors in lockstep.
    /// Its resources go to the graveyard for the dispatch thread to free.
    pub fn evict(&mut self, index: usize) -> u16 {
        let record = self.records.remove(index);
        self.handles.remove(index + 1);
        self.check_alignment();
        let port = record.port;
        self.graveyard.push(record.into());
        port
    }

    /// Unlink every record (shutdown path).
    pub fn retire_all(&mut self) {
        while !self.records.is_empty() {
            self.evict(0);
        }
    }

    /// Hand over everything awaiting release. Dispatch-thread only.
    pub fn take_graveyard(&mut self) -> Vec<Retired> {
        std::mem::take(&mut self.graveyard)
    }

    /// Snapshot of the poll set: descriptor plus the token it stood for.
    pub fn poll_snapshot(&self) -> Vec<(RawFd, PollToken)> {
        let mut set = Vec::with_capacity(self.handles.len());
        set.push((self.handles[0], PollToken::Transport));
        set.extend(
            self.records
                .iter()
                .map(|r| (r.master.as_raw_fd(), PollToken::Port(r.port))),
        );
        set
    }
}
