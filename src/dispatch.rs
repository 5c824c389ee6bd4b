// src/dispatch.rs
//
// The receive loop: one thread polling the CAN socket and every PTY master,
// demultiplexing in both directions, plus the discovery handshake and the
// port open/close watch events.
//
// The lock is dropped for the duration of the poll wait so the liveness
// ticker is never starved. The poll set is therefore a snapshot; every
// readiness hit is re-resolved against the live table (by port number and
// descriptor) after the lock is re-acquired, and anything stale is simply
// ignored. Descriptors parked on the graveyard by an evicting context are
// closed here, after poll has returned, never while a poll could still be
// watching them.

use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::bridge::{lock, BridgeState, Shared};
use crate::bus::FrameTx;
use crate::error::IoError;
use crate::logging::tlog;
use crate::portnum::PortNumberRegistry;
use crate::protocol::{
    display_hw_id, parse_hardware_id, set_payload, target_payload, CAN_DATA_SIZE, END_OF_PACKET,
    ID_DISCOVERY_REQUEST, ID_DISCOVERY_RESPONSE, ID_SET, PINGS_BEFORE_DISCONNECT,
};
use crate::table::{PollToken, PortRecord, PortTable};
use crate::vport;
use crate::watch::{Events, Inotify, WatchEvent, EVENT_BUF_SIZE};

const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Receive loop body. Runs until the stop flag is set or the virtual-port
/// subsystem fails hard; releases every remaining port before returning.
pub(crate) fn run(shared: Arc<Shared>) {
    tlog!("[dispatch] receive loop started");

    while !shared.stop.load(Ordering::Acquire) {
        // Snapshot the poll set; free anything evicted since the last pass.
        let snapshot = {
            let mut guard = lock(&shared.state);
            let BridgeState { table, inotify, .. } = &mut *guard;
            for retired in table.take_graveyard() {
                vport::release(retired, inotify);
            }
            table.poll_snapshot()
        };

        // Wait without the lock so the liveness ticker can run.
        let ready = poll_ready(&snapshot, POLL_TIMEOUT_MS);

        let mut guard = lock(&shared.state);
        let BridgeState {
            bus,
            table,
            registry,
            inotify,
            config,
            ..
        } = &mut *guard;

        let transport_ready = ready
            .iter()
            .any(|(fd, token)| *token == PollToken::Transport && *fd == table.transport_fd());

        let mut fatal = false;
        if transport_ready {
            match bus.recv() {
                Ok(Some((id, data))) => {
                    if let Err(e) = handle_bus_frame(
                        id,
                        &data,
                        table,
                        registry,
                        inotify,
                        &config.link_dir,
                        &config.link_base,
                        bus,
                    ) {
                        tlog!("[dispatch] {}; aborting receive loop", e);
                        fatal = true;
                    }
                }
                Ok(None) => {}
                Err(e) => tlog!("[dispatch] {}", e),
            }
        } else {
            for (fd, token) in &ready {
                let PollToken::Port(port) = token else {
                    continue;
                };
                // Re-validate: the table may have changed while we polled
                let Some(record) = table.find_by_port_mut(*port) else {
                    continue;
                };
                if record.master.as_raw_fd() != *fd {
                    continue;
                }
                let mut buf = [0u8; CAN_DATA_SIZE];
                let n = unsafe {
                    libc::read(*fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n > 0 {
                    forward_port_bytes(record, &buf[..n as usize], bus);
                }
            }
        }

        // Port open/close events arrive out of band of poll readiness
        let mut event_buf = [0u8; EVENT_BUF_SIZE];
        let n = inotify.drain(&mut event_buf);
        if n > 0 {
            handle_watch_events(table, Events::new(&event_buf[..n]), bus);
        }

        drop(guard);
        if fatal {
            break;
        }
    }

    // Teardown: unlink and free every remaining port
    let mut guard = lock(&shared.state);
    let BridgeState { table, inotify, .. } = &mut *guard;
    table.retire_all();
    for retired in table.take_graveyard() {
        vport::release(retired, inotify);
    }
    tlog!("[dispatch] receive loop stopped, all ports released");
}

/// poll(2) over the snapshot. Returns the entries with any readiness bits
/// set; timeouts and EINTR come back empty.
fn poll_ready(
    snapshot: &[(RawFd, PollToken)],
    timeout_ms: libc::c_int,
) -> Vec<(RawFd, PollToken)> {
    let mut pollfds: Vec<libc::pollfd> = snapshot
        .iter()
        .map(|(fd, _)| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc <= 0 {
        return Vec::new();
    }

    snapshot
        .iter()
        .zip(&pollfds)
        .filter(|(_, pfd)| pfd.revents != 0)
        .map(|(entry, _)| *entry)
        .collect()
}

/// Handle one inbound frame: discovery handshake, data demux, or a lost
/// handshake. Returns `Err` only for the unrecoverable case: virtual-port
/// allocation failure, which stops the loop.
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_bus_frame<T: FrameTx>(
    id: u32,
    data: &[u8],
    table: &mut PortTable,
    registry: &mut PortNumberRegistry,
    inotify: &Inotify,
    link_dir: &Path,
    link_base: &str,
    tx: &T,
) -> Result<(), IoError> {
    if id == ID_DISCOVERY_RESPONSE {
        let hw_id = match parse_hardware_id(data) {
            Ok(hw) => hw,
            Err(e) => {
                tlog!("[dispatch] bad discovery response: {}", e);
                return Ok(());
            }
        };
        let port = registry.resolve(&hw_id);
        tlog!(
            "[dispatch] discovery: hw {} -> port {}",
            display_hw_id(&hw_id),
            port
        );

        let index = vport::allocate(table, port, &hw_id, inotify, link_dir, link_base)?;
        let ctl = table.record(index).ctl_id;
        if let Err(e) = tx.send_frame(ID_SET, &set_payload(ctl, &hw_id)) {
            tlog!("[dispatch] SET for port {}: {}", port, e);
        }
        return Ok(());
    }

    if let Some(record) = table.find_by_data_id_mut(id) {
        if !data.is_empty() && record.active {
            let n = unsafe {
                libc::write(
                    record.master.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n != data.len() as isize {
                tlog!(
                    "[dispatch] short write to port {}: {} of {}",
                    record.port,
                    n.max(0),
                    data.len()
                );
            }
        }
        // Any traffic from the node proves it is alive
        record.countdown = PINGS_BEFORE_DISCONNECT;
        return Ok(());
    }

    // Traffic from an identifier we never configured: the handshake was
    // lost (host restart, missed SET). Ask the node to announce itself.
    tlog!(
        "[dispatch] unknown node on CANID 0x{:X}, requesting hardware id",
        id
    );
    if let Err(e) = tx.send_frame(ID_DISCOVERY_REQUEST, &target_payload(id - 1)) {
        tlog!("[dispatch] re-discovery request: {}", e);
    }
    Ok(())
}

/// Bytes read from a PTY master go out as one frame on the port's control
/// identifier. An end-of-packet marker anywhere in the read latches the
/// port active: from then on bus traffic may be forwarded to it.
pub(crate) fn forward_port_bytes<T: FrameTx>(record: &mut PortRecord, bytes: &[u8], tx: &T) {
    if bytes.iter().any(|&b| b == END_OF_PACKET) {
        if !record.active {
            tlog!("[dispatch] port {} completed a frame, now active", record.port);
        }
        record.active = true;
    }
    if let Err(e) = tx.send_frame(record.ctl_id, bytes) {
        tlog!("[dispatch] port {} tx: {}", record.port, e);
    }
}

/// Apply drained watch events: an open marks the port active and tells the
/// node the host reconnected; a close marks it inactive.
pub(crate) fn handle_watch_events<T: FrameTx>(
    table: &mut PortTable,
    events: impl Iterator<Item = WatchEvent>,
    tx: &T,
) {
    for event in events {
        let Some(record) = table.find_by_watch_mut(event.wd) else {
            continue;
        };
        if event.is_open() {
            record.active = true;
            tlog!("[dispatch] port {} opened", record.port);
            if let Err(e) = tx.send_frame(ID_DISCOVERY_REQUEST, &target_payload(record.ctl_id)) {
                tlog!("[dispatch] reset request for port {}: {}", record.port, e);
            }
        } else if event.is_close() {
            record.active = false;
            tlog!("[dispatch] port {} closed", record.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingTx;
    use std::fs::File;

    const HW: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    struct Fixture {
        dir: tempfile::TempDir,
        inotify: Inotify,
        _transport: File,
        table: PortTable,
        registry: PortNumberRegistry,
        tx: RecordingTx,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = File::open("/dev/null").unwrap();
            let table = PortTable::new(transport.as_raw_fd());
            Fixture {
                dir: tempfile::tempdir().unwrap(),
                inotify: Inotify::new().unwrap(),
                _transport: transport,
                table,
                registry: PortNumberRegistry::new(),
                tx: RecordingTx::new(),
            }
        }

        fn frame(&mut self, id: u32, data: &[u8]) -> Result<(), IoError> {
            handle_bus_frame(
                id,
                data,
                &mut self.table,
                &mut self.registry,
                &self.inotify,
                self.dir.path(),
                "ttyCAN0",
                &self.tx,
            )
        }
    }

    fn set_nonblocking(fd: RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    #[test]
    fn test_discovery_creates_port_and_acks() {
        let mut fx = Fixture::new();
        // Two earlier devices so the announced node lands on port 3
        fx.registry.resolve(&[0xA0; 6]);
        fx.registry.resolve(&[0xA1; 6]);

        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();

        assert_eq!(fx.table.port_count(), 1);
        let record = fx.table.record(0);
        assert_eq!(record.port, 3);
        assert_eq!(record.ctl_id, 0x186);
        assert_eq!(record.countdown, PINGS_BEFORE_DISCONNECT);
        assert!(!record.active);

        let link = fx.dir.path().join("ttyCAN0_010203040506");
        assert!(link.symlink_metadata().is_ok());

        let sent = fx.tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ID_SET);
        assert_eq!(&sent[0].1[..2], &[0x86, 0x01]);
        assert_eq!(&sent[0].1[2..], &HW);
    }

    #[test]
    fn test_rediscovery_is_idempotent() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();

        assert_eq!(fx.table.port_count(), 1);
        assert_eq!(fx.table.handles().len(), 2);
        // Both rounds ack with the same binding
        let sent = fx.tx.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[test]
    fn test_short_discovery_payload_ignored() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW[..4]).unwrap();
        assert_eq!(fx.table.port_count(), 0);
        assert!(fx.tx.take().is_empty());
    }

    #[test]
    fn test_unknown_identifier_triggers_rediscovery() {
        let mut fx = Fixture::new();
        fx.frame(0x187, &[0x55]).unwrap();

        assert_eq!(fx.table.port_count(), 0);
        let sent = fx.tx.take();
        assert_eq!(sent, vec![(ID_DISCOVERY_REQUEST, vec![0x86, 0x01])]);
    }

    #[test]
    fn test_inactive_port_gets_no_forwarded_bytes() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.tx.take();

        let peer_fd = fx.table.record(0).peer.as_raw_fd();
        set_nonblocking(peer_fd);
        fx.table.record_mut(0).countdown = 1;

        let data_id = fx.table.record(0).data_id();
        fx.frame(data_id, b"hello").unwrap();

        // Countdown refreshed even though forwarding was gated off
        assert_eq!(fx.table.record(0).countdown, PINGS_BEFORE_DISCONNECT);
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(peer_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(n <= 0, "inactive port must not receive bus bytes");
    }

    #[test]
    fn test_active_port_receives_bus_bytes() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.tx.take();
        fx.table.record_mut(0).active = true;

        let peer_fd = fx.table.record(0).peer.as_raw_fd();
        set_nonblocking(peer_fd);
        let data_id = fx.table.record(0).data_id();
        fx.frame(data_id, b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(peer_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_end_of_packet_latches_active() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.tx.take();
        let ctl = fx.table.record(0).ctl_id;

        let record = fx.table.record_mut(0);
        forward_port_bytes(record, b"abc", &fx.tx);
        assert!(!record.active);

        forward_port_bytes(record, &[0x41, END_OF_PACKET, 0x42], &fx.tx);
        assert!(record.active);

        // Both reads went out on the control identifier regardless of latch
        let sent = fx.tx.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (ctl, b"abc".to_vec()));
        assert_eq!(sent[1], (ctl, vec![0x41, END_OF_PACKET, 0x42]));
    }

    #[test]
    fn test_watch_open_and_close_toggle_activity() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.tx.take();

        let wd = fx.table.record(0).watch;
        let ctl = fx.table.record(0).ctl_id;

        let open = WatchEvent {
            wd,
            mask: libc::IN_OPEN as u32,
        };
        handle_watch_events(&mut fx.table, std::iter::once(open), &fx.tx);
        assert!(fx.table.record(0).active);
        // Host reconnect resets the node
        assert_eq!(
            fx.tx.take(),
            vec![(ID_DISCOVERY_REQUEST, target_payload(ctl).to_vec())]
        );

        let close = WatchEvent {
            wd,
            mask: libc::IN_CLOSE_WRITE as u32,
        };
        handle_watch_events(&mut fx.table, std::iter::once(close), &fx.tx);
        assert!(!fx.table.record(0).active);
        assert!(fx.tx.take().is_empty());
    }

    #[test]
    fn test_real_watch_event_after_opening_link() {
        let mut fx = Fixture::new();
        fx.frame(ID_DISCOVERY_RESPONSE, &HW).unwrap();
        fx.tx.take();

        // Opening the symlink target generates IN_OPEN on the watch
        let link = fx.dir.path().join("ttyCAN0_010203040506");
        let _tty = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&link)
            .unwrap();

        let mut buf = [0u8; EVENT_BUF_SIZE];
        let n = fx.inotify.drain(&mut buf);
        assert!(n > 0, "expected an inotify event for the open");
        handle_watch_events(&mut fx.table, Events::new(&buf[..n]), &fx.tx);
        assert!(fx.table.record(0).active);
    }
}
