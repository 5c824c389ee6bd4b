// src/liveness.rs
//
// Ping-driven liveness. The caller ticks this on a fixed period; each tick
// touches at most one port, so a full sweep takes port-count ticks plus the
// broadcast slot. Countdowns are reset by any inbound traffic (dispatch);
// a port whose countdown was already zero when its turn comes is evicted.

use crate::bus::FrameTx;
use crate::logging::tlog;
use crate::protocol::{ID_DISCOVERY_REQUEST, PING_LOW_WATER};
use crate::table::PortTable;

/// One scheduler step. Cursor 0 is the broadcast sentinel: a discovery
/// request with an empty payload invites unconfigured nodes to announce.
/// Eviction leaves the cursor in place: after compaction the same slot
/// holds the next record.
pub(crate) fn tick<T: FrameTx>(table: &mut PortTable, cursor: &mut usize, tx: &T) {
    if *cursor == 0 {
        if let Err(e) = tx.send_frame(ID_DISCOVERY_REQUEST, &[]) {
            tlog!("[liveness] discovery broadcast: {}", e);
        }
        *cursor = 1;
        return;
    }

    if *cursor > table.port_count() {
        *cursor = 0;
        return;
    }

    let index = *cursor - 1;
    if table.record(index).countdown == 0 {
        let port = table.evict(index);
        tlog!("[liveness] port {} dead, evicted", port);
        return;
    }

    let record = table.record_mut(index);
    record.countdown -= 1;
    if record.countdown < PING_LOW_WATER {
        // Ping only when the node has been quiet, to keep bus load down
        if let Err(e) = tx.send_frame(record.ctl_id, &[]) {
            tlog!("[liveness] ping port {}: {}", record.port, e);
        }
    }
    *cursor += 1;
}
