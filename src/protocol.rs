// src/protocol.rs
//
// Wire protocol constants and payload codecs.
//
// Each remote node owns a pair of bus identifiers derived from its logical
// port number: the base ("control") identifier carries host->device traffic
// and resets, base+1 carries device->host data. Discovery runs on a fixed
// identifier block above the control range.

use crate::error::IoError;

// ============================================================================
// Bus identifiers
// ============================================================================

/// Discovery request: read a node's hardware id, or reset it (broadcast when empty)
pub const ID_DISCOVERY_REQUEST: u32 = 0x321;
/// SET: bind a control identifier (2 bytes) to a hardware id (6 bytes)
pub const ID_SET: u32 = 0x322;
/// Discovery response from a node, payload is its hardware id
pub const ID_DISCOVERY_RESPONSE: u32 = 0x323;
/// Receive filter covering the discovery identifier block
pub const DISCOVERY_FILTER: u32 = 0x320;
pub const DISCOVERY_MASK: u32 = 0xFFFC;
/// Port identifier pairs start here
pub const CTL_BASE: u32 = 0x180;
/// Filter mask for the control range: 127 ports max
pub const CTL_MASK: u32 = 0xFF80;

// ============================================================================
// Frame limits and protocol parameters
// ============================================================================

/// Classic CAN payload limit
pub const CAN_DATA_SIZE: usize = 8;
/// Hardware identifier length carried in discovery/SET payloads
pub const HW_ID_SIZE: usize = 6;
/// Liveness countdown start value: ticks a silent port survives
pub const PINGS_BEFORE_DISCONNECT: u32 = 4;
/// Countdown level below which keepalive pings are sent
pub const PING_LOW_WATER: u32 = 2;
/// End-of-packet marker in the serial stream; latches a port active
pub const END_OF_PACKET: u8 = 0x7E;

/// A node's hardware identifier as announced in discovery responses.
pub type HardwareId = [u8; HW_ID_SIZE];

/// Control (base) identifier for a logical port number.
/// The device answers on `ctl_id + 1`.
pub fn ctl_id(port: u16) -> u32 {
    2 * u32::from(port) + CTL_BASE
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Extract the hardware id from a discovery-response payload.
pub fn parse_hardware_id(data: &[u8]) -> Result<HardwareId, IoError> {
    if data.len() < HW_ID_SIZE {
        return Err(IoError::invalid(format!(
            "discovery payload too short: {} bytes, need {}",
            data.len(),
            HW_ID_SIZE
        )));
    }
    let mut id = [0u8; HW_ID_SIZE];
    id.copy_from_slice(&data[..HW_ID_SIZE]);
    Ok(id)
}

/// SET payload: control identifier (little-endian u16) followed by the
/// hardware id it was bound to.
pub fn set_payload(ctl: u32, hw_id: &HardwareId) -> [u8; 2 + HW_ID_SIZE] {
    let mut payload = [0u8; 2 + HW_ID_SIZE];
    payload[..2].copy_from_slice(&(ctl as u16).to_le_bytes());
    payload[2..].copy_from_slice(hw_id);
    payload
}

/// Targeted discovery/reset payload: the addressed control identifier as a
/// little-endian u16.
pub fn target_payload(ctl: u32) -> [u8; 2] {
    (ctl as u16).to_le_bytes()
}

/// Render a hardware id the way it is logged: `AA:BB:CC:DD:EE:FF`.
pub fn display_hw_id(hw_id: &HardwareId) -> String {
    hw_id
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
