// src/lib.rs
//
// canserial: bridges remote serial-capable CAN nodes onto the host as
// virtual serial ports.
//
// Nodes announce a 6-byte hardware id on the bus; each one gets a PTY pair
// and a stable symlink named from that id. A dispatch thread demultiplexes
// bus traffic to the PTYs and PTY writes back onto the bus, while an
// externally ticked liveness scheduler pings quiet nodes and evicts dead
// ones. See DESIGN.md for the concurrency and eviction model.

pub(crate) mod logging;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod portnum;
pub mod protocol;
pub mod table;
pub mod vport;
pub mod watch;

mod dispatch;
mod liveness;

pub use bridge::CanBridge;
pub use bus::FrameTx;
pub use config::BridgeConfig;
pub use error::IoError;
pub use logging::init_file_logging;

#[cfg(test)]
pub(crate) mod testutil {
    use crate::bus::FrameTx;
    use crate::error::IoError;
    use std::sync::Mutex;

    /// Records every frame handed to it, for driving the protocol state
    /// machines without a bus.
    #[derive(Default)]
    pub struct RecordingTx {
        sent: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl RecordingTx {
        pub fn new() -> Self {
            Self::default()
        }

        /// Drain everything sent so far.
        pub fn take(&self) -> Vec<(u32, Vec<u8>)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl FrameTx for RecordingTx {
        fn send_frame(&self, id: u32, data: &[u8]) -> Result<(), IoError> {
            self.sent.lock().unwrap().push((id, data.to_vec()));
            Ok(())
        }
    }
}
