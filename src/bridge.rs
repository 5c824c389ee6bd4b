// src/bridge.rs
//
// The bridge context object: owns the transport, the port table, and the
// dispatch thread. Everything the external process needs is a method here;
// dropping the bridge tears the whole thing down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::bus::{CanBus, FrameTx};
use crate::config::BridgeConfig;
use crate::dispatch;
use crate::error::IoError;
use crate::liveness;
use crate::logging::tlog;
use crate::portnum::PortNumberRegistry;
use crate::table::PortTable;
use crate::watch::Inotify;

/// Everything both execution contexts touch, behind the one lock.
pub(crate) struct BridgeState {
    pub(crate) bus: CanBus,
    pub(crate) table: PortTable,
    pub(crate) registry: PortNumberRegistry,
    /// Liveness cursor; 0 is the broadcast sentinel
    pub(crate) cursor: usize,
    pub(crate) inotify: Inotify,
    pub(crate) config: BridgeConfig,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<BridgeState>,
    pub(crate) stop: AtomicBool,
}

/// Take the state lock. A panic on the dispatch thread must not wedge
/// shutdown, so poisoning is ignored.
pub(crate) fn lock(state: &Mutex<BridgeState>) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running CAN-to-serial bridge.
pub struct CanBridge {
    shared: Arc<Shared>,
    rx_thread: Option<JoinHandle<()>>,
}

impl CanBridge {
    /// Open the transport and start the dispatch thread.
    pub fn open(config: BridgeConfig) -> Result<Self, IoError> {
        let bus = CanBus::open(&config.interface)?;
        let inotify = Inotify::new()?;
        std::fs::create_dir_all(&config.link_dir).map_err(|e| {
            IoError::resource(format!("link dir {}: {}", config.link_dir.display(), e))
        })?;

        let table = PortTable::new(bus.as_raw_fd());
        tlog!(
            "[bridge] up on {}, ports under {}/{}_*",
            bus.interface(),
            config.link_dir.display(),
            config.link_base
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(BridgeState {
                bus,
                table,
                registry: PortNumberRegistry::new(),
                cursor: 0,
                inotify,
                config,
            }),
            stop: AtomicBool::new(false),
        });

        let thread = std::thread::Builder::new()
            .name("canserial-rx".to_string())
            .spawn({
                let shared = shared.clone();
                move || dispatch::run(shared)
            })
            .map_err(|e| IoError::resource(format!("spawn dispatch thread: {}", e)))?;

        Ok(Self {
            shared,
            rx_thread: Some(thread),
        })
    }

    /// Send one frame on the bus. Serialised with table mutations.
    pub fn send(&self, id: u32, data: &[u8]) -> Result<(), IoError> {
        let state = lock(&self.shared.state);
        state.bus.send_frame(id, data)
    }

    /// One liveness scheduler step. Call on a fixed period.
    pub fn tick(&self) {
        let mut state = lock(&self.shared.state);
        let BridgeState {
            bus, table, cursor, ..
        } = &mut *state;
        liveness::tick(table, cursor, bus);
    }

    /// Number of ports currently in the table.
    pub fn port_count(&self) -> usize {
        lock(&self.shared.state).table.port_count()
    }

    /// Stop the dispatch thread and release every port. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.rx_thread.take() {
            self.shared.stop.store(true, Ordering::Release);
            // Dispatch notices within one poll timeout and releases the
            // ports on its way out
            if handle.join().is_err() {
                tlog!("[bridge] dispatch thread panicked during shutdown");
            }
            tlog!("[bridge] shut down");
        }
    }
}

impl Drop for CanBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
