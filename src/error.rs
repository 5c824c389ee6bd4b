// src/error.rs
//
// Error taxonomy for the bridge.
//
// Transport errors are fatal at startup (the bridge never comes up without
// its socket). Resource errors abort the discovery exchange that hit them
// and stop the dispatch loop; a host that can no longer mint PTYs is not
// serving anyone. Io and InvalidArgument are per-operation failures: logged,
// the operation abandoned, service continues for the other ports.

use std::fmt;

/// Bridge error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// CAN socket setup or bind failure (no such interface, permissions, ...)
    Transport(String),
    /// PTY / symlink / watch allocation failure during discovery
    Resource(String),
    /// Short or failed read/write on an open descriptor
    Io(String),
    /// Rejected before any syscall (e.g. payload longer than a CAN frame)
    InvalidArgument(String),
    /// Bad configuration input
    Config(String),
}

impl IoError {
    /// Transport-layer setup error for a named interface
    pub fn transport(interface: &str, detail: impl fmt::Display) -> Self {
        IoError::Transport(format!("{}: {}", interface, detail))
    }

    /// Virtual-port resource allocation error
    pub fn resource(detail: impl fmt::Display) -> Self {
        IoError::Resource(detail.to_string())
    }

    /// Read/write error on an open descriptor
    pub fn io(detail: impl fmt::Display) -> Self {
        IoError::Io(detail.to_string())
    }

    /// Argument rejected before reaching the kernel
    pub fn invalid(detail: impl fmt::Display) -> Self {
        IoError::InvalidArgument(detail.to_string())
    }

    /// Configuration error
    pub fn config(detail: impl fmt::Display) -> Self {
        IoError::Config(detail.to_string())
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Transport(msg) => write!(f, "transport error: {}", msg),
            IoError::Resource(msg) => write!(f, "resource error: {}", msg),
            IoError::Io(msg) => write!(f, "io error: {}", msg),
            IoError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            IoError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for IoError {}
