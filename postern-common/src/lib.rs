pub mod address;
pub mod error;
pub mod logging;
pub mod status;

pub use tracing;

/// Broadcast to every long-running task when the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
