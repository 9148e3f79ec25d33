use crate::registry::WatcherId;
use crate::timer::TimerId;

/// Errors that can occur while driving the event loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Creating the poller or its wake-up descriptor failed.
    #[error("failed to initialize event loop: {0}")]
    Init(std::io::Error),

    /// The operation is not valid in the loop's current state.
    #[error("event loop is {actual}, operation requires {required}")]
    InvalidState {
        actual: &'static str,
        required: &'static str,
    },

    /// Adding, modifying or removing a descriptor in the poller failed.
    #[error("failed to {op} watcher {id}: {source}")]
    Register {
        op: &'static str,
        id: WatcherId,
        source: std::io::Error,
    },

    /// A registry entry already exists for the id.
    #[error("watcher {0} is already registered")]
    AlreadyRegistered(WatcherId),

    /// No registry entry exists for the id.
    #[error("watcher {0} is not registered")]
    UnknownWatcher(WatcherId),

    /// No pending timer exists for the id.
    #[error("timer {0} is not pending")]
    UnknownTimer(TimerId),

    /// A read, write or poll on a descriptor failed.
    #[error("event loop I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoopError>;
