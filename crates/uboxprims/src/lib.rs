//! Typed attribute messages and a single-threaded event loop for local IPC
//! agents.
//!
//! uboxprims pairs a self-describing binary message format with a small
//! readiness reactor: build a message, write it to a descriptor the loop
//! watches, decode what comes back.
//!
//! # Crate Structure
//!
//! - [`blob`]: Attribute buffers, value marshaling and the JSON bridge
//! - [`event`]: Epoll reactor, watcher registry, timers and pooled reads
//! - [`logging`]: `tracing-subscriber` setup (behind `logging` feature)

/// Re-export attribute buffer types.
pub mod blob {
    pub use uboxprims_blob::*;
}

/// Re-export event loop types.
pub mod event {
    pub use uboxprims_loop::*;
}

#[cfg(feature = "logging")]
pub mod logging;
