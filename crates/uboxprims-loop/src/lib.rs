//! Single-threaded event reactor over epoll.
//!
//! Provides:
//! - [`EventLoop`] with an explicit `init` / `run` / `end` / `done` lifecycle
//! - [`LoopHandle`] for registering descriptors and timers from handlers or
//!   other threads
//! - A [`Registry`] keyed by opaque [`WatcherId`]s that owns each watched
//!   descriptor
//! - One-shot timers that rearm through their return value
//! - Pooled read buffers
//!
//! Linux only; on other targets only the buffer pool is available.

#[cfg(target_os = "linux")]
pub mod error;
#[cfg(target_os = "linux")]
pub mod flags;
#[cfg(target_os = "linux")]
mod poller;
pub mod pool;
#[cfg(target_os = "linux")]
pub mod reactor;
#[cfg(target_os = "linux")]
pub mod registry;
#[cfg(target_os = "linux")]
pub mod timer;

#[cfg(target_os = "linux")]
pub use error::{LoopError, Result};
#[cfg(target_os = "linux")]
pub use flags::{Ready, WatchFlags};
pub use pool::{BufferPool, PooledBuf, DEFAULT_POOL_CAPACITY, DEFAULT_READ_BUFFER_SIZE};
#[cfg(target_os = "linux")]
pub use reactor::{EventLoop, LoopConfig, LoopHandle, LoopState, DEFAULT_MAX_EVENTS};
#[cfg(target_os = "linux")]
pub use registry::{Handler, Registry, WatcherId};
#[cfg(target_os = "linux")]
pub use timer::{TimerAction, TimerCallback, TimerId};
