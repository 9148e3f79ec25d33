//! The event loop and its cross-thread handle.
//!
//! An [`EventLoop`] is driven by exactly one thread through
//! [`run`](EventLoop::run). Registration, I/O, timers and stop requests go
//! through a [`LoopHandle`], which handlers receive as their first argument
//! and which other threads may hold as well.
//!
//! Handlers run synchronously on the loop thread. A handler that blocks
//! stalls every other watcher and timer.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{LoopError, Result};
use crate::flags::{Ready, WatchFlags};
use crate::poller::{empty_event, set_nonblocking, Poller, WAKE_TOKEN};
use crate::pool::{BufferPool, PooledBuf, DEFAULT_POOL_CAPACITY, DEFAULT_READ_BUFFER_SIZE};
use crate::registry::{Entry, Registry, WatcherId};
use crate::timer::{deadline_after, TimerAction, TimerId, Timers};

/// Default number of readiness events collected per wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Configuration for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness events collected per wait. Default: 64.
    pub max_events: usize,
    /// Size of each pooled read buffer. Default: 64 KiB.
    pub read_buffer_size: usize,
    /// Read buffers kept in the pool. Default: 16.
    pub pool_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Lifecycle of an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, no poller yet.
    Uninitialized,
    /// Poller created; watchers and timers may be added.
    Ready,
    /// Inside [`EventLoop::run`].
    Running,
    /// Inside `run` with a stop requested; no further handler or timer is
    /// dispatched. Seen through [`LoopHandle::state`].
    Stopping,
    /// Released by [`EventLoop::done`].
    Done,
}

impl LoopState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Shared {
    /// `None` once released. Registration holds the read lock across its
    /// insert so a concurrent release cannot miss the entry.
    poller: RwLock<Option<Arc<Poller>>>,
    registry: Registry,
    timers: Mutex<Timers>,
    pool: BufferPool,
    stop: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poller_slot(&self) -> RwLockReadGuard<'_, Option<Arc<Poller>>> {
        self.poller.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn poller(&self) -> Result<Arc<Poller>> {
        self.poller_slot().clone().ok_or_else(released)
    }

    /// Close the poller and drop every watcher and timer. Returns the
    /// counts released.
    fn release(&self) -> (usize, usize) {
        let poller = self
            .poller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let entries = self.registry.drain();
        if let Some(poller) = &poller {
            for (id, entry) in &entries {
                if let Err(err) = poller.delete(entry.fd.as_raw_fd()) {
                    warn!(watcher = %id, error = %err, "failed to remove descriptor from poller");
                }
            }
        }
        let timers = self.timers().clear();
        (entries.len(), timers)
    }
}

fn released() -> LoopError {
    LoopError::InvalidState {
        actual: LoopState::Done.name(),
        required: "ready",
    }
}

/// Single-threaded readiness reactor.
pub struct EventLoop {
    config: LoopConfig,
    state: LoopState,
    shared: Option<Arc<Shared>>,
    events: Vec<libc::epoll_event>,
}

impl EventLoop {
    /// Create an uninitialized loop with the default configuration.
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Self {
        Self {
            config,
            state: LoopState::Uninitialized,
            shared: None,
            events: Vec::new(),
        }
    }

    /// Create the poller and the wake-up descriptor.
    ///
    /// Valid before the first use and again after [`done`](Self::done).
    pub fn init(&mut self) -> Result<()> {
        if !matches!(self.state, LoopState::Uninitialized | LoopState::Done) {
            return Err(LoopError::InvalidState {
                actual: self.state.name(),
                required: "uninitialized or done",
            });
        }

        let poller = Poller::new().map_err(LoopError::Init)?;
        self.shared = Some(Arc::new(Shared {
            poller: RwLock::new(Some(Arc::new(poller))),
            registry: Registry::new(),
            timers: Mutex::new(Timers::new()),
            pool: BufferPool::with_capacity(self.config.pool_capacity, self.config.read_buffer_size),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }));
        self.events = vec![empty_event(); self.config.max_events.max(1)];
        self.state = LoopState::Ready;
        debug!(max_events = self.config.max_events, "event loop initialized");
        Ok(())
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// A handle for registering watchers and timers.
    pub fn handle(&self) -> Result<LoopHandle> {
        match &self.shared {
            Some(shared) => Ok(LoopHandle {
                shared: Arc::clone(shared),
            }),
            None => Err(LoopError::InvalidState {
                actual: self.state.name(),
                required: "ready",
            }),
        }
    }

    /// Dispatch readiness and timers until a stop is requested.
    ///
    /// The stop flag is cleared on entry, so a stop requested while the loop
    /// was not running does not end the next run.
    pub fn run(&mut self) -> Result<()> {
        let shared = match (&self.shared, self.state) {
            (Some(shared), LoopState::Ready) => Arc::clone(shared),
            _ => {
                return Err(LoopError::InvalidState {
                    actual: self.state.name(),
                    required: "ready",
                })
            }
        };

        let poller = shared.poller()?;
        shared.stop.store(false, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);
        self.state = LoopState::Running;
        debug!("event loop running");

        let handle = LoopHandle { shared };
        let result = self.run_until_stopped(&handle, &poller);

        handle.shared.running.store(false, Ordering::SeqCst);
        self.state = LoopState::Ready;
        debug!(ok = result.is_ok(), "event loop stopped");
        result
    }

    fn run_until_stopped(&mut self, handle: &LoopHandle, poller: &Poller) -> Result<()> {
        let shared = &handle.shared;
        loop {
            if handle.fire_timers() || handle.stop_requested() {
                break;
            }

            let timeout = shared
                .timers()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let n = poller.wait(&mut self.events, timeout)?;

            for event in self.events[..n].iter().copied() {
                let (token, events) = (event.u64, event.events);
                if token == WAKE_TOKEN {
                    poller.drain_wake();
                    continue;
                }
                if handle.stop_requested() {
                    break;
                }
                handle.dispatch_one(WatcherId::from_token(token), Ready::from_epoll(events));
            }

            if handle.stop_requested() {
                break;
            }
        }
        Ok(())
    }

    /// Request [`run`](Self::run) to return.
    pub fn end(&self) {
        if let Some(shared) = &self.shared {
            LoopHandle::request_stop(shared);
        }
    }

    /// Close the poller and release every remaining watcher and pending timer.
    ///
    /// Outstanding handles stay valid to hold but refuse new registrations
    /// and timers.
    pub fn done(&mut self) -> Result<()> {
        let Some(shared) = self.shared.take() else {
            return Err(LoopError::InvalidState {
                actual: self.state.name(),
                required: "ready",
            });
        };

        let (watchers, timers) = shared.release();
        self.events = Vec::new();
        self.state = LoopState::Done;
        debug!(watchers, timers, "event loop released");
        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

/// Cloneable, thread-safe access to a loop's watchers and timers.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Watch `fd`, taking ownership of it.
    ///
    /// The descriptor is switched to non-blocking mode unless
    /// [`WatchFlags::BLOCKING`] is given. It is closed on deregistration, or
    /// when the loop is released.
    pub fn register<F>(&self, fd: OwnedFd, flags: WatchFlags, handler: F) -> Result<WatcherId>
    where
        F: FnMut(&LoopHandle, WatcherId, Ready) + Send + 'static,
    {
        let shared = &self.shared;
        let slot = shared.poller_slot();
        let poller = slot.as_ref().ok_or_else(released)?;
        let id = shared.registry.next_id();
        let raw = fd.as_raw_fd();

        set_nonblocking(raw, !flags.contains(WatchFlags::BLOCKING)).map_err(|source| {
            LoopError::Register {
                op: "configure",
                id,
                source,
            }
        })?;

        // Insert before arming the poller so the first event finds the entry.
        shared
            .registry
            .insert(id, Entry::new(fd, flags, Box::new(handler)))?;
        if let Err(source) = poller.add(raw, id.as_u64(), flags.epoll_events()) {
            shared.registry.remove(id);
            return Err(LoopError::Register {
                op: "add",
                id,
                source,
            });
        }

        debug!(watcher = %id, fd = raw, ?flags, "registered watcher");
        Ok(id)
    }

    /// Stop watching `id` and drop its descriptor.
    ///
    /// The descriptor closes once no in-flight [`read`](Self::read) or
    /// [`write`](Self::write) still holds it. Events already collected for
    /// the id are dropped.
    pub fn deregister(&self, id: WatcherId) -> Result<()> {
        let entry = self
            .shared
            .registry
            .remove(id)
            .ok_or(LoopError::UnknownWatcher(id))?;
        if let Some(poller) = self.shared.poller_slot().as_ref() {
            if let Err(err) = poller.delete(entry.fd.as_raw_fd()) {
                warn!(watcher = %id, error = %err, "failed to remove descriptor from poller");
            }
        }
        debug!(watcher = %id, "deregistered watcher");
        Ok(())
    }

    /// Change the interest flags of a live watcher.
    pub fn modify(&self, id: WatcherId, flags: WatchFlags) -> Result<()> {
        let fd = self
            .shared
            .registry
            .descriptor(id)
            .ok_or(LoopError::UnknownWatcher(id))?;
        let raw = fd.as_raw_fd();

        let poller = self.shared.poller()?;
        let register_err = |op, source| LoopError::Register { op, id, source };
        set_nonblocking(raw, !flags.contains(WatchFlags::BLOCKING))
            .map_err(|source| register_err("configure", source))?;
        poller
            .modify(raw, id.as_u64(), flags.epoll_events())
            .map_err(|source| register_err("modify", source))?;
        self.shared.registry.set_flags(id, flags);

        debug!(watcher = %id, ?flags, "modified watcher");
        Ok(())
    }

    /// One `read(2)` from the watcher's descriptor into a pooled buffer.
    ///
    /// The buffer's length is the byte count; zero means the peer closed.
    /// A non-blocking descriptor with nothing to read fails with an
    /// [`std::io::ErrorKind::WouldBlock`] I/O error.
    pub fn read(&self, id: WatcherId) -> Result<PooledBuf> {
        let fd = self
            .shared
            .registry
            .descriptor(id)
            .ok_or(LoopError::UnknownWatcher(id))?;
        let mut buf = self.shared.pool.get_filled();

        // SAFETY: `buf` is valid for `buf.len()` writes and `fd` stays open
        // while the Arc is held.
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        buf.truncate(n as usize);
        trace!(watcher = %id, len = n, "read");
        Ok(buf)
    }

    /// One `write(2)` of `data` to the watcher's descriptor.
    ///
    /// Returns the number of bytes written, which may be less than
    /// `data.len()`.
    pub fn write(&self, id: WatcherId, data: &[u8]) -> Result<usize> {
        let fd = self
            .shared
            .registry
            .descriptor(id)
            .ok_or(LoopError::UnknownWatcher(id))?;

        // SAFETY: `data` is valid for `data.len()` reads and `fd` stays open
        // while the Arc is held.
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                data.as_ptr().cast::<libc::c_void>(),
                data.len(),
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        trace!(watcher = %id, len = n, "wrote");
        Ok(n as usize)
    }

    /// Run `callback` on the loop thread once `delay` has elapsed.
    ///
    /// A delay past the end of the monotonic clock never expires; the timer
    /// stays pending until cancelled or the loop is released.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<TimerId>
    where
        F: FnMut(&LoopHandle, TimerId) -> TimerAction + Send + 'static,
    {
        let slot = self.shared.poller_slot();
        let poller = slot.as_ref().ok_or_else(released)?;
        let deadline = deadline_after(Instant::now(), delay);
        let id = self.shared.timers().insert(deadline, Box::new(callback));
        // a blocked wait must pick up the new deadline
        poller.wake()?;
        trace!(timer = %id, ?delay, "timer set");
        Ok(id)
    }

    /// Cancel a pending timer.
    ///
    /// Returns false if it already fired or is running; a timer cancelling
    /// itself from its own callback is a no-op.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let cancelled = self.shared.timers().cancel(id);
        trace!(timer = %id, cancelled, "timer cancel");
        cancelled
    }

    /// Time left before a pending timer fires; `Duration::MAX` if it never
    /// will.
    pub fn timer_remaining(&self, id: TimerId) -> Result<Duration> {
        self.shared
            .timers()
            .remaining(id, Instant::now())
            .ok_or(LoopError::UnknownTimer(id))
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers().len()
    }

    /// Request the loop to stop. The running handler finishes; no further
    /// handler or timer runs in this pass.
    pub fn end(&self) {
        Self::request_stop(&self.shared);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Lifecycle state of the loop as seen from a handle.
    ///
    /// Never [`LoopState::Uninitialized`]: handles only exist once the loop
    /// is initialized.
    pub fn state(&self) -> LoopState {
        if self.shared.poller_slot().is_none() {
            LoopState::Done
        } else if !self.shared.running.load(Ordering::SeqCst) {
            LoopState::Ready
        } else if self.stop_requested() {
            LoopState::Stopping
        } else {
            LoopState::Running
        }
    }

    /// The loop's watcher registry.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// The pool read buffers are taken from.
    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    fn request_stop(shared: &Shared) {
        shared.stop.store(true, Ordering::SeqCst);
        if let Some(poller) = shared.poller_slot().as_ref() {
            if let Err(err) = poller.wake() {
                warn!(error = %err, "failed to wake event loop");
            }
        }
    }

    /// Invoke the handler registered for `id`. Returns false on a lookup
    /// miss, which is logged and otherwise ignored.
    pub(crate) fn dispatch_one(&self, id: WatcherId, ready: Ready) -> bool {
        let Some(handler) = self.shared.registry.handler(id) else {
            debug!(watcher = %id, ?ready, "event for unknown watcher dropped");
            return false;
        };
        trace!(watcher = %id, ?ready, "dispatch");
        let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
        let handler = &mut *guard;
        handler(self, id, ready);
        true
    }

    /// Run every timer due now. Returns true if a stop was requested
    /// before all of them ran.
    fn fire_timers(&self) -> bool {
        let now = Instant::now();
        let due = self.shared.timers().due(now);
        for id in due {
            if self.stop_requested() {
                return true;
            }
            // an earlier callback may have cancelled this one
            let Some(mut callback) = self.shared.timers().take_due(id, now) else {
                continue;
            };
            trace!(timer = %id, "timer fired");
            match callback(self, id) {
                TimerAction::Done => {}
                TimerAction::Rearm(delay) => {
                    let deadline = deadline_after(Instant::now(), delay);
                    self.shared.timers().schedule(id, deadline, callback);
                }
            }
        }
        self.stop_requested()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("watchers", &self.shared.registry.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    fn ready_loop() -> (EventLoop, LoopHandle) {
        let mut event_loop = EventLoop::with_config(LoopConfig {
            read_buffer_size: 1024,
            pool_capacity: 2,
            ..LoopConfig::default()
        });
        event_loop.init().unwrap();
        let handle = event_loop.handle().unwrap();
        (event_loop, handle)
    }

    fn is_nonblocking(stream: &UnixStream) -> bool {
        let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFL) };
        flags & libc::O_NONBLOCK != 0
    }

    #[test]
    fn lifecycle_transitions() {
        let mut event_loop = EventLoop::new();
        assert_eq!(event_loop.state(), LoopState::Uninitialized);
        assert!(matches!(
            event_loop.run(),
            Err(LoopError::InvalidState { actual: "uninitialized", .. })
        ));
        assert!(event_loop.handle().is_err());

        event_loop.init().unwrap();
        assert_eq!(event_loop.state(), LoopState::Ready);
        assert!(event_loop.init().is_err());

        event_loop.done().unwrap();
        assert_eq!(event_loop.state(), LoopState::Done);
        assert!(event_loop.run().is_err());
        assert!(event_loop.done().is_err());

        event_loop.init().unwrap();
        assert_eq!(event_loop.state(), LoopState::Ready);
    }

    #[test]
    fn readable_descriptor_dispatches() {
        let (mut event_loop, handle) = ready_loop();
        let (mut peer, local) = UnixStream::pair().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        handle
            .register(OwnedFd::from(local), WatchFlags::READ, move |h, id, ready| {
                assert!(ready.contains(Ready::READ));
                let buf = h.read(id).unwrap();
                sink.lock().unwrap().extend_from_slice(&buf);
                h.end();
            })
            .unwrap();

        peer.write_all(b"ping").unwrap();
        event_loop.run().unwrap();

        assert_eq!(&*received.lock().unwrap(), b"ping");
        assert_eq!(event_loop.state(), LoopState::Ready);
    }

    #[test]
    fn stop_lets_only_the_inflight_handler_finish() {
        let (mut event_loop, handle) = ready_loop();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut peers = Vec::new();

        for _ in 0..3 {
            let (mut peer, local) = UnixStream::pair().unwrap();
            peer.write_all(b"x").unwrap();
            peers.push(peer);

            let calls = Arc::clone(&calls);
            handle
                .register(OwnedFd::from(local), WatchFlags::READ, move |h, _, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    h.end();
                })
                .unwrap();
        }

        event_loop.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_flag_resets_on_run() {
        let (mut event_loop, handle) = ready_loop();
        handle.end();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        handle
            .set_timeout(Duration::from_millis(1), move |h, _| {
                flag.store(true, Ordering::SeqCst);
                h.end();
                TimerAction::Done
            })
            .unwrap();

        event_loop.run().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn deregistered_watcher_misses() {
        let (_event_loop, handle) = ready_loop();
        let (_peer, local) = UnixStream::pair().unwrap();
        let id = handle
            .register(OwnedFd::from(local), WatchFlags::READ, |_, _, _| {
                panic!("handler must not run after deregistration");
            })
            .unwrap();

        handle.deregister(id).unwrap();
        assert!(!handle.dispatch_one(id, Ready::READ));
        assert!(!handle.registry().contains(id));
        assert!(matches!(
            handle.deregister(id),
            Err(LoopError::UnknownWatcher(missing)) if missing == id
        ));
        assert!(matches!(handle.read(id), Err(LoopError::UnknownWatcher(_))));
    }

    #[test]
    fn deregister_closes_descriptor() {
        let (_event_loop, handle) = ready_loop();
        let (mut peer, local) = UnixStream::pair().unwrap();
        let id = handle
            .register(OwnedFd::from(local), WatchFlags::READ, |_, _, _| {})
            .unwrap();

        handle.deregister(id).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn handler_can_deregister_itself() {
        let (mut event_loop, handle) = ready_loop();
        let (mut peer, local) = UnixStream::pair().unwrap();

        handle
            .register(OwnedFd::from(local), WatchFlags::READ, |h, id, _| {
                h.deregister(id).unwrap();
                h.end();
            })
            .unwrap();

        peer.write_all(b"bye").unwrap();
        event_loop.run().unwrap();
        assert!(handle.registry().is_empty());
    }

    #[test]
    fn registration_sets_nonblocking_unless_blocking() {
        let (_event_loop, handle) = ready_loop();

        let (_a, local) = UnixStream::pair().unwrap();
        let observer = local.try_clone().unwrap();
        handle
            .register(OwnedFd::from(local), WatchFlags::READ, |_, _, _| {})
            .unwrap();
        assert!(is_nonblocking(&observer));

        let (_b, local) = UnixStream::pair().unwrap();
        let observer = local.try_clone().unwrap();
        let id = handle
            .register(
                OwnedFd::from(local),
                WatchFlags::READ | WatchFlags::BLOCKING,
                |_, _, _| {},
            )
            .unwrap();
        assert!(!is_nonblocking(&observer));

        handle.modify(id, WatchFlags::READ | WatchFlags::WRITE).unwrap();
        assert!(is_nonblocking(&observer));
        assert_eq!(
            handle.registry().flags(id),
            Some(WatchFlags::READ | WatchFlags::WRITE)
        );
    }

    #[test]
    fn read_and_write_are_single_calls() {
        let (_event_loop, handle) = ready_loop();
        let (mut peer, local) = UnixStream::pair().unwrap();
        let id = handle
            .register(OwnedFd::from(local), WatchFlags::READ, |_, _, _| {})
            .unwrap();

        assert_eq!(handle.write(id, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let err = handle.read(id).unwrap_err();
        assert!(matches!(err, LoopError::Io(ref e) if e.kind() == std::io::ErrorKind::WouldBlock));

        drop(peer);
        let buf = handle.read(id).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.pool_buffer_size(), 1024);
    }

    #[test]
    fn timers_rearm_and_stop() {
        let (mut event_loop, handle) = ready_loop();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let started = Instant::now();
        handle
            .set_timeout(Duration::from_millis(5), move |h, _| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    h.end();
                    TimerAction::Done
                } else {
                    TimerAction::Rearm(Duration::from_millis(5))
                }
            })
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(handle.pending_timers(), 0);
    }

    #[test]
    fn timers_cancel_each_other() {
        let (mut event_loop, handle) = ready_loop();
        let victim_ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&victim_ran);
        let victim = handle
            .set_timeout(Duration::from_millis(50), move |_, _| {
                flag.store(true, Ordering::SeqCst);
                TimerAction::Done
            })
            .unwrap();
        assert!(handle.timer_remaining(victim).unwrap() <= Duration::from_millis(50));

        handle
            .set_timeout(Duration::from_millis(1), move |h, own| {
                assert!(h.cancel_timer(victim));
                // cancelling itself while running does nothing
                assert!(!h.cancel_timer(own));
                h.end();
                TimerAction::Done
            })
            .unwrap();

        event_loop.run().unwrap();
        assert!(!victim_ran.load(Ordering::SeqCst));
        assert!(matches!(
            handle.timer_remaining(victim),
            Err(LoopError::UnknownTimer(_))
        ));
    }

    #[test]
    fn end_from_another_thread_wakes_the_loop() {
        let (mut event_loop, handle) = ready_loop();
        let remote = handle.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.end();
        });

        event_loop.run().unwrap();
        stopper.join().unwrap();
        assert!(handle.stop_requested());
    }

    #[test]
    fn done_releases_watchers_and_timers() {
        let (mut event_loop, handle) = ready_loop();
        let (mut peer, local) = UnixStream::pair().unwrap();
        handle
            .register(OwnedFd::from(local), WatchFlags::READ, |_, _, _| {})
            .unwrap();
        handle
            .set_timeout(Duration::from_secs(60), |_, _| TimerAction::Done)
            .unwrap();

        event_loop.done().unwrap();
        assert!(handle.registry().is_empty());
        assert_eq!(handle.pending_timers(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);

        let (_a, b) = UnixStream::pair().unwrap();
        assert!(matches!(
            handle.register(OwnedFd::from(b), WatchFlags::READ, |_, _, _| {}),
            Err(LoopError::InvalidState { actual: "done", .. })
        ));
    }

    #[test]
    fn timeout_past_clock_end_stays_pending() {
        let (mut event_loop, handle) = ready_loop();
        let far = handle
            .set_timeout(Duration::MAX, |_, _| panic!("never expires"))
            .unwrap();
        assert_eq!(handle.timer_remaining(far).unwrap(), Duration::MAX);

        handle
            .set_timeout(Duration::from_millis(1), |h, _| {
                h.end();
                TimerAction::Done
            })
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(handle.pending_timers(), 1);
        assert!(handle.cancel_timer(far));
        assert_eq!(handle.pending_timers(), 0);
    }

    #[test]
    fn rearm_past_clock_end_parks_timer() {
        let (mut event_loop, handle) = ready_loop();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let id = handle
            .set_timeout(Duration::from_millis(1), move |h, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                h.end();
                TimerAction::Rearm(Duration::MAX)
            })
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(handle.pending_timers(), 1);
        assert_eq!(handle.timer_remaining(id).unwrap(), Duration::MAX);
    }

    #[test]
    fn done_closes_poller_while_handles_live() {
        let (mut event_loop, handle) = ready_loop();
        let poller = Arc::downgrade(&handle.shared.poller().unwrap());
        assert!(poller.upgrade().is_some());

        event_loop.done().unwrap();
        assert!(poller.upgrade().is_none());
        assert_eq!(handle.state(), LoopState::Done);

        handle.end();
        assert!(matches!(
            handle.set_timeout(Duration::from_millis(1), |_, _| TimerAction::Done),
            Err(LoopError::InvalidState { actual: "done", .. })
        ));
        assert_eq!(handle.pending_timers(), 0);

        event_loop.init().unwrap();
        let fresh = event_loop.handle().unwrap();
        assert_eq!(fresh.state(), LoopState::Ready);
        assert_eq!(handle.state(), LoopState::Done);
    }

    #[test]
    fn handle_observes_running_and_stopping() {
        let (mut event_loop, handle) = ready_loop();
        assert_eq!(handle.state(), LoopState::Ready);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        handle
            .set_timeout(Duration::from_millis(1), move |h, _| {
                let mut log = log.lock().unwrap();
                log.push(h.state());
                h.end();
                log.push(h.state());
                TimerAction::Done
            })
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LoopState::Running, LoopState::Stopping]
        );
        assert_eq!(handle.state(), LoopState::Ready);
    }
}
