//! Watcher registry: opaque ids mapped to owned descriptors and handlers.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{LoopError, Result};
use crate::flags::{Ready, WatchFlags};
use crate::reactor::LoopHandle;

/// Opaque identifier of a registered descriptor.
///
/// Ids are issued by the registry and never reused within one loop, so a
/// stale id can only miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_token(token: u64) -> Self {
        Self(token)
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback invoked on the loop thread when a descriptor becomes ready.
pub type Handler = Box<dyn FnMut(&LoopHandle, WatcherId, Ready) + Send>;

pub(crate) type SharedHandler = Arc<Mutex<Handler>>;

pub(crate) struct Entry {
    pub(crate) fd: Arc<OwnedFd>,
    pub(crate) flags: WatchFlags,
    pub(crate) handler: SharedHandler,
}

impl Entry {
    pub(crate) fn new(fd: OwnedFd, flags: WatchFlags, handler: Handler) -> Self {
        Self {
            fd: Arc::new(fd),
            flags,
            handler: Arc::new(Mutex::new(handler)),
        }
    }
}

/// Map of live watchers, shared between the loop thread and its handles.
///
/// Lookups take the read lock and clone what they need out of it, so
/// handlers run with no lock held and may register or deregister freely.
pub struct Registry {
    entries: RwLock<HashMap<WatcherId, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            // token 0 belongs to the poller's waker
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> WatcherId {
        WatcherId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, id: WatcherId, entry: Entry) -> Result<()> {
        let mut entries = self.write();
        if entries.contains_key(&id) {
            return Err(LoopError::AlreadyRegistered(id));
        }
        entries.insert(id, entry);
        Ok(())
    }

    pub(crate) fn remove(&self, id: WatcherId) -> Option<Entry> {
        self.write().remove(&id)
    }

    pub(crate) fn handler(&self, id: WatcherId) -> Option<SharedHandler> {
        self.read().get(&id).map(|entry| Arc::clone(&entry.handler))
    }

    pub(crate) fn descriptor(&self, id: WatcherId) -> Option<Arc<OwnedFd>> {
        self.read().get(&id).map(|entry| Arc::clone(&entry.fd))
    }

    /// Replace the interest flags, returning the previous ones.
    pub(crate) fn set_flags(&self, id: WatcherId, flags: WatchFlags) -> Option<WatchFlags> {
        self.write()
            .get_mut(&id)
            .map(|entry| std::mem::replace(&mut entry.flags, flags))
    }

    pub(crate) fn drain(&self) -> Vec<(WatcherId, Entry)> {
        self.write().drain().collect()
    }

    /// Interest flags of a live watcher.
    pub fn flags(&self, id: WatcherId) -> Option<WatchFlags> {
        self.read().get(&id).map(|entry| entry.flags)
    }

    pub fn contains(&self, id: WatcherId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WatcherId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WatcherId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("watchers", &self.len())
            .finish()
    }
}
