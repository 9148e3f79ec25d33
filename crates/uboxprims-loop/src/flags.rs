use bitflags::bitflags;

bitflags! {
    /// Interest flags given when registering a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFlags: u32 {
        /// Report readability.
        const READ = 1 << 0;
        /// Report writability.
        const WRITE = 1 << 1;
        /// Report transitions only; the handler must drain the descriptor.
        const EDGE_TRIGGER = 1 << 2;
        /// Leave the descriptor in blocking mode.
        const BLOCKING = 1 << 3;
    }
}

bitflags! {
    /// Conditions observed on a descriptor, passed to its handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Ready: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        /// The peer hung up; a read will return end of stream.
        const HANGUP = 1 << 3;
    }
}

impl WatchFlags {
    /// Epoll event mask for these interest flags.
    pub(crate) fn epoll_events(self) -> u32 {
        let mut events = 0;
        if self.contains(Self::READ) {
            events |= libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
        }
        if self.contains(Self::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        if self.contains(Self::EDGE_TRIGGER) {
            events |= libc::EPOLLET as u32;
        }
        events
    }
}

impl Ready {
    pub(crate) fn from_epoll(events: u32) -> Self {
        let mut ready = Self::empty();
        if events & libc::EPOLLIN as u32 != 0 {
            ready |= Self::READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            ready |= Self::WRITE;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            ready |= Self::ERROR;
        }
        if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            ready |= Self::HANGUP;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_maps_to_epoll() {
        let events = (WatchFlags::READ | WatchFlags::EDGE_TRIGGER).epoll_events();
        assert_ne!(events & libc::EPOLLIN as u32, 0);
        assert_ne!(events & libc::EPOLLET as u32, 0);
        assert_eq!(events & libc::EPOLLOUT as u32, 0);

        // blocking mode has no poller counterpart
        assert_eq!(WatchFlags::BLOCKING.epoll_events(), 0);
    }

    #[test]
    fn epoll_maps_to_ready() {
        let ready = Ready::from_epoll(libc::EPOLLIN as u32 | libc::EPOLLHUP as u32);
        assert_eq!(ready, Ready::READ | Ready::HANGUP);
        assert_eq!(
            Ready::from_epoll(libc::EPOLLOUT as u32 | libc::EPOLLERR as u32),
            Ready::WRITE | Ready::ERROR
        );
    }
}
