use std::collections::HashMap;
use std::ops::BitOr;
use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags};

/// Bitmask of descriptor readiness, used both to register interest and to
/// report which events fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Events(u8);

impl Events {
    pub const READABLE: Events = Events(0b01);
    pub const WRITABLE: Events = Events(0b10);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

/// Per-descriptor readiness callback. Returning `true` tells the loop to
/// drop the registration.
pub type FdCallback = Box<dyn FnMut(RawFd, Events) -> bool>;

/// The readiness-multiplexer seam buffers register with.
///
/// Callbacks must not re-enter the handler; deregistration happens from
/// the owner's drop path, outside dispatch.
pub trait FdHandler {
    fn add_fd(&mut self, fd: RawFd, interest: Events, callback: FdCallback);
    fn remove_fd(&mut self, fd: RawFd);
}

struct Entry {
    interest: Events,
    callback: FdCallback,
}

/// `poll(2)`-backed [`FdHandler`].
///
/// Level-triggered: a registered descriptor with no pending work reports
/// ready and its callback simply declines, so `poll_once` should only be
/// driven while some buffer actually has outstanding I/O.
pub struct PollFdHandler {
    entries: HashMap<RawFd, Entry>,
}

impl PollFdHandler {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Polls all registered descriptors once and dispatches callbacks for
    /// the ready ones. Returns the number of callbacks invoked.
    pub fn poll_once(&mut self, timeout_ms: i32) -> anyhow::Result<usize> {
        if self.entries.is_empty() {
            return Ok(0);
        }

        let fds: Vec<RawFd> = self.entries.keys().copied().collect();
        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, to_poll_flags(self.entries[fd].interest)))
            .collect();

        let ready = poll(&mut pollfds, timeout_ms)?;
        if ready == 0 {
            return Ok(0);
        }

        let mut dispatched = 0;
        for (i, pollfd) in pollfds.iter().enumerate() {
            let revents = match pollfd.revents() {
                Some(r) if !r.is_empty() => r,
                _ => continue,
            };
            let fd = fds[i];

            // Take the entry out for the duration of the call so the map
            // stays consistent if the callback asks to be dropped.
            let mut entry = match self.entries.remove(&fd) {
                Some(e) => e,
                None => continue,
            };
            dispatched += 1;
            let terminate = (entry.callback)(fd, from_poll_flags(revents));
            if !terminate {
                self.entries.insert(fd, entry);
            }
        }
        Ok(dispatched)
    }
}

impl FdHandler for PollFdHandler {
    fn add_fd(&mut self, fd: RawFd, interest: Events, callback: FdCallback) {
        self.entries.insert(fd, Entry { interest, callback });
    }

    fn remove_fd(&mut self, fd: RawFd) {
        self.entries.remove(&fd);
    }
}

impl Default for PollFdHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn to_poll_flags(events: Events) -> PollFlags {
    let mut flags = PollFlags::empty();
    if events.contains(Events::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if events.contains(Events::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn from_poll_flags(flags: PollFlags) -> Events {
    let mut events = Events(0);
    if flags.intersects(PollFlags::POLLIN) {
        events = events | Events::READABLE;
    }
    if flags.intersects(PollFlags::POLLOUT) {
        events = events | Events::WRITABLE;
    }
    // Error and hangup conditions surface as both directions so the
    // callback's next read or write observes the failure directly.
    if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        events = events | Events::READABLE | Events::WRITABLE;
    }
    events
}
