// src/registry.rs
use crate::error::{Error, Result};
use crate::syscalls::{Event, Interest, Poller};
use std::collections::HashMap;
use std::os::fd::RawFd;
use tracing::trace;

/// Who is behind a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Listening socket of the virtual server at this index.
    Listener(usize),
    /// Accepted client socket; the connection table is keyed by the same fd.
    Client,
    /// Read end of a CGI worker's stdout; the worker table is keyed by the same fd.
    Cgi,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    fd: RawFd,
    interest: Interest,
    owner: Owner,
}

/// The set of descriptors under observation.
///
/// Entries live densely in an arena; `index` maps a descriptor to its slot.
/// Removal swaps the last entry into the hole so both lookup and removal are O(1).
/// Slot numbers never leave this type: callers always speak in descriptors.
pub struct Registry {
    poller: Poller,
    entries: Vec<Entry>,
    index: HashMap<RawFd, usize>,
    events: Vec<Event>,
}

impl Registry {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            poller: Poller::new(capacity)?,
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            events: Vec::with_capacity(capacity),
        })
    }

    /// Start watching `fd`. Re-registering with the same interest and owner is a no-op;
    /// with a different interest it becomes a modification.
    pub fn register(&mut self, fd: RawFd, interest: Interest, owner: Owner) -> Result<()> {
        if let Some(&slot) = self.index.get(&fd) {
            let entry = &mut self.entries[slot];
            if entry.interest == interest && entry.owner == owner {
                return Ok(());
            }
            self.poller
                .modify(fd, interest)
                .map_err(|source| Error::Registry { fd, source })?;
            entry.interest = interest;
            entry.owner = owner;
            return Ok(());
        }

        self.poller
            .add(fd, interest)
            .map_err(|source| Error::Registry { fd, source })?;
        self.index.insert(fd, self.entries.len());
        self.entries.push(Entry { fd, interest, owner });
        trace!(fd, ?owner, "registered");
        Ok(())
    }

    /// Change the interest of an already registered descriptor. Unknown descriptors are ignored.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        match self.index.get(&fd) {
            Some(&slot) => {
                let owner = self.entries[slot].owner;
                self.register(fd, interest, owner)
            }
            None => Ok(()),
        }
    }

    /// Stop watching `fd`. Calling this for a descriptor that is not registered does nothing.
    pub fn unregister(&mut self, fd: RawFd) {
        let Some(slot) = self.index.remove(&fd) else {
            return;
        };
        self.entries.swap_remove(slot);
        if let Some(moved) = self.entries.get(slot) {
            self.index.insert(moved.fd, slot);
        }
        // The descriptor may already be closed, in which case the kernel dropped it for us
        let _ = self.poller.delete(fd);
        trace!(fd, "unregistered");
    }

    pub fn owner(&self, fd: RawFd) -> Option<Owner> {
        self.index.get(&fd).map(|&slot| self.entries[slot].owner)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.index.get(&fd).map(|&slot| self.entries[slot].interest)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.index.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait up to `timeout_ms` for readiness. Interrupted waits yield an empty slice.
    /// Events for descriptors unregistered in the meantime are filtered out.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<&[Event]> {
        self.poller
            .wait(timeout_ms, &mut self.events)
            .map_err(Error::Poll)?;
        let index = &self.index;
        self.events.retain(|ev| index.contains_key(&ev.fd));
        Ok(&self.events)
    }
}
