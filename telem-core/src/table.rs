//! Connection table: one entry per accepted stream, owning both its poll interest and its
//! framer state. Removal compacts, so later entries shift down by one.

use std::ops::BitOr;
use std::time::Duration;

use crate::framer::Connection;

/// Poll interest / observed readiness bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(1);
    pub const HANGUP: Readiness = Readiness(1 << 1);
    pub const ERROR: Readiness = Readiness(1 << 2);

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// One live connection: stream, requested events, last observed events, framer state.
#[derive(Debug)]
pub struct Entry<S> {
    pub stream: S,
    pub interest: Readiness,
    pub observed: Readiness,
    pub conn: Connection,
}

/// Live connections in registration order.
#[derive(Debug)]
pub struct ConnectionTable<S> {
    entries: Vec<Entry<S>>,
    max_record_size: usize,
    frame_timeout: Option<Duration>,
}

impl<S> ConnectionTable<S> {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_record_size,
            frame_timeout: None,
        }
    }

    /// Frame timeout handed to every connection registered from now on.
    pub fn set_frame_timeout(&mut self, timeout: Option<Duration>) {
        self.frame_timeout = timeout;
    }

    /// Append a connection with read interest. Returns its current index.
    pub fn register(&mut self, stream: S) -> usize {
        self.entries.push(Entry {
            stream,
            interest: Readiness::READABLE,
            observed: Readiness::NONE,
            conn: Connection::new(self.max_record_size).with_frame_timeout(self.frame_timeout),
        });
        self.entries.len() - 1
    }

    /// Remove the entry at `index`, dropping its buffer and closing its stream.
    ///
    /// Entries after `index` move down by one. Panics if `index` is out of range.
    pub fn unregister(&mut self, index: usize) {
        drop(self.entries.remove(index));
    }

    pub fn get(&self, index: usize) -> Option<&Entry<S>> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Entry<S>> {
        self.entries.get_mut(index)
    }

    /// Record what the wait primitive reported for `index`.
    pub fn set_observed(&mut self, index: usize, observed: Readiness) {
        if let Some(e) = self.entries.get_mut(index) {
            e.observed = observed;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<S>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every connection.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
