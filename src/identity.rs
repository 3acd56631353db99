//! Process-unique identities for devices and transports
//!
//! Every device and transport is stamped with a [`Uid`] taken from one
//! counter shared by both kinds. A transport also records the [`Uid`] of its
//! owning device. Both stamps are assign-once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

/// Process-unique identifier of a device or transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(u64);

impl Uid {
    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identity assignment errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The slot already holds an identity
    #[error("Identity already assigned: {current}")]
    AlreadyAssigned {
        /// Identity held by the slot
        current: Uid,
    },
}

/// Monotonically increasing identity source
#[derive(Debug, Default)]
pub struct IdentityCounter {
    next: AtomicU64,
}

impl IdentityCounter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter starting at `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Return the current value, then advance the counter
    pub fn next_identity(&self) -> Uid {
        Uid(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Value the next call to [`next_identity`](Self::next_identity) returns
    pub fn peek(&self) -> Uid {
        Uid(self.next.load(Ordering::SeqCst))
    }
}

/// Assign-once identity slot
#[derive(Debug, Default)]
pub struct IdentityCell(OnceLock<Uid>);

impl IdentityCell {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored identity, if any
    pub fn get(&self) -> Option<Uid> {
        self.0.get().copied()
    }

    /// Whether an identity has been stored
    pub fn is_assigned(&self) -> bool {
        self.0.get().is_some()
    }

    /// Store `uid`. Fails if the slot is already taken.
    pub fn assign(&self, uid: Uid) -> Result<(), IdentityError> {
        self.0.set(uid).map_err(|attempted| IdentityError::AlreadyAssigned {
            current: self.get().unwrap_or(attempted),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_returns_then_increments() {
        let counter = IdentityCounter::starting_at(7);
        assert_eq!(counter.next_identity(), Uid::new(7));
        assert_eq!(counter.next_identity(), Uid::new(8));
        assert_eq!(counter.peek(), Uid::new(9));
    }

    #[test]
    fn test_counter_unique_across_threads() {
        let counter = Arc::new(IdentityCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..250).map(|_| counter.next_identity()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_cell_assign_once() {
        let cell = IdentityCell::new();
        assert!(!cell.is_assigned());
        cell.assign(Uid::new(3)).unwrap();
        assert_eq!(cell.get(), Some(Uid::new(3)));

        let err = cell.assign(Uid::new(4)).unwrap_err();
        assert_eq!(err, IdentityError::AlreadyAssigned { current: Uid::new(3) });
        assert_eq!(cell.get(), Some(Uid::new(3)));
    }
}
