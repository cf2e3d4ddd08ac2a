//! Single-flight flags.

use parking_lot::Mutex;
use std::collections::HashSet;

/// A set of keys with at most one holder each.
///
/// A second caller for a held key gets `None` and is expected to return
/// without doing anything.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    keys: Mutex<HashSet<String>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims `key` until the returned guard drops.
    pub(crate) fn try_acquire(&self, key: &str) -> Option<FlightGuard<'_>> {
        if self.keys.lock().insert(key.to_string()) {
            Some(FlightGuard {
                owner: self,
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub(crate) fn is_held(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub(crate) struct FlightGuard<'a> {
    owner: &'a InFlight,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.keys.lock().remove(&self.key);
    }
}
