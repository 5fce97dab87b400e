//! Per-volume-name in-flight request guard.
//!
//! At most one CreateVolume may be in flight for a given name. The entry is
//! removed when the guard drops, success or failure, so a serialized retry
//! always proceeds.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ControllerError, Result};

/// Concurrent store of volume names with a provisioning call in flight,
/// keyed to the requested size in bytes.
#[derive(Default)]
pub struct PendingRequests {
    inflight: DashMap<String, u64>,
}

/// Removes its entry on drop.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    map: &'a DashMap<String, u64>,
    name: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.name);
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request for `name`, rejecting a second in-flight request:
    /// same size means the original is still running, a different size is a
    /// conflicting request. Both are retry-later conditions.
    pub fn try_begin(&self, name: &str, size_bytes: u64) -> Result<PendingGuard<'_>> {
        match self.inflight.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if *entry.get() == size_bytes {
                    Err(ControllerError::Aborted(format!(
                        "volume creation already in process: {name}"
                    )))
                } else {
                    Err(ControllerError::Aborted(format!(
                        "volume {name} present in pending requests but requested size {size_bytes} \
                         does not match in-flight size {}",
                        entry.get()
                    )))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(size_bytes);
                Ok(PendingGuard {
                    map: &self.inflight,
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.inflight.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removed_on_drop() {
        let pending = PendingRequests::new();
        {
            let _guard = pending.try_begin("pvc-1", 1024).unwrap();
            assert!(pending.is_pending("pvc-1"));
        }
        assert!(!pending.is_pending("pvc-1"));
    }

    #[test]
    fn test_same_size_rejected_as_in_progress() {
        let pending = PendingRequests::new();
        let _guard = pending.try_begin("pvc-1", 1024).unwrap();

        let err = pending.try_begin("pvc-1", 1024).unwrap_err();
        assert!(matches!(err, ControllerError::Aborted(_)));
        assert!(err.to_string().contains("already in process"));
    }

    #[test]
    fn test_different_size_rejected_as_conflict() {
        let pending = PendingRequests::new();
        let _guard = pending.try_begin("pvc-1", 1024).unwrap();

        let err = pending.try_begin("pvc-1", 2048).unwrap_err();
        assert!(matches!(err, ControllerError::Aborted(_)));
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_rejection_does_not_clear_existing_entry() {
        let pending = PendingRequests::new();
        let guard = pending.try_begin("pvc-1", 1024).unwrap();

        let _ = pending.try_begin("pvc-1", 2048).unwrap_err();
        assert!(pending.is_pending("pvc-1"));

        drop(guard);
        assert!(!pending.is_pending("pvc-1"));

        // A serialized retry proceeds.
        let _guard = pending.try_begin("pvc-1", 2048).unwrap();
    }

    #[test]
    fn test_distinct_names_do_not_interfere() {
        let pending = PendingRequests::new();
        let _a = pending.try_begin("pvc-1", 1024).unwrap();
        let _b = pending.try_begin("pvc-2", 1024).unwrap();
        assert!(pending.is_pending("pvc-1"));
        assert!(pending.is_pending("pvc-2"));
    }
}
