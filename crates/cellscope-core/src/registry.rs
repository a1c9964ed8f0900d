//! The process-wide slot holding the active model-pair.
//!
//! Parsing happens before the lock is taken and decoding after it is
//! released; the mutex covers only the pointer swap. Snapshots are
//! reference-counted immutable values, so a replacement never mutates a
//! model a decode is reading; workers and inline decodes each hold some
//! past snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::ModelPair;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    slot: Mutex<Option<Arc<ModelPair>>>,
    loaded: AtomicBool,
}

impl Registry {
    /// Install a parsed model-pair, dropping any previous one. Returns the
    /// snapshot for broadcast to workers.
    pub(crate) fn install(&self, pair: ModelPair) -> Arc<ModelPair> {
        let snapshot = Arc::new(pair);
        let mut slot = self.slot.lock().unwrap();
        let had_previous = slot.replace(Arc::clone(&snapshot)).is_some();
        self.loaded.store(true, Ordering::Release);
        drop(slot);
        if had_previous {
            log::info!("replaced the previously installed traffic model");
        }
        snapshot
    }

    /// Remove the installed model-pair, if any.
    pub(crate) fn clear(&self) {
        let mut slot = self.slot.lock().unwrap();
        self.loaded.store(false, Ordering::Release);
        if slot.take().is_some() {
            log::info!("cleared the installed traffic model");
        }
    }

    /// Fast lock-free check used by the accumulator entry points.
    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Current snapshot, if a model is installed.
    pub(crate) fn snapshot(&self) -> Option<Arc<ModelPair>> {
        self.slot.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let reg = Registry::default();
        assert!(!reg.is_loaded());
        assert!(reg.snapshot().is_none());
    }

    #[test]
    fn install_replaces_and_clear_empties() {
        let reg = Registry::default();
        let first = reg.install(ModelPair::default());
        assert!(reg.is_loaded());
        let second = reg.install(ModelPair::default());
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&reg.snapshot().expect("loaded"), &second));

        reg.clear();
        assert!(!reg.is_loaded());
        assert!(reg.snapshot().is_none());

        // A second clear is a no-op.
        reg.clear();
        assert!(!reg.is_loaded());
    }

    #[test]
    fn snapshots_outlive_replacement() {
        let reg = Registry::default();
        let old = reg.install(ModelPair::default());
        reg.install(ModelPair::default());
        // The old snapshot is still intact for any decode holding it.
        assert!(old.is_empty());
    }
}
