//! Documents as seen by the driver.

use std::sync::{Arc, Mutex, MutexGuard};

use odfsync_engine::textops::TextDocument;
use odfsync_engine::{PlaybackError, Playback};

/// Serializes the live document for upload when a session closes.
pub trait SnapshotSource {
    fn snapshot(&self) -> Vec<u8>;
}

impl SnapshotSource for TextDocument {
    fn snapshot(&self) -> Vec<u8> {
        self.to_bytes()
    }
}

/// A document shared between the driver and the application.
///
/// The driver plays operations into it while the application reads it
/// through [`read`](Self::read).
#[derive(Debug, Default)]
pub struct SharedDocument<D> {
    inner: Arc<Mutex<D>>,
}

impl<D> Clone for SharedDocument<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> SharedDocument<D> {
    pub fn new(document: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(document)),
        }
    }

    /// Run `f` on the current document.
    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, D> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<O, D: Playback<O>> Playback<O> for SharedDocument<D> {
    fn play(&mut self, op: &O) -> Result<(), PlaybackError> {
        self.lock().play(op)
    }
}

impl<D: SnapshotSource> SnapshotSource for SharedDocument<D> {
    fn snapshot(&self) -> Vec<u8> {
        self.lock().snapshot()
    }
}
