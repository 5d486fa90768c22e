//! Tracks job identifiers currently queued or in-flight in this process.
//!
//! The acquisition endpoint is only required to deliver at-least-once: if it
//! ever hands back the same id twice while the first delivery is still
//! queued or being handled, this lets the fetcher drop the duplicate instead
//! of dispatching the same job twice.

use std::collections::HashSet;
use std::sync::Mutex;

pub struct InFlightIds {
    ids: Mutex<HashSet<String>>,
}

impl InFlightIds {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
        }
    }

    /// Marks `id` as queued/in-flight. Returns `false` if it was already
    /// tracked, meaning the caller holds a duplicate delivery that must be
    /// dropped rather than queued or dispatched.
    pub fn try_track(&self, id: &str) -> bool {
        self.ids
            .lock()
            .expect("in-flight id set mutex poisoned")
            .insert(id.to_string())
    }

    /// Marks `id` as no longer queued/in-flight, once its terminal result
    /// has been posted (or the job was dropped before ever being queued).
    pub fn release(&self, id: &str) {
        self.ids
            .lock()
            .expect("in-flight id set mutex poisoned")
            .remove(id);
    }
}

impl Default for InFlightIds {
    fn default() -> Self {
        Self::new()
    }
}
