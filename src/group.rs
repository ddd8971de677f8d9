//! Cached group levels, shared between the engine and the bridge.
//!
//! The engine is the only writer; the bridge holds a clone of the `Arc` and
//! reads through [`GroupDb::level`]. Levels are rebuilt from scratch by the
//! resync controller after every connection.

use std::collections::HashMap;
use std::sync::Mutex;

/// Last known level per `(application, group)`, 0..255.
pub struct GroupDb {
    levels: Mutex<HashMap<(u8, u8), u8>>,
}

impl GroupDb {
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
        }
    }

    /// Last known level, or `None` if the group has not been seen.
    pub fn level(&self, application: u8, group: u8) -> Option<u8> {
        self.levels.lock().unwrap().get(&(application, group)).copied()
    }

    /// Record a level. Returns `true` if this changed the stored value
    /// (including the first sighting of a group).
    pub fn set_level(&self, application: u8, group: u8, level: u8) -> bool {
        self.levels
            .lock()
            .unwrap()
            .insert((application, group), level)
            != Some(level)
    }

    /// Number of groups with a known level.
    pub fn known(&self) -> usize {
        self.levels.lock().unwrap().len()
    }

    /// Forget everything (connection loss).
    pub fn clear(&self) {
        self.levels.lock().unwrap().clear();
    }
}

impl Default for GroupDb {
    fn default() -> Self {
        Self::new()
    }
}
