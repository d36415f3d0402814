//! Bounded in-memory ring of recent engine events.
//!
//! Keeps the last N messages for the debug page. Not a substitute for
//! tracing output; purely an operator convenience.

use std::collections::VecDeque;
use std::sync::RwLock;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "util::ring";
const DEFAULT_CAPACITY: usize = 200;

pub struct RingLog {
    entries: RwLock<VecDeque<String>>,
    capacity: usize,
}

impl RingLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Append a timestamped message, evicting the oldest entry when full.
    pub fn push(&self, message: impl AsRef<str>) {
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "-".to_string());
        let mut entries = rw_write(&self.entries, SOURCE, "push");
        entries.push_back(format!("[{stamp}] {}", message.as_ref()));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Snapshot of the current entries, oldest first.
    pub fn entries(&self) -> Vec<String> {
        rw_read(&self.entries, SOURCE, "entries")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RingLog {
    fn default() -> Self {
        Self::new()
    }
}
