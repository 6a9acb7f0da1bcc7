//! Leadership history recording for checking observed elections.
//!
//! Every snapshot an observer receives is appended with the observer's id.
//! `check` then looks for histories no correct election can produce:
//! - A leader with an older creation revision after a newer one
//! - Two consecutive identical snapshots from one observer
//! - A value update that does not move the leader's mod revision forward
//! - Observers disagreeing on which key holds a creation revision

use crate::types::{KeyValue, Revision};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// One observed leadership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipEntry {
    /// Monotonic index across all observers
    pub index: u64,
    pub observer: u64,
    pub key: String,
    pub value: String,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    /// Nanoseconds since the history was created
    pub time: u64,
}

/// Property broken by a recorded history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    LeaderRegressed {
        observer: u64,
        previous: Revision,
        observed: Revision,
    },
    DuplicateSnapshot {
        observer: u64,
        index: u64,
    },
    StaleValue {
        observer: u64,
        key: String,
        previous: Revision,
        observed: Revision,
    },
    SplitLeadership {
        create_revision: Revision,
        first: String,
        second: String,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::LeaderRegressed {
                observer,
                previous,
                observed,
            } => write!(
                f,
                "observer {} saw leader rev {} after {}",
                observer, observed, previous
            ),
            Violation::DuplicateSnapshot { observer, index } => {
                write!(f, "observer {} got a repeated snapshot at #{}", observer, index)
            }
            Violation::StaleValue {
                observer,
                key,
                previous,
                observed,
            } => write!(
                f,
                "observer {} saw {} at mod rev {} after {}",
                observer, key, observed, previous
            ),
            Violation::SplitLeadership {
                create_revision,
                first,
                second,
            } => write!(
                f,
                "rev {} claimed by both {} and {}",
                create_revision, first, second
            ),
        }
    }
}

/// Shared recorder for leadership snapshots
pub struct LeadershipHistory {
    entries: RwLock<Vec<LeadershipEntry>>,
    /// Next entry index (atomic for lock-free increment)
    next_index: AtomicU64,
    start_time: Instant,
}

impl Default for LeadershipHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipHistory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_index: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Append a snapshot seen by `observer`; returns its index
    pub fn record(&self, observer: u64, kv: &KeyValue) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let entry = LeadershipEntry {
            index,
            observer,
            key: kv.key.clone(),
            value: kv.value_str().into_owned(),
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            time: self.start_time.elapsed().as_nanos() as u64,
        };
        self.entries.write().push(entry);
        index
    }

    pub fn entries(&self) -> Vec<LeadershipEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Distinct leader keys in the order they first appeared
    pub fn leaders(&self) -> Vec<String> {
        let mut leaders: Vec<String> = Vec::new();
        for entry in self.entries.read().iter() {
            if !leaders.contains(&entry.key) {
                leaders.push(entry.key.clone());
            }
        }
        leaders
    }

    pub fn check(&self) -> Vec<Violation> {
        let entries = self.entries.read();
        let mut violations = Vec::new();
        let mut last: HashMap<u64, &LeadershipEntry> = HashMap::new();
        let mut owners: HashMap<Revision, &str> = HashMap::new();

        for entry in entries.iter() {
            if let Some(prev) = last.get(&entry.observer) {
                if entry.create_revision < prev.create_revision {
                    violations.push(Violation::LeaderRegressed {
                        observer: entry.observer,
                        previous: prev.create_revision,
                        observed: entry.create_revision,
                    });
                } else if entry.key == prev.key && entry.value == prev.value {
                    violations.push(Violation::DuplicateSnapshot {
                        observer: entry.observer,
                        index: entry.index,
                    });
                } else if entry.key == prev.key && entry.mod_revision <= prev.mod_revision {
                    violations.push(Violation::StaleValue {
                        observer: entry.observer,
                        key: entry.key.clone(),
                        previous: prev.mod_revision,
                        observed: entry.mod_revision,
                    });
                }
            }
            last.insert(entry.observer, entry);

            match owners.get(&entry.create_revision) {
                Some(owner) if *owner != entry.key => {
                    violations.push(Violation::SplitLeadership {
                        create_revision: entry.create_revision,
                        first: owner.to_string(),
                        second: entry.key.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(entry.create_revision, &entry.key);
                }
            }
        }

        violations
    }

    pub fn export_json(&self) -> String {
        let entries = self.entries.read();
        serde_json::to_string_pretty(&*entries).unwrap_or_else(|_| "[]".to_string())
    }
}
