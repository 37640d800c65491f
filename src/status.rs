//! Bounded, priority-aware status history for one endpoint
//!
//! The log is a fixed-capacity circular buffer plus a map of the current
//! entry per status category. The ring write position skips a slot whose
//! entry is still the current non-OK entry for its category, so a failing
//! component's most recent bad status is never evicted by unrelated churn.
//! The log carries its own lock; callers never contend with the endpoint's
//! main lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::state::EndpointState;

/// Capacity of the status ring.
pub const MAX_STATUS_ENTRIES: usize = 256;

/// Status category. Categories are scanned in declaration order when
/// computing the aggregate status; earlier categories take precedence.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum StatusType {
    /// Datapath program state
    Bpf,
    /// Policy computation and application
    Policy,
    /// External resource synchronization
    Sync,
    /// Lifecycle state transitions
    State,
    /// Everything else
    Other,
}

impl StatusType {
    /// All categories, highest priority first.
    pub const ALL: [StatusType; 5] = [
        StatusType::Bpf,
        StatusType::Policy,
        StatusType::Sync,
        StatusType::State,
        StatusType::Other,
    ];
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusType::Bpf => "BPF",
            StatusType::Policy => "Policy",
            StatusType::Sync => "Sync",
            StatusType::State => "State",
            StatusType::Other => "Other",
        };
        write!(f, "{s}")
    }
}

/// Outcome code of a status entry.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum StatusCode {
    /// The component is healthy
    Ok,
    /// Degraded but functional
    Warning,
    /// The component failed
    Failure,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::Warning => "Warning",
            StatusCode::Failure => "Failure",
        };
        write!(f, "{s}")
    }
}

/// A single immutable status record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Outcome code
    pub code: StatusCode,
    /// Free-text message
    pub message: String,
    /// Category the entry belongs to
    pub status_type: StatusType,
    /// Lifecycle state at the time of logging
    pub state: EndpointState,
}

/// A status record with its timestamp, as stored in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    /// The recorded status
    pub status: Status,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// One row of the ordered status history, for display and debugging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// RFC3339 timestamp of the entry
    pub timestamp: String,
    /// Outcome code
    pub code: StatusCode,
    /// Free-text message
    pub message: String,
    /// Lifecycle state at the time of logging
    pub state: EndpointState,
}

/// Plain serializable form of the log, used by the persisted endpoint record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current entry per category
    #[serde(default)]
    pub current: BTreeMap<StatusType, StatusLogEntry>,
    /// Ring contents in slot order
    #[serde(default)]
    pub log: Vec<StatusLogEntry>,
    /// Next ring write position
    #[serde(default)]
    pub index: usize,
}

#[derive(Debug)]
struct StatusInner {
    current: BTreeMap<StatusType, Arc<StatusLogEntry>>,
    log: Vec<Arc<StatusLogEntry>>,
    index: usize,
    capacity: usize,
}

impl StatusInner {
    /// Returns the slot to write and advances the write position, skipping a
    /// slot whose entry is still the current non-OK entry for its category.
    fn advance_index(&mut self) -> usize {
        let slot = self.index;
        self.index = (self.index + 1) % self.capacity;
        if self.index < self.log.len() {
            let candidate = &self.log[self.index];
            let still_current = self
                .current
                .get(&candidate.status.status_type)
                .map(|current| Arc::ptr_eq(current, candidate))
                .unwrap_or(false);
            if still_current && candidate.status.code != StatusCode::Ok {
                self.index = (self.index + 1) % self.capacity;
            }
        }
        slot
    }

    fn add(&mut self, entry: Arc<StatusLogEntry>) {
        self.current
            .insert(entry.status.status_type, Arc::clone(&entry));
        let slot = self.advance_index();
        if self.log.len() < self.capacity {
            self.log.push(entry);
        } else {
            self.log[slot] = entry;
        }
    }
}

/// The status log of one endpoint.
#[derive(Debug)]
pub struct EndpointStatus {
    inner: RwLock<StatusInner>,
}

impl Default for EndpointStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointStatus {
    /// Create an empty log with the standard capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_STATUS_ENTRIES)
    }

    /// Create an empty log with the given ring capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2, "status ring needs at least two slots");
        Self {
            inner: RwLock::new(StatusInner {
                current: BTreeMap::new(),
                log: Vec::new(),
                index: 0,
                capacity,
            }),
        }
    }

    /// Append an entry for the given category.
    pub fn record(
        &self,
        status_type: StatusType,
        code: StatusCode,
        message: impl Into<String>,
        state: EndpointState,
    ) {
        let entry = Arc::new(StatusLogEntry {
            status: Status {
                code,
                message: message.into(),
                status_type,
                state,
            },
            timestamp: Utc::now(),
        });
        self.inner.write().add(entry);
    }

    /// The worst aggregate status: the first non-OK current entry scanning
    /// categories in priority order, or OK if every category is healthy.
    pub fn current_status(&self) -> StatusCode {
        let inner = self.inner.read();
        for status_type in StatusType::ALL {
            if let Some(entry) = inner.current.get(&status_type) {
                if entry.status.code != StatusCode::Ok {
                    return entry.status.code;
                }
            }
        }
        StatusCode::Ok
    }

    /// The current entry for a single category, if any was ever logged.
    pub fn current_for(&self, status_type: StatusType) -> Option<StatusLogEntry> {
        self.inner
            .read()
            .current
            .get(&status_type)
            .map(|entry| (**entry).clone())
    }

    /// Ordered history, newest first, wrapping correctly across the circular
    /// boundary.
    pub fn snapshot_changes(&self) -> Vec<StatusChange> {
        let inner = self.inner.read();
        let mut list = Vec::new();
        if inner.log.is_empty() {
            return list;
        }
        let mut i = if inner.index == 0 {
            inner.capacity - 1
        } else {
            inner.index - 1
        };
        loop {
            if i < inner.log.len() {
                let entry = &inner.log[i];
                list.push(StatusChange {
                    timestamp: entry.timestamp.to_rfc3339(),
                    code: entry.status.code,
                    message: entry.status.message.clone(),
                    state: entry.status.state,
                });
            }
            if i == inner.index {
                break;
            }
            i = if i == 0 { inner.capacity - 1 } else { i - 1 };
        }
        list
    }

    /// Export the log for persistence.
    pub fn to_snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            current: inner
                .current
                .iter()
                .map(|(ty, entry)| (*ty, (**entry).clone()))
                .collect(),
            log: inner.log.iter().map(|entry| (**entry).clone()).collect(),
            index: inner.index,
        }
    }

    /// Replace the log contents from a persisted snapshot.
    pub fn restore(&self, snapshot: StatusSnapshot) {
        *self.inner.write() = Self::from_snapshot(Some(snapshot)).inner.into_inner();
    }

    /// Rebuild a log from a persisted snapshot. A missing snapshot yields an
    /// empty log. Current entries are re-linked to their ring slots so the
    /// overwrite-skip behavior survives a restore.
    pub fn from_snapshot(snapshot: Option<StatusSnapshot>) -> Self {
        let snapshot = snapshot.unwrap_or_default();
        let log: Vec<Arc<StatusLogEntry>> =
            snapshot.log.into_iter().map(Arc::new).collect();
        let mut current = BTreeMap::new();
        for (status_type, entry) in snapshot.current {
            let linked = log
                .iter()
                .find(|candidate| ***candidate == entry)
                .cloned()
                .unwrap_or_else(|| Arc::new(entry));
            current.insert(status_type, linked);
        }
        let capacity = MAX_STATUS_ENTRIES.max(log.len());
        let index = snapshot.index % capacity;
        Self {
            inner: RwLock::new(StatusInner {
                current,
                log,
                index,
                capacity,
            }),
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.current_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: EndpointState = EndpointState::Ready;

    fn log_with_capacity(capacity: usize) -> EndpointStatus {
        EndpointStatus::with_capacity(capacity)
    }

    #[test]
    fn current_status_tracks_worst_per_priority() {
        let status = EndpointStatus::new();
        assert_eq!(status.current_status(), StatusCode::Ok);

        status.record(StatusType::Policy, StatusCode::Failure, "compile error", STATE);
        assert_eq!(status.current_status(), StatusCode::Failure);

        status.record(StatusType::Other, StatusCode::Warning, "sync slow", STATE);
        // Policy outranks Other in the category scan.
        assert_eq!(status.current_status(), StatusCode::Failure);

        status.record(StatusType::Policy, StatusCode::Ok, "recovered", STATE);
        assert_eq!(status.current_status(), StatusCode::Warning);
    }

    #[test]
    fn ring_skips_still_current_failure_entry() {
        // Capacity 3, sequence [BPF/OK, Policy/Failure, BPF/OK]; a fourth
        // BPF/OK wraps the ring but must not evict the Policy failure.
        let status = log_with_capacity(3);
        status.record(StatusType::Bpf, StatusCode::Ok, "built", STATE);
        status.record(StatusType::Policy, StatusCode::Failure, "denied", STATE);
        status.record(StatusType::Bpf, StatusCode::Ok, "rebuilt", STATE);

        status.record(StatusType::Bpf, StatusCode::Ok, "rebuilt again", STATE);

        let policy = status.current_for(StatusType::Policy).unwrap();
        assert_eq!(policy.status.code, StatusCode::Failure);
        assert_eq!(policy.status.message, "denied");
        assert_eq!(status.current_status(), StatusCode::Failure);
    }

    #[test]
    fn failure_survives_heavy_unrelated_churn() {
        let status = log_with_capacity(4);
        status.record(StatusType::Policy, StatusCode::Failure, "bad rule", STATE);
        for i in 0..50 {
            status.record(StatusType::Bpf, StatusCode::Ok, format!("build {i}"), STATE);
        }
        assert_eq!(status.current_status(), StatusCode::Failure);
        let policy = status.current_for(StatusType::Policy).unwrap();
        assert_eq!(policy.status.message, "bad rule");
    }

    #[test]
    fn newer_same_category_entry_replaces_current() {
        let status = log_with_capacity(3);
        status.record(StatusType::Policy, StatusCode::Failure, "bad rule", STATE);
        status.record(StatusType::Policy, StatusCode::Ok, "fixed", STATE);
        assert_eq!(status.current_status(), StatusCode::Ok);
    }

    #[test]
    fn snapshot_is_newest_first_and_wraps() {
        let status = log_with_capacity(3);
        for i in 0..5 {
            status.record(StatusType::Other, StatusCode::Ok, format!("event {i}"), STATE);
        }
        let changes = status.snapshot_changes();
        assert!(!changes.is_empty());
        assert_eq!(changes[0].message, "event 4");
        // All retained entries are in reverse chronological order.
        for pair in changes.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn snapshot_roundtrip_restores_skip_behavior() {
        let status = log_with_capacity(3);
        status.record(StatusType::Bpf, StatusCode::Ok, "built", STATE);
        status.record(StatusType::Policy, StatusCode::Failure, "denied", STATE);
        status.record(StatusType::Bpf, StatusCode::Ok, "rebuilt", STATE);

        let snapshot = status.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: StatusSnapshot = serde_json::from_str(&json).unwrap();
        let restored = EndpointStatus::from_snapshot(Some(decoded));

        assert_eq!(restored.current_status(), StatusCode::Failure);
        let policy = restored.current_for(StatusType::Policy).unwrap();
        assert_eq!(policy.status.message, "denied");
    }

    #[test]
    fn missing_snapshot_yields_empty_log() {
        let restored = EndpointStatus::from_snapshot(None);
        assert_eq!(restored.current_status(), StatusCode::Ok);
        assert!(restored.snapshot_changes().is_empty());
    }
}
