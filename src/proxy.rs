//! Proxy manager boundary and per-flow statistics
//!
//! The L7 proxy reports a verdict for every observed flow. Accounting runs at
//! flow-observation frequency, so the statistics map carries its own lock and
//! never touches the endpoint's main lock.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::completion::WaitGroup;
use crate::error::Result;

/// Direction of an observed flow relative to the endpoint.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    /// Traffic entering the endpoint
    Ingress,
    /// Traffic leaving the endpoint
    Egress,
}

/// Verdict the proxy applied to a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowVerdict {
    /// The flow was forwarded
    Forwarded,
    /// The flow was denied by policy
    Denied,
    /// The proxy failed to process the flow
    Error,
}

/// Key identifying one statistics record.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProxyStatisticsKey {
    /// L7 protocol name ("http", "kafka")
    pub protocol: String,
    /// Destination port
    pub port: u16,
    /// Flow direction
    pub direction: TrafficDirection,
}

/// Counters for one message direction (requests or responses).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageForwardingStatistics {
    /// Messages observed
    pub received: u64,
    /// Messages forwarded
    pub forwarded: u64,
    /// Messages denied by policy
    pub denied: u64,
    /// Messages that hit a proxy error
    pub error: u64,
}

impl MessageForwardingStatistics {
    fn account(&mut self, verdict: FlowVerdict) {
        self.received += 1;
        match verdict {
            FlowVerdict::Forwarded => self.forwarded += 1,
            FlowVerdict::Denied => self.denied += 1,
            FlowVerdict::Error => self.error += 1,
        }
    }
}

/// Statistics for one (protocol, port, direction) redirect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatistics {
    /// Proxy port allocated for the redirect, zero if unknown
    pub allocated_proxy_port: u16,
    /// Request direction counters
    pub requests: MessageForwardingStatistics,
    /// Response direction counters
    pub responses: MessageForwardingStatistics,
}

/// Per-flow statistics tracker, independently locked.
#[derive(Debug, Default)]
pub struct ProxyStatsTracker {
    stats: Mutex<BTreeMap<ProxyStatisticsKey, ProxyStatistics>>,
}

impl ProxyStatsTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one observed flow. A counter record is created lazily on
    /// the first observation for its key.
    pub fn record_flow(
        &self,
        protocol: &str,
        port: u16,
        direction: TrafficDirection,
        request: bool,
        verdict: FlowVerdict,
    ) {
        let key = ProxyStatisticsKey {
            protocol: protocol.to_string(),
            port,
            direction,
        };
        let mut stats = self.stats.lock();
        let record = stats.entry(key).or_default();
        if request {
            record.requests.account(verdict);
        } else {
            record.responses.account(verdict);
        }
    }

    /// Snapshot of every counter record.
    pub fn snapshot(&self) -> Vec<(ProxyStatisticsKey, ProxyStatistics)> {
        self.stats
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The proxy manager collaborator. Redirect changes are applied
/// asynchronously; the implementation registers each queued change with the
/// supplied wait group so callers can wait for convergence.
pub trait ProxyManager: Send + Sync {
    /// Install a redirect, returning the allocated proxy port.
    fn add_redirect(&self, redirect_id: &str, wait: &WaitGroup) -> Result<u16>;

    /// Remove a previously realized redirect.
    fn remove_redirect(&self, redirect_id: &str, proxy_port: u16, wait: &WaitGroup) -> Result<()>;
}
