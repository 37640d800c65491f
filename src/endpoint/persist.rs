//! Endpoint persistence
//!
//! Endpoints are persisted as a single line embedded in the state directory:
//! a fixed prefix, a format version, a colon, and the base64 encoded JSON
//! serialization. The prefix makes records discoverable in files that carry
//! unrelated content and the version gates format evolution.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::labels::OpLabels;
use crate::option::{BoolOptions, OptionLibrary};
use crate::state::EndpointState;
use crate::status::StatusSnapshot;

use super::{Endpoint, EndpointServices, MacAddr};

/// Marker prefix of a persisted endpoint record.
pub const PERSIST_PREFIX: &str = "MESHPOINT_BASE64_";

/// Persisted record format version.
const PERSIST_VERSION: &str = "1";

/// The serializable snapshot of an endpoint. Runtime-only state (the signal
/// registry, controllers, map handles, the resolved identity reference) is
/// deliberately absent and rebuilt after restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedEndpoint {
    /// Endpoint ID
    pub id: u16,
    /// Host facing interface name
    #[serde(default)]
    pub if_name: String,
    /// Host facing interface index
    #[serde(default)]
    pub if_index: u32,
    /// Endpoint hardware address
    #[serde(default)]
    pub mac: MacAddr,
    /// Node hardware address
    #[serde(default)]
    pub node_mac: MacAddr,
    /// IPv4 address
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    /// Label configuration
    #[serde(default)]
    pub labels: OpLabels,
    /// Endpoint options
    #[serde(default)]
    pub options: BoolOptions,
    /// Lifecycle state at persist time
    pub state: EndpointState,
    /// Applied policy revision at persist time
    #[serde(default)]
    pub policy_revision: u64,
    /// Status log snapshot
    #[serde(default)]
    pub status: StatusSnapshot,
}

impl Endpoint {
    /// Serialize the endpoint into its persisted single-line form.
    pub fn to_persisted_string(&self) -> Result<String> {
        let record = self.to_persisted();
        let json = serde_json::to_vec(&record).map_err(|err| Error::Parse(err.to_string()))?;
        Ok(format!(
            "{PERSIST_PREFIX}{PERSIST_VERSION}:{}",
            BASE64.encode(json)
        ))
    }

    fn to_persisted(&self) -> PersistedEndpoint {
        let inner = self.inner.read();
        PersistedEndpoint {
            id: self.id(),
            if_name: inner.if_name.clone(),
            if_index: inner.if_index,
            mac: inner.mac,
            node_mac: inner.node_mac,
            ipv4: inner.ipv4,
            ipv6: inner.ipv6,
            labels: inner.labels.clone(),
            options: inner.opts.clone(),
            state: inner.state,
            policy_revision: inner.policy_revision,
            status: self.status().to_snapshot(),
        }
    }
}

/// Parse a persisted record back into a live endpoint.
///
/// The record may be embedded anywhere in `input`; everything before the
/// prefix is ignored. The restored endpoint is always placed in the restoring
/// state regardless of the state it was persisted in, since its datapath no
/// longer reflects reality. Identity and policy are re-resolved by the normal
/// lifecycle after restore.
pub fn parse_endpoint(
    input: &str,
    services: EndpointServices,
    option_library: Arc<OptionLibrary>,
    state_dir: impl Into<std::path::PathBuf>,
) -> Result<Arc<Endpoint>> {
    let start = input
        .find(PERSIST_PREFIX)
        .ok_or_else(|| Error::Parse("no endpoint record found".to_string()))?;
    let record = input[start + PERSIST_PREFIX.len()..]
        .split_whitespace()
        .next()
        .unwrap_or_default();
    let (version, payload) = record
        .split_once(':')
        .ok_or_else(|| Error::Parse("malformed endpoint record".to_string()))?;
    if version != PERSIST_VERSION {
        return Err(Error::Parse(format!(
            "unsupported endpoint record version {version}"
        )));
    }

    let json = BASE64
        .decode(payload)
        .map_err(|err| Error::Parse(format!("invalid base64 payload: {err}")))?;
    let record: PersistedEndpoint =
        serde_json::from_slice(&json).map_err(|err| Error::Parse(err.to_string()))?;

    let endpoint = Endpoint::with_state(
        record.id,
        services,
        option_library,
        state_dir,
        EndpointState::Restoring,
    );
    {
        let mut inner = endpoint.inner.write();
        inner.if_name = record.if_name;
        inner.if_index = record.if_index;
        inner.mac = record.mac;
        inner.node_mac = record.node_mac;
        inner.ipv4 = record.ipv4;
        inner.ipv6 = record.ipv6;
        inner.labels = record.labels;
        inner.opts = record.options;
        inner.policy_revision = record.policy_revision;
        inner.next_policy_revision = record.policy_revision;
    }
    endpoint.status().restore(record.status);
    Ok(Arc::new(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::endpoint_test::{test_services, EP_ID};
    use crate::labels::{Label, SOURCE_ORCHESTRATION};
    use crate::status::{StatusCode, StatusType};

    fn sample_endpoint() -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint::new(
            EP_ID,
            test_services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            "/tmp/meshpoint-test",
        ));
        endpoint.set_interface("lxc12345", 42);
        endpoint.set_addressing(Some("10.0.0.2".parse().unwrap()), None);
        endpoint.replace_identity_labels(
            &[Label::new("app", "web", SOURCE_ORCHESTRATION)]
                .into_iter()
                .collect(),
        );
        endpoint
    }

    #[test]
    fn persisted_record_round_trips() {
        let endpoint = sample_endpoint();
        endpoint.log_status(StatusType::Bpf, StatusCode::Warning, "map pressure");

        let line = endpoint.to_persisted_string().unwrap();
        assert!(line.starts_with("MESHPOINT_BASE64_1:"));

        let restored = parse_endpoint(
            &line,
            test_services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            "/tmp/meshpoint-test",
        )
        .unwrap();
        assert_eq!(restored.id(), EP_ID);
        assert_eq!(restored.if_name(), "lxc12345");
        assert_eq!(restored.ipv4(), endpoint.ipv4());
        assert_eq!(restored.state(), EndpointState::Restoring);
        assert_eq!(restored.current_status(), StatusCode::Warning);
        assert!(restored.op_labels().orchestration_identity.contains_key("app"));
    }

    #[test]
    fn record_is_found_mid_stream() {
        let endpoint = sample_endpoint();
        let line = endpoint.to_persisted_string().unwrap();
        let embedded = format!("# state file\nunrelated content {line} trailing");

        let restored = parse_endpoint(
            &embedded,
            test_services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            "/tmp/meshpoint-test",
        )
        .unwrap();
        assert_eq!(restored.id(), EP_ID);
    }

    #[test]
    fn missing_and_malformed_records_are_rejected() {
        let services = test_services;
        let lib = || Arc::new(OptionLibrary::endpoint_defaults(true));
        assert!(parse_endpoint("no record here", services(), lib(), "/tmp").is_err());
        assert!(parse_endpoint("MESHPOINT_BASE64_1:!!!", services(), lib(), "/tmp").is_err());
        assert!(parse_endpoint("MESHPOINT_BASE64_9:aGk=", services(), lib(), "/tmp").is_err());
    }

    #[test]
    fn absent_status_substructures_reinitialize_empty() {
        // Minimal record: only the required fields are present.
        let json = serde_json::json!({ "id": 7, "state": "ready" });
        let payload = BASE64.encode(serde_json::to_vec(&json).unwrap());
        let line = format!("{PERSIST_PREFIX}1:{payload}");

        let restored = parse_endpoint(
            &line,
            test_services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            "/tmp",
        )
        .unwrap();
        assert_eq!(restored.id(), 7);
        assert_eq!(restored.state(), EndpointState::Restoring);
        assert_eq!(restored.current_status(), StatusCode::Ok);
        assert!(restored.status().snapshot_changes().is_empty());
        assert!(restored.op_labels().all_labels().is_empty());
    }

    #[test]
    fn restored_state_is_always_restoring() {
        let endpoint = sample_endpoint();
        assert!(endpoint.set_state(EndpointState::WaitingToRegenerate, "test"));
        let line = endpoint.to_persisted_string().unwrap();
        let restored = parse_endpoint(
            &line,
            test_services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            "/tmp/meshpoint-test",
        )
        .unwrap();
        assert_eq!(restored.state(), EndpointState::Restoring);
    }
}
