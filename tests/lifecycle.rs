//! End-to-end lifecycle tests against the public API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use meshpoint_endpoint::completion::WaitGroup;
use meshpoint_endpoint::endpoint::{
    parse_endpoint, Endpoint, EndpointConfigurationSpec, EndpointServices, Owner, UpdateTimeouts,
};
use meshpoint_endpoint::identity::{IdentityAllocator, NumericIdentity, SecurityIdentity};
use meshpoint_endpoint::labels::{Label, Labels, SOURCE_ORCHESTRATION};
use meshpoint_endpoint::option::OptionLibrary;
use meshpoint_endpoint::policy::{ComputedPolicy, Consumable, DatapathBuilder, PolicyEngine};
use meshpoint_endpoint::proxy::ProxyManager;
use meshpoint_endpoint::{EndpointState, Error, Result, StatusCode};

struct Allocator {
    next: AtomicU64,
}

#[async_trait]
impl IdentityAllocator for Allocator {
    async fn resolve(&self, labels: Labels) -> Result<Arc<SecurityIdentity>> {
        let id = NumericIdentity(self.next.fetch_add(1, Ordering::SeqCst));
        Ok(Arc::new(SecurityIdentity::new(id, labels)))
    }

    fn release(&self, _identity: &SecurityIdentity) -> Result<()> {
        Ok(())
    }
}

struct Engine;

impl PolicyEngine for Engine {
    fn compute_policy(
        &self,
        _endpoint_id: u16,
        identity: Option<&Arc<SecurityIdentity>>,
        _options_changed: bool,
    ) -> Result<ComputedPolicy> {
        Ok(ComputedPolicy {
            consumable: Consumable {
                identity: identity
                    .map(|identity| identity.id)
                    .unwrap_or(NumericIdentity::INVALID),
                allowed_ingress: [NumericIdentity(42)].into_iter().collect(),
            },
            l4_policy: None,
            cidr_policy: None,
            needs_regeneration: true,
        })
    }
}

struct Datapath;

#[async_trait]
impl DatapathBuilder for Datapath {
    async fn build(&self, _endpoint_id: u16, _reason: &str) -> Result<()> {
        Ok(())
    }
}

struct Proxy;

impl ProxyManager for Proxy {
    fn add_redirect(&self, _redirect_id: &str, _wait: &WaitGroup) -> Result<u16> {
        Ok(15001)
    }

    fn remove_redirect(&self, _redirect_id: &str, _proxy_port: u16, _wait: &WaitGroup) -> Result<()> {
        Ok(())
    }
}

struct Manager;

impl Owner for Manager {
    fn remove_from_build_queue(&self, _endpoint_id: u64) {}
    fn remove_network_policy(&self, _endpoint_id: u64) {}
}

fn services() -> EndpointServices {
    EndpointServices {
        identity_allocator: Arc::new(Allocator {
            next: AtomicU64::new(5000),
        }),
        policy_engine: Arc::new(Engine),
        datapath: Arc::new(Datapath),
        proxy: Arc::new(Proxy),
        owner: Arc::new(Manager),
    }
}

fn fast_timeouts() -> UpdateTimeouts {
    UpdateTimeouts {
        state_change: Duration::from_millis(500),
        proxy_settle: Duration::from_millis(100),
    }
}

fn new_endpoint(id: u16, state_dir: &std::path::Path) -> Arc<Endpoint> {
    Arc::new(
        Endpoint::new(
            id,
            services(),
            Arc::new(OptionLibrary::endpoint_defaults(true)),
            state_dir,
        )
        .with_timeouts(fast_timeouts()),
    )
}

fn web_labels() -> Labels {
    [
        Label::new("app", "web", SOURCE_ORCHESTRATION),
        Label::new("tier", "frontend", SOURCE_ORCHESTRATION),
    ]
    .into_iter()
    .collect()
}

async fn wait_for_state(endpoint: &Endpoint, wanted: EndpointState) {
    for _ in 0..200 {
        if endpoint.state() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "endpoint never reached {wanted}, stuck in {}",
        endpoint.state()
    );
}

#[tokio::test]
async fn full_lifecycle_from_labels_to_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = new_endpoint(100, dir.path());
    endpoint.create_directory().unwrap();
    assert_eq!(endpoint.state(), EndpointState::WaitingForIdentity);

    endpoint.update_labels(&web_labels(), &Labels::new());
    wait_for_state(&endpoint, EndpointState::Ready).await;

    assert_ne!(endpoint.numeric_identity(), NumericIdentity::INVALID);
    assert!(endpoint.has_labels(&web_labels()));
    assert!(endpoint.allows(NumericIdentity(42)));
    assert!(endpoint.policy_revision() >= 1);
    assert_eq!(endpoint.current_status(), StatusCode::Ok);

    let errors = endpoint.leave().await;
    assert!(errors.is_empty(), "unexpected teardown errors: {errors:?}");
    assert_eq!(endpoint.state(), EndpointState::Disconnected);
    assert!(!endpoint.directory_path().exists());
}

#[tokio::test]
async fn waiter_is_released_by_a_regeneration() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = new_endpoint(101, dir.path());

    let wait = endpoint.wait_for_policy_revision(1, CancellationToken::new());
    endpoint
        .update(&EndpointConfigurationSpec::default())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), wait.wait())
        .await
        .expect("regeneration reaches revision 1");
}

#[tokio::test]
async fn persisted_endpoint_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = new_endpoint(102, dir.path());
    endpoint.set_interface("lxc0a1b2c", 17);
    endpoint.set_addressing(Some("10.11.12.13".parse().unwrap()), Some("f00d::1".parse().unwrap()));
    endpoint.update_labels(&web_labels(), &Labels::new());
    wait_for_state(&endpoint, EndpointState::Ready).await;

    let record_file = dir.path().join("102_state");
    std::fs::write(&record_file, endpoint.to_persisted_string().unwrap()).unwrap();

    // Simulated restart: read the record back and rebuild the endpoint.
    let contents = std::fs::read_to_string(&record_file).unwrap();
    let restored = parse_endpoint(
        &contents,
        services(),
        Arc::new(OptionLibrary::endpoint_defaults(true)),
        dir.path(),
    )
    .unwrap();

    assert_eq!(restored.id(), 102);
    assert_eq!(restored.state(), EndpointState::Restoring);
    assert_eq!(restored.if_name(), "lxc0a1b2c");
    assert_eq!(restored.ipv4(), endpoint.ipv4());
    assert_eq!(restored.ipv6(), endpoint.ipv6());
    assert!(restored.op_labels().orchestration_identity.contains_key("app"));
    // The identity reference is runtime state and must be re-resolved.
    assert!(restored.identity().is_none());
    assert_eq!(restored.policy_revision(), endpoint.policy_revision());
}

#[tokio::test]
async fn restored_endpoint_reenters_the_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = new_endpoint(103, dir.path());
    endpoint.update_labels(&web_labels(), &Labels::new());
    wait_for_state(&endpoint, EndpointState::Ready).await;

    let record = endpoint.to_persisted_string().unwrap();
    let restored = parse_endpoint(
        &record,
        services(),
        Arc::new(OptionLibrary::endpoint_defaults(true)),
        dir.path(),
    )
    .unwrap();

    // Restore never trusts the persisted identity; resolution runs again.
    restored.regenerate_after_restore();
    wait_for_state(&restored, EndpointState::Ready).await;
    assert!(restored.identity().is_some());
}

#[tokio::test]
async fn disconnecting_endpoint_rejects_updates() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = new_endpoint(104, dir.path());
    assert!(endpoint.set_state(EndpointState::Disconnecting, "tearing down"));

    let err = endpoint
        .update(&EndpointConfigurationSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StateChange { id: 104, .. }));
}
