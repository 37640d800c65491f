//! The Endpoint aggregate root
//!
//! An [`Endpoint`] represents a container or similar workload that is
//! individually addressable on L3. It owns the workload's addressing, its
//! label configuration, its security identity reference, the computed policy
//! objects, and the machinery that keeps them consistent: the lifecycle state
//! machine, the status log, the policy-revision signal registry, and the
//! update/regenerate orchestrator.
//!
//! Locking model: a general read/write lock guards state, labels, identity
//! and revision counters and is never held across an await point; a separate
//! async build mutex is held across a whole regeneration or teardown so at
//! most one build runs per endpoint. The status log and the proxy statistics
//! tracker carry their own locks so high-frequency logging and flow
//! accounting never contend with the main lock.

pub mod addressing;
mod persist;
mod regenerate;


pub use addressing::MacAddr;
pub use persist::{parse_endpoint, PersistedEndpoint, PERSIST_PREFIX};
pub use regenerate::{EndpointConfigurationSpec, UpdateTimeouts};

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::WaitGroup;
use crate::controller::ControllerManager;
use crate::error::{Error, Result};
use crate::identity::{IdentityAllocator, NumericIdentity, SecurityIdentity};
use crate::labels::{Labels, OpLabels};
use crate::option::{BoolOptions, OptionLibrary};
use crate::policy::{CidrPolicy, Consumable, DatapathBuilder, L4Policy, PolicyEngine, PolicyMapHandle};
use crate::proxy::{FlowVerdict, ProxyManager, ProxyStatistics, ProxyStatisticsKey, ProxyStatsTracker, TrafficDirection};
use crate::state::{can_transition, EndpointState};
use crate::status::{EndpointStatus, StatusCode, StatusType};

/// Callbacks into the endpoint's owning manager.
pub trait Owner: Send + Sync {
    /// Remove the endpoint from any external build queue.
    fn remove_from_build_queue(&self, endpoint_id: u64);

    /// Drop any externally held network-policy references for the endpoint.
    fn remove_network_policy(&self, endpoint_id: u64);
}

/// The external collaborators an endpoint is wired to at construction time.
#[derive(Clone)]
pub struct EndpointServices {
    /// Identity service
    pub identity_allocator: Arc<dyn IdentityAllocator>,
    /// Cluster-wide policy computation engine
    pub policy_engine: Arc<dyn PolicyEngine>,
    /// Datapath program builder
    pub datapath: Arc<dyn DatapathBuilder>,
    /// L7 proxy manager
    pub proxy: Arc<dyn ProxyManager>,
    /// Owning manager callbacks
    pub owner: Arc<dyn Owner>,
}

/// A registered policy-revision waiter.
struct PolicySignal {
    wanted_rev: u64,
    tx: oneshot::Sender<()>,
    cancel: CancellationToken,
}

/// Notification handle returned by [`Endpoint::wait_for_policy_revision`].
///
/// Resolves when the target revision is reached, the endpoint disconnects, or
/// the caller's cancellation token fires; cancellation releases the waiter
/// without requiring a revision bump.
pub struct PolicyRevisionWait {
    rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

impl PolicyRevisionWait {
    /// Suspend until the waiter is released.
    pub async fn wait(self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.rx => {}
        }
    }
}

struct EndpointInner {
    if_name: String,
    if_index: u32,
    mac: MacAddr,
    node_mac: MacAddr,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    labels: OpLabels,
    identity_revision: u64,
    identity: Option<Arc<SecurityIdentity>>,
    consumable: Option<Consumable>,
    l4_policy: Option<L4Policy>,
    cidr_policy: Option<CidrPolicy>,
    policy_map: Option<Box<dyn PolicyMapHandle>>,
    opts: BoolOptions,
    state: EndpointState,
    policy_calculated: bool,
    policy_revision: u64,
    next_policy_revision: u64,
    proxy_policy_revision: u64,
    force_policy_compute: bool,
    realized_redirects: BTreeMap<String, u16>,
    signals: Vec<PolicySignal>,
}

/// A per-workload network endpoint. One instance per workload, unique numeric
/// ID in the scope of the node.
pub struct Endpoint {
    id: u16,
    state_dir: PathBuf,
    services: EndpointServices,
    option_library: Arc<OptionLibrary>,
    timeouts: UpdateTimeouts,
    inner: RwLock<EndpointInner>,
    pub(crate) state_changed: tokio::sync::Notify,
    build_mutex: tokio::sync::Mutex<()>,
    status: EndpointStatus,
    proxy_stats: ProxyStatsTracker,
    proxy_wait_group: WaitGroup,
    controllers: ControllerManager,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.inner.read().state)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Create a fresh endpoint: addressing not yet assigned, identity
    /// unresolved, waiting for its first label sync.
    pub fn new(
        id: u16,
        services: EndpointServices,
        option_library: Arc<OptionLibrary>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_state(id, services, option_library, state_dir, EndpointState::WaitingForIdentity)
    }

    /// Create an endpoint in an explicit initial state.
    pub fn with_state(
        id: u16,
        services: EndpointServices,
        option_library: Arc<OptionLibrary>,
        state_dir: impl Into<PathBuf>,
        state: EndpointState,
    ) -> Self {
        Self {
            id,
            state_dir: state_dir.into(),
            services,
            option_library,
            timeouts: UpdateTimeouts::default(),
            inner: RwLock::new(EndpointInner {
                if_name: String::new(),
                if_index: 0,
                mac: MacAddr::default(),
                node_mac: MacAddr::default(),
                ipv4: None,
                ipv6: None,
                labels: OpLabels::default(),
                identity_revision: 0,
                identity: None,
                consumable: None,
                l4_policy: None,
                cidr_policy: None,
                policy_map: None,
                opts: BoolOptions::new(),
                state,
                policy_calculated: false,
                policy_revision: 0,
                next_policy_revision: 0,
                proxy_policy_revision: 0,
                force_policy_compute: false,
                realized_redirects: BTreeMap::new(),
                signals: Vec::new(),
            }),
            state_changed: tokio::sync::Notify::new(),
            build_mutex: tokio::sync::Mutex::new(()),
            status: EndpointStatus::new(),
            proxy_stats: ProxyStatsTracker::new(),
            proxy_wait_group: WaitGroup::new(),
            controllers: ControllerManager::new(),
        }
    }

    /// Override the orchestration deadlines, for callers with tighter API
    /// budgets. Must be called before the endpoint is shared.
    pub fn with_timeouts(mut self, timeouts: UpdateTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The endpoint's numeric ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn timeouts(&self) -> UpdateTimeouts {
        self.timeouts
    }

    pub(crate) fn services(&self) -> &EndpointServices {
        &self.services
    }

    pub(crate) fn option_library(&self) -> &OptionLibrary {
        &self.option_library
    }

    pub(crate) fn proxy_wait_group(&self) -> &WaitGroup {
        &self.proxy_wait_group
    }

    // -------------------------------------------------------------------
    // Addressing
    // -------------------------------------------------------------------

    /// Assign the endpoint's IP addresses.
    pub fn set_addressing(&self, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) {
        let mut inner = self.inner.write();
        inner.ipv4 = ipv4;
        inner.ipv6 = ipv6;
    }

    /// Assign the host-side interface identity.
    pub fn set_interface(&self, name: &str, index: u32) {
        let mut inner = self.inner.write();
        inner.if_name = name.to_string();
        inner.if_index = index;
    }

    /// Assign the endpoint and node hardware addresses.
    pub fn set_macs(&self, mac: MacAddr, node_mac: MacAddr) {
        let mut inner = self.inner.write();
        inner.mac = mac;
        inner.node_mac = node_mac;
    }

    /// The endpoint's IPv4 address, if assigned.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.inner.read().ipv4
    }

    /// The endpoint's IPv6 address, if assigned.
    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.inner.read().ipv6
    }

    /// All valid IPs of the endpoint.
    pub fn ips(&self) -> Vec<IpAddr> {
        let inner = self.inner.read();
        let mut ips = Vec::new();
        if let Some(v4) = inner.ipv4 {
            ips.push(IpAddr::V4(v4));
        }
        if let Some(v6) = inner.ipv6 {
            ips.push(IpAddr::V6(v6));
        }
        ips
    }

    /// Name of the host facing interface.
    pub fn if_name(&self) -> String {
        self.inner.read().if_name.clone()
    }

    // -------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------

    /// The current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.read().state
    }

    /// Attempt the transition to `new`. Checks the transition table, applies
    /// the new state and logs a status entry on success. Returns false and
    /// leaves the state unchanged when the transition is illegal; callers
    /// that require a transition must retry with backoff.
    pub fn set_state(&self, new: EndpointState, reason: &str) -> bool {
        let mut inner = self.inner.write();
        self.set_state_inner(&mut inner, new, reason)
    }

    fn set_state_inner(&self, inner: &mut EndpointInner, new: EndpointState, reason: &str) -> bool {
        let from = inner.state;
        if !can_transition(from, new) {
            debug!(
                "endpoint {}: rejecting state transition {from} -> {new} ({reason})",
                self.id
            );
            return false;
        }
        inner.state = new;
        self.status
            .record(StatusType::State, StatusCode::Ok, reason, new);
        debug!("endpoint {}: state {from} -> {new}: {reason}", self.id);
        self.state_changed.notify_waiters();
        true
    }

    // -------------------------------------------------------------------
    // Status log
    // -------------------------------------------------------------------

    /// Append a status entry for the given category.
    pub fn log_status(&self, status_type: StatusType, code: StatusCode, message: impl Into<String>) {
        let message = message.into();
        let state = self.inner.read().state;
        debug!(
            "endpoint {}: status {status_type}/{code}: {message}",
            self.id
        );
        self.status.record(status_type, code, message, state);
    }

    /// Append an OK status entry for the given category.
    pub fn log_status_ok(&self, status_type: StatusType, message: impl Into<String>) {
        self.log_status(status_type, StatusCode::Ok, message);
    }

    /// The endpoint's status log.
    pub fn status(&self) -> &EndpointStatus {
        &self.status
    }

    /// The worst current status code across categories.
    pub fn current_status(&self) -> StatusCode {
        self.status.current_status()
    }

    // -------------------------------------------------------------------
    // Identity and labels
    // -------------------------------------------------------------------

    /// The resolved security identity, if any.
    pub fn identity(&self) -> Option<Arc<SecurityIdentity>> {
        self.inner.read().identity.clone()
    }

    /// The numeric security identity, or the invalid sentinel while
    /// unresolved.
    pub fn numeric_identity(&self) -> NumericIdentity {
        self.inner
            .read()
            .identity
            .as_ref()
            .map(|identity| identity.id)
            .unwrap_or(NumericIdentity::INVALID)
    }

    /// The identity labels in their canonical representation, empty while the
    /// identity is unresolved.
    pub fn get_labels(&self) -> Vec<String> {
        self.inner
            .read()
            .identity
            .as_ref()
            .map(|identity| identity.labels.to_model())
            .unwrap_or_default()
    }

    /// The SHA256 of the identity labels, empty while unresolved.
    pub fn get_labels_sha(&self) -> String {
        self.inner
            .read()
            .identity
            .as_ref()
            .map(|identity| identity.labels_sha256.clone())
            .unwrap_or_default()
    }

    /// A copy of the endpoint's label configuration.
    pub fn op_labels(&self) -> OpLabels {
        self.inner.read().labels.clone()
    }

    /// Whether the endpoint carries all of `wanted` across its label
    /// categories.
    pub fn has_labels(&self, wanted: &Labels) -> bool {
        self.inner.read().labels.contains_all(wanted)
    }

    /// The revision of the last net identity-label change.
    pub fn identity_revision(&self) -> u64 {
        self.inner.read().identity_revision
    }

    /// Whether API requests may modify this endpoint. Endpoints carrying a
    /// reserved identity label are managed exclusively by the system.
    pub fn api_can_modify(&self) -> Result<()> {
        if self.inner.read().labels.has_reserved_identity_label() {
            return Err(Error::Validation(
                "endpoint may not be modified via API".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge labels into the purely informational category. Never triggers
    /// identity resolution.
    pub fn replace_information_labels(&self, labels: &Labels) {
        let mut inner = self.inner.write();
        for label in labels.iter() {
            debug!("endpoint {}: assigning information label {label}", self.id);
            inner.labels.orchestration_info.insert(label.clone());
        }
    }

    /// Replace the identity-relevant labels with `labels` using mark-and-sweep
    /// reconciliation. Returns the bumped identity revision if a net change
    /// occurred, zero otherwise; repeating the call with the same set yields
    /// zero.
    pub fn replace_identity_labels(&self, labels: &Labels) -> u64 {
        let mut inner = self.inner.write();
        let mut changed = false;

        let mut doomed_identity: Vec<String> = inner
            .labels
            .orchestration_identity
            .iter()
            .map(|l| l.key.clone())
            .collect();
        let mut doomed_disabled: Vec<String> = inner
            .labels
            .disabled
            .iter()
            .map(|l| l.key.clone())
            .collect();

        for label in labels.iter() {
            if inner.labels.disabled.contains_key(&label.key) {
                doomed_disabled.retain(|k| k != &label.key);
            } else if inner.labels.orchestration_identity.contains_key(&label.key) {
                doomed_identity.retain(|k| k != &label.key);
            } else {
                debug!(
                    "endpoint {}: assigning security relevant label {label}",
                    self.id
                );
                inner.labels.orchestration_identity.insert(label.clone());
                changed = true;
            }
        }

        if !doomed_identity.is_empty() || !doomed_disabled.is_empty() {
            changed = true;
        }
        for key in doomed_identity {
            inner.labels.orchestration_identity.remove(&key);
        }
        for key in doomed_disabled {
            inner.labels.disabled.remove(&key);
        }

        if changed {
            inner.identity_revision += 1;
            inner.identity_revision
        } else {
            0
        }
    }

    /// Explicit, validated label edit via the API.
    ///
    /// Every key in `remove` must be tracked in the identity, custom or
    /// disabled category, otherwise the whole operation fails with a
    /// not-found error and nothing is mutated. Removing an identity label
    /// suppresses it (moves it to disabled); removing a custom label deletes
    /// it. Adding a disabled key restores it to the identity category; adding
    /// a new key lands in custom. A successful edit transitions the endpoint
    /// to waiting-for-identity and triggers identity resolution.
    pub fn modify_identity_labels(self: &Arc<Self>, add: &Labels, remove: &Labels) -> Result<u64> {
        let rev = {
            let mut inner = self.inner.write();

            for label in remove.iter() {
                let key = &label.key;
                let tracked = inner.labels.orchestration_identity.contains_key(key)
                    || inner.labels.custom.contains_key(key)
                    || inner.labels.disabled.contains_key(key);
                if !tracked {
                    return Err(Error::NotFound(key.clone()));
                }
            }

            for label in remove.iter() {
                let key = &label.key;
                if let Some(suppressed) = inner.labels.orchestration_identity.remove(key) {
                    inner.labels.disabled.insert(suppressed);
                }
                inner.labels.custom.remove(key);
                // A key that is already disabled stays disabled.
            }

            for label in add.iter() {
                if inner.labels.disabled.remove(&label.key).is_some() {
                    inner.labels.orchestration_identity.insert(label.clone());
                } else if !inner.labels.orchestration_identity.contains_key(&label.key) {
                    inner.labels.custom.insert(label.clone());
                }
            }

            inner.identity_revision += 1;
            let rev = inner.identity_revision;
            self.set_state_inner(
                &mut inner,
                EndpointState::WaitingForIdentity,
                "triggering identity resolution due to updated security labels",
            );
            rev
        };

        self.run_labels_resolver(rev);
        Ok(rev)
    }

    /// Synchronize the endpoint's labels from the orchestration layer. Called
    /// periodically; the labels need not have changed. A net identity-label
    /// change triggers asynchronous identity resolution tagged with the new
    /// revision.
    pub fn update_labels(self: &Arc<Self>, identity_labels: &Labels, info_labels: &Labels) {
        debug!(
            "endpoint {}: refreshing labels (identity: {identity_labels}, info: {info_labels})",
            self.id
        );
        self.replace_information_labels(info_labels);
        let rev = self.replace_identity_labels(identity_labels);
        if rev != 0 {
            self.run_labels_resolver(rev);
        }
    }

    fn identity_label_snapshot(&self) -> Labels {
        self.inner.read().labels.identity_labels()
    }

    /// Spawn (or restart) the identity resolution controller for the given
    /// label revision.
    fn run_labels_resolver(self: &Arc<Self>, rev: u64) {
        let ep = Arc::clone(self);
        let name = format!("resolve-identity-{}", self.id);
        self.controllers.spawn(&name, move |cancel| async move {
            let labels = ep.identity_label_snapshot();
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = ep.services.identity_allocator.resolve(labels) => match result {
                    Ok(identity) => ep.apply_identity_result(rev, identity),
                    Err(err) => {
                        warn!("endpoint {}: identity resolution failed: {err}", ep.id);
                        ep.log_status(
                            StatusType::Other,
                            StatusCode::Failure,
                            format!("identity resolution failed: {err}"),
                        );
                    }
                }
            }
        });
    }

    /// Apply a completed identity resolution tagged with the revision that
    /// triggered it. A result whose tag no longer matches the current
    /// identity revision has been superseded and is discarded
    /// (last-revision-wins).
    pub(crate) fn apply_identity_result(
        self: &Arc<Self>,
        rev: u64,
        identity: Arc<SecurityIdentity>,
    ) {
        let release: Option<Arc<SecurityIdentity>>;
        let mut start_regeneration = false;
        {
            let mut inner = self.inner.write();
            if inner.identity_revision != rev {
                debug!(
                    "endpoint {}: discarding stale identity tagged with revision {rev} (current {})",
                    self.id, inner.identity_revision
                );
                release = Some(identity);
            } else {
                info!(
                    "endpoint {}: assigned security identity {}",
                    self.id, identity.id
                );
                release = inner.identity.replace(Arc::clone(&identity));
                if self.set_state_inner(
                    &mut inner,
                    EndpointState::WaitingToRegenerate,
                    "security identity resolved",
                ) {
                    start_regeneration = true;
                }
            }
        }

        if let Some(stale) = release {
            if let Err(err) = self.services.identity_allocator.release(&stale) {
                warn!(
                    "endpoint {}: unable to release identity {}: {err}",
                    self.id, stale.id
                );
            }
        }
        if start_regeneration {
            let _ = self.regenerate("updated security labels");
        }
    }

    /// Re-resolve the identity of a restored endpoint and drive it back to
    /// readiness. Persisted identity references are never trusted; the
    /// identity is resolved from the restored labels from scratch.
    pub fn regenerate_after_restore(self: &Arc<Self>) {
        let rev = {
            let mut inner = self.inner.write();
            inner.identity_revision += 1;
            inner.identity_revision
        };
        self.run_labels_resolver(rev);
    }

    /// Whether ingress traffic from the given identity is currently allowed.
    pub fn allows(&self, id: NumericIdentity) -> bool {
        self.inner
            .read()
            .consumable
            .as_ref()
            .map(|consumable| consumable.allows_ingress(id))
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------
    // Policy revisions and signals
    // -------------------------------------------------------------------

    /// Whether a policy computation has completed at least once.
    pub fn policy_calculated(&self) -> bool {
        self.inner.read().policy_calculated
    }

    /// The policy revision currently applied.
    pub fn policy_revision(&self) -> u64 {
        self.inner.read().policy_revision
    }

    /// The policy revision acknowledged by the proxy layer.
    pub fn proxy_policy_revision(&self) -> u64 {
        self.inner.read().proxy_policy_revision
    }

    /// Register a waiter for the given policy revision. The returned handle
    /// is pre-released when the revision is already reached or the endpoint
    /// is already disconnected.
    pub fn wait_for_policy_revision(
        &self,
        rev: u64,
        cancel: CancellationToken,
    ) -> PolicyRevisionWait {
        let mut inner = self.inner.write();
        let (tx, rx) = oneshot::channel();
        if inner.policy_revision >= rev || inner.state == EndpointState::Disconnected {
            let _ = tx.send(());
        } else {
            inner.signals.push(PolicySignal {
                wanted_rev: rev,
                tx,
                cancel: cancel.clone(),
            });
        }
        PolicyRevisionWait { rx, cancel }
    }

    /// Record that the given policy revision has been applied, if newer than
    /// the current one, releasing every waiter whose target is reached.
    pub fn bump_policy_revision(&self, rev: u64) {
        let mut inner = self.inner.write();
        if rev > inner.policy_revision {
            self.set_policy_revision_inner(&mut inner, rev);
        }
    }

    fn set_policy_revision_inner(&self, inner: &mut EndpointInner, rev: u64) {
        inner.policy_revision = rev;
        let signals = std::mem::take(&mut inner.signals);
        for signal in signals {
            if signal.cancel.is_cancelled() {
                // The waiter already released itself; drop the sender.
                continue;
            }
            if rev >= signal.wanted_rev {
                let _ = signal.tx.send(());
            } else {
                inner.signals.push(signal);
            }
        }
    }

    fn clean_policy_signals_inner(&self, inner: &mut EndpointInner) {
        for signal in inner.signals.drain(..) {
            let _ = signal.tx.send(());
        }
    }

    /// Number of registered policy-revision waiters.
    pub fn pending_policy_waiters(&self) -> usize {
        self.inner.read().signals.len()
    }

    /// Callback for the proxy layer acknowledging an applied revision.
    pub fn on_proxy_policy_update(&self, rev: u64) {
        let mut inner = self.inner.write();
        if rev > inner.proxy_policy_revision {
            inner.proxy_policy_revision = rev;
        }
    }

    // -------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------

    /// Whether the named option is currently enabled.
    pub fn option_enabled(&self, name: &str) -> bool {
        self.inner.read().opts.is_enabled(name)
    }

    /// Seed values for recognized options that have not been set explicitly.
    /// Unknown names are ignored; explicitly configured options keep their
    /// value.
    pub fn set_default_options(&self, defaults: &BTreeMap<String, bool>) {
        let mut inner = self.inner.write();
        for (name, value) in defaults {
            if self.option_library.lookup(name).is_some() && !inner.opts.is_set(name) {
                inner.opts.set(name, *value);
            }
        }
    }

    // -------------------------------------------------------------------
    // Proxy statistics
    // -------------------------------------------------------------------

    /// Account for one observed L7 flow.
    pub fn update_proxy_statistics(
        &self,
        protocol: &str,
        port: u16,
        direction: TrafficDirection,
        request: bool,
        verdict: FlowVerdict,
    ) {
        self.proxy_stats
            .record_flow(protocol, port, direction, request, verdict);
    }

    /// Snapshot of the per-flow statistics.
    pub fn proxy_statistics(&self) -> Vec<(ProxyStatisticsKey, ProxyStatistics)> {
        self.proxy_stats.snapshot()
    }

    // -------------------------------------------------------------------
    // Datapath resources
    // -------------------------------------------------------------------

    /// Hand the endpoint its kernel policy table handle. The endpoint owns
    /// the handle exclusively and closes it exactly once on teardown.
    pub fn set_policy_map(&self, map: Box<dyn PolicyMapHandle>) {
        self.inner.write().policy_map = Some(map);
    }

    /// Path of the endpoint's on-disk state directory.
    pub fn directory_path(&self) -> PathBuf {
        self.state_dir.join(self.id.to_string())
    }

    /// Create the endpoint's state directory.
    pub fn create_directory(&self) -> Result<()> {
        std::fs::create_dir_all(self.directory_path())?;
        Ok(())
    }

    /// Remove the endpoint's state directory recursively, best effort.
    pub fn remove_directory(&self) {
        if let Err(err) = remove_directory_at(&self.directory_path()) {
            warn!(
                "endpoint {}: unable to remove state directory: {err}",
                self.id
            );
        }
    }

    // -------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------

    /// Tear the endpoint down.
    ///
    /// Releases the identity reference, closes the kernel policy table,
    /// removes realized redirects, cancels background controllers and
    /// outstanding waiters, removes the state directory, and transitions to
    /// the terminal disconnected state. Cleanup is best effort: every step is
    /// attempted and failures are aggregated rather than aborting early. The
    /// endpoint must not be reused afterwards.
    pub async fn leave(&self) -> Vec<Error> {
        let _build = self.build_mutex.lock().await;
        let mut errors = Vec::new();

        self.services.owner.remove_from_build_queue(u64::from(self.id));

        let redirects: Vec<(String, u16)> = {
            let mut inner = self.inner.write();
            self.set_state_inner(
                &mut inner,
                EndpointState::Disconnecting,
                "endpoint is being removed",
            );
            std::mem::take(&mut inner.realized_redirects)
                .into_iter()
                .collect()
        };
        for (redirect_id, proxy_port) in redirects {
            if let Err(err) =
                self.services
                    .proxy
                    .remove_redirect(&redirect_id, proxy_port, &self.proxy_wait_group)
            {
                errors.push(err);
            }
        }
        if let Err(err) = self.proxy_wait_group.wait(self.timeouts.proxy_settle).await {
            errors.push(err);
        }

        let policy_map = self.inner.write().policy_map.take();
        if let Some(mut map) = policy_map {
            if let Err(err) = map.close() {
                errors.push(Error::Map(format!(
                    "unable to close policy map {}: {err}",
                    map.path()
                )));
            }
        }

        let identity = {
            let mut inner = self.inner.write();
            inner.consumable = None;
            inner.l4_policy = None;
            inner.cidr_policy = None;
            inner.identity.take()
        };
        if let Some(identity) = identity {
            if let Err(err) = self.services.identity_allocator.release(&identity) {
                errors.push(err);
            }
            self.services.owner.remove_network_policy(u64::from(self.id));
        }

        if let Err(err) = remove_directory_at(&self.directory_path()) {
            errors.push(err);
        }

        self.controllers.remove_all();

        {
            let mut inner = self.inner.write();
            self.clean_policy_signals_inner(&mut inner);
            self.set_state_inner(&mut inner, EndpointState::Disconnected, "endpoint removed");
        }

        errors
    }
}

fn remove_directory_at(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Resource(err)),
    }
}
