//! Update and regeneration orchestration
//!
//! Regeneration rebuilds the endpoint's datapath program and proxy redirects
//! from the most recently computed policy. Builds are serialized per endpoint
//! through the build mutex; the main lock is only taken for short sections
//! and never held across an await point.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::state::EndpointState;
use crate::status::{StatusCode, StatusType};

use super::{Endpoint, EndpointInner};
use std::sync::Arc;

/// Mutable endpoint configuration as submitted through the API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndpointConfigurationSpec {
    /// Requested option values. `None` requests a rebuild with the current
    /// configuration.
    #[serde(default)]
    pub options: Option<BTreeMap<String, bool>>,
}

/// Deadlines governing [`Endpoint::update`] and teardown.
#[derive(Clone, Copy, Debug)]
pub struct UpdateTimeouts {
    /// Overall budget for reaching a regenerable state
    pub state_change: Duration,
    /// Budget for proxy redirect changes to settle
    pub proxy_settle: Duration,
}

impl Default for UpdateTimeouts {
    fn default() -> Self {
        Self {
            state_change: Duration::from_secs(25),
            proxy_settle: Duration::from_secs(10),
        }
    }
}

impl Endpoint {
    /// Apply a configuration change and regenerate.
    ///
    /// Validates the requested options, applies them, recomputes policy and,
    /// when the change requires it, launches an asynchronous regeneration.
    /// The call returns as soon as the regeneration is queued; its outcome is
    /// observable through the status log and the policy-revision signals. An
    /// absent option map forces a rebuild with the current configuration.
    /// When the endpoint is mid-regeneration the call waits on state-change
    /// notifications within the configured deadline and fails with a
    /// state-change error once the budget is exhausted.
    #[instrument(skip_all, fields(endpoint = self.id()))]
    pub async fn update(self: &Arc<Self>, cfg: &EndpointConfigurationSpec) -> Result<()> {
        let timeouts = self.timeouts();

        if let Some(requested) = &cfg.options {
            self.option_library().validate(requested)?;
        }

        let needs_regeneration = match self.stage_update(cfg) {
            // An absent option map is an explicit rebuild request.
            Ok(needs) => needs || cfg.options.is_none(),
            Err(err) => {
                // Redirect changes queued before the failure still have to
                // settle before the error is surfaced.
                let _ = self.proxy_wait_group().wait(timeouts.proxy_settle).await;
                return Err(Error::Compilation(err.to_string()));
            }
        };

        if !needs_regeneration {
            self.proxy_wait_group().wait(timeouts.proxy_settle).await?;
            return Ok(());
        }

        let reason = if cfg.options.is_some() {
            "endpoint options updated"
        } else {
            "endpoint was manually regenerated via API"
        };

        // The endpoint may be mid-regeneration; wait on state-change
        // notifications until it accepts the transition or the budget runs
        // out.
        let deadline = tokio::time::Instant::now() + timeouts.state_change;
        loop {
            // Arm the notification before checking to avoid a missed wakeup.
            let notified = self.state_changed.notified();

            // A previous failed build may already have parked the endpoint
            // in the waiting state.
            if self.state() == EndpointState::WaitingToRegenerate
                || self.set_state(EndpointState::WaitingToRegenerate, reason)
            {
                let _ = self.regenerate(reason);
                self.proxy_wait_group().wait(timeouts.proxy_settle).await?;
                return Ok(());
            }
            debug!(
                "endpoint {}: waiting for regenerable state (currently {})",
                self.id(),
                self.state()
            );

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "endpoint {}: timed out waiting for a regenerable state",
                        self.id()
                    );
                    let _ = self.proxy_wait_group().wait(timeouts.proxy_settle).await;
                    return Err(Error::StateChange {
                        id: self.id(),
                        reason: format!(
                            "endpoint stuck in state {} while waiting to regenerate",
                            self.state()
                        ),
                    });
                }
            }
        }
    }

    /// Apply the requested options and recompute policy under one write lock.
    /// Returns whether a datapath regeneration is required.
    fn stage_update(&self, cfg: &EndpointConfigurationSpec) -> Result<bool> {
        let mut inner = self.inner.write();
        if let Some(requested) = &cfg.options {
            let changed = inner.opts.apply(self.option_library(), requested);
            if changed > 0 {
                inner.force_policy_compute = true;
            }
        }
        self.recompute_policy_inner(&mut inner, cfg.options.is_some())
    }

    /// Recompute the policy objects from the engine and stage them on the
    /// endpoint. Returns whether a datapath regeneration is required.
    fn recompute_policy_inner(
        &self,
        inner: &mut EndpointInner,
        options_changed: bool,
    ) -> Result<bool> {
        let computed = self.services().policy_engine.compute_policy(
            self.id(),
            inner.identity.as_ref(),
            options_changed,
        )?;

        inner.consumable = Some(computed.consumable);
        inner.l4_policy = computed.l4_policy;
        inner.cidr_policy = computed.cidr_policy;
        inner.next_policy_revision = inner.next_policy_revision.max(inner.policy_revision + 1);

        let forced = std::mem::take(&mut inner.force_policy_compute);
        Ok(computed.needs_regeneration || forced)
    }

    /// Queue an asynchronous regeneration. The returned receiver reports
    /// whether the build succeeded; dropping it detaches from the build
    /// without cancelling it.
    pub fn regenerate(self: &Arc<Self>, reason: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let ep = Arc::clone(self);
        let reason = reason.to_string();
        tokio::spawn(async move {
            let success = ep.regenerate_inner(&reason).await;
            let _ = tx.send(success);
        });
        rx
    }

    /// Queue a regeneration and wait for its outcome.
    pub async fn regenerate_wait(self: &Arc<Self>, reason: &str) -> Result<()> {
        match self.regenerate(reason).await {
            Ok(true) => Ok(()),
            _ => Err(Error::Compilation(format!(
                "regeneration of endpoint {} failed",
                self.id()
            ))),
        }
    }

    #[instrument(skip_all, fields(endpoint = self.id(), reason))]
    async fn regenerate_inner(self: &Arc<Self>, reason: &str) -> bool {
        let _build = self.build_mutex.lock().await;
        info!("endpoint {}: regenerating: {reason}", self.id());

        let target_revision = {
            let mut inner = self.inner.write();
            if !self.set_state_inner(&mut inner, EndpointState::Regenerating, reason) {
                debug!(
                    "endpoint {}: skipping regeneration, not in a regenerable state ({})",
                    self.id(),
                    inner.state
                );
                return false;
            }
            if let Err(err) = self.recompute_policy_inner(&mut inner, false) {
                drop(inner);
                self.log_status(
                    StatusType::Policy,
                    StatusCode::Failure,
                    format!("policy computation failed: {err}"),
                );
                self.set_state(
                    EndpointState::WaitingToRegenerate,
                    "retrying regeneration after policy failure",
                );
                return false;
            }
            inner.next_policy_revision
        };

        let build = async {
            self.services().datapath.build(self.id(), reason).await?;
            self.sync_realized_redirects()?;
            self.proxy_wait_group()
                .wait(self.timeouts().proxy_settle)
                .await?;
            Ok::<(), Error>(())
        };

        match build.await {
            Ok(()) => {
                {
                    let mut inner = self.inner.write();
                    inner.policy_calculated = true;
                    self.set_policy_revision_inner(&mut inner, target_revision);
                    self.set_state_inner(
                        &mut inner,
                        EndpointState::Ready,
                        "regeneration completed",
                    );
                }
                self.log_status_ok(StatusType::Bpf, "successfully regenerated endpoint program");
                info!(
                    "endpoint {}: regeneration complete at policy revision {target_revision}",
                    self.id()
                );
                true
            }
            Err(err) => {
                warn!("endpoint {}: regeneration failed: {err}", self.id());
                self.log_status(
                    StatusType::Bpf,
                    StatusCode::Failure,
                    format!("regeneration failed: {err}"),
                );
                self.set_state(
                    EndpointState::WaitingToRegenerate,
                    "retrying regeneration after failure",
                );
                false
            }
        }
    }

    /// Reconcile the realized proxy redirects with the L7 rules of the staged
    /// L4 policy. Newly required redirects are installed, stale ones removed;
    /// all changes are registered with the proxy wait group.
    fn sync_realized_redirects(&self) -> Result<()> {
        let desired: Vec<String> = {
            let inner = self.inner.read();
            let mut ids = Vec::new();
            if let Some(l4) = &inner.l4_policy {
                for (direction, filters) in
                    [("ingress", &l4.ingress), ("egress", &l4.egress)]
                {
                    for filter in filters {
                        if let Some(parser) = &filter.l7_parser {
                            ids.push(format!("{direction}:{}:{parser}", filter.port));
                        }
                    }
                }
            }
            ids
        };

        let mut installed = Vec::new();
        for redirect_id in &desired {
            let already = self.inner.read().realized_redirects.contains_key(redirect_id);
            if already {
                continue;
            }
            let proxy_port = self
                .services()
                .proxy
                .add_redirect(redirect_id, self.proxy_wait_group())?;
            debug!(
                "endpoint {}: installed redirect {redirect_id} on proxy port {proxy_port}",
                self.id()
            );
            installed.push((redirect_id.clone(), proxy_port));
        }

        let stale: Vec<(String, u16)> = {
            let mut inner = self.inner.write();
            for (id, port) in installed {
                inner.realized_redirects.insert(id, port);
            }
            let stale = inner
                .realized_redirects
                .iter()
                .filter(|(id, _)| !desired.contains(id))
                .map(|(id, port)| (id.clone(), *port))
                .collect();
            inner
                .realized_redirects
                .retain(|id, _| desired.contains(id));
            stale
        };

        for (redirect_id, proxy_port) in stale {
            debug!(
                "endpoint {}: removing stale redirect {redirect_id}",
                self.id()
            );
            self.services()
                .proxy
                .remove_redirect(&redirect_id, proxy_port, self.proxy_wait_group())?;
        }

        Ok(())
    }
}
