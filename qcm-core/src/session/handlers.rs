use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Session;
use crate::error::CallError;
use crate::event::Control;
use crate::ops::{Capabilities, RequestOps};
use crate::profile::IpFamily;
use crate::state::ConnectionStatus;

impl Session {
    /// IPv6 follows the IPv4 call instead of having its own.
    fn mirrors_ipv6(&self, caps: Capabilities) -> bool {
        self.profile.enable_ipv4 && !caps.independent_dual_stack
    }

    fn any_enabled_disconnected(&self) -> bool {
        IpFamily::ALL.iter().any(|family| {
            self.profile.is_enabled(*family)
                && self.families.get(*family) == ConnectionStatus::Disconnected
        })
    }

    pub(super) async fn start_attempt(&mut self, ops: &mut dyn RequestOps) {
        if !self.ps_attached && !self.profile.loopback.enabled {
            debug!("Not attached, skipping data call setup");
            return;
        }

        let now = Instant::now();
        if let Some(wait) = self.backoff.remaining(now) {
            debug!("Data call setup held off for {:?}", wait);
            self.retry_at = Some(now + wait);
            return;
        }

        let caps = ops.capabilities();
        for family in IpFamily::ALL {
            if !self.profile.is_enabled(family) || self.families.is_connected(family) {
                continue;
            }
            if family == IpFamily::V6 && self.mirrors_ipv6(caps) {
                self.families.mirror(IpFamily::V4, IpFamily::V6);
                continue;
            }

            self.families.set(family, ConnectionStatus::Connecting);
            let status = match self.connect(ops, family).await {
                Ok(()) => ConnectionStatus::Connected,
                Err(e) => {
                    warn!("{} data call setup failed: {}", family, e);
                    ConnectionStatus::Disconnected
                }
            };
            self.families.set(family, status);
        }

        let now = Instant::now();
        if self.any_enabled_disconnected() {
            let delay = self.backoff.record_failure(now);
            info!(
                "Retrying data call setup in {}s (failure {})",
                delay.as_secs(),
                self.backoff.failures()
            );
            self.retry_at = Some(now + delay);
        } else if self.families.any_connected() {
            self.backoff.reset(now);
            self.post(Control::HealthCheck);
        }
    }

    /// Set up one family's call, with a single retry on the other auth mode
    /// when the network refuses the credentials.
    async fn connect(
        &mut self,
        ops: &mut dyn RequestOps,
        family: IpFamily,
    ) -> Result<(), CallError> {
        match ops.setup_data_call(&self.profile, family).await {
            Ok(()) => {}
            Err(e) if e.is_rejection() && self.profile.apn.has_credentials() => {
                let original = self.profile.apn.auth;
                self.profile.apn.auth = original.toggled();
                info!(
                    "{} setup rejected ({}), retrying with {}",
                    family, e, self.profile.apn.auth
                );
                if let Err(e) = ops.setup_data_call(&self.profile, family).await {
                    self.profile.apn.auth = original;
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        let settings = ops.get_ip_address(&self.profile, family).await?;
        info!("{} settings: {:?}", family, settings);
        self.profile.store_settings(settings);
        Ok(())
    }

    pub(super) async fn health_check(&mut self, ops: &mut dyn RequestOps) {
        match ops.get_signal_info().await {
            Ok(signal) => debug!("Signal: {:?}", signal),
            Err(CallError::NotImplemented) => {}
            Err(e) => debug!("Get signal info failed: {}", e),
        }

        let caps = ops.capabilities();
        for family in IpFamily::ALL {
            if !self.profile.is_enabled(family)
                || self.families.get(family) == ConnectionStatus::Disconnected
            {
                self.families.set(family, ConnectionStatus::Disconnected);
                continue;
            }
            if family == IpFamily::V6 && self.mirrors_ipv6(caps) {
                self.families.mirror(IpFamily::V4, IpFamily::V6);
                continue;
            }

            let status = match ops.query_data_call(family).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("{} data call query failed: {}", family, e);
                    ConnectionStatus::Disconnected
                }
            };
            self.families.set(family, status);
            if status == ConnectionStatus::Connected {
                self.verify_address(ops, family, caps).await;
            }
        }

        self.update_link().await;

        if self.any_enabled_disconnected() {
            self.post(Control::StartAttempt);
        }
    }

    /// Reconcile the cached address of a connected family with the modem.
    async fn verify_address(
        &mut self,
        ops: &mut dyn RequestOps,
        family: IpFamily,
        caps: Capabilities,
    ) {
        if !self.profile.has_address(family) {
            match ops.get_ip_address(&self.profile, family).await {
                Ok(settings) => self.profile.store_settings(settings),
                Err(e) => {
                    warn!("{} is connected but has no address: {}", family, e);
                    self.families.set(family, ConnectionStatus::Disconnected);
                }
            }
            return;
        }

        if !caps.stable_runtime_address {
            return;
        }

        let stale = match ops.get_ip_address(&self.profile, family).await {
            Ok(remote) => {
                let matches = self.profile.address_matches(&remote);
                if !matches {
                    warn!(
                        "{} local settings {:?} differ from modem {:?}",
                        family,
                        self.profile.settings(family),
                        remote
                    );
                }
                !matches
            }
            Err(e) => {
                warn!("{} address re-read failed: {}", family, e);
                true
            }
        };

        if stale {
            if let Err(e) = ops.deactivate_data_call(&self.profile, family).await {
                warn!("{} deactivate failed: {}", family, e);
            }
            self.families.set(family, ConnectionStatus::Disconnected);
        }
    }

    /// Push the aggregate link state to the host if it changed.
    pub(super) async fn update_link(&mut self) {
        let next = self.families.connected_set();
        if !self.link.update(next) {
            return;
        }

        for family in IpFamily::ALL {
            if !next.contains(family) {
                self.profile.clear_settings(family);
            }
        }

        if next.is_empty() {
            info!("Link down");
            self.notifier.link_down().await;
        } else {
            info!("Link up: IPv4 {} IPv6 {}", next.ipv4, next.ipv6);
            self.notifier.link_up(next, &self.profile).await;
        }
    }

    pub(super) async fn registration_changed(&mut self, ops: &mut dyn RequestOps) {
        match ops.get_registration_state().await {
            Ok(attached) => self.ps_attached = attached,
            Err(e) => warn!("Get registration state failed: {}", e),
        }
        info!("PS attached: {}", self.ps_attached);

        if self.ps_attached {
            if self.any_enabled_disconnected() {
                self.post(Control::StartAttempt);
            }
        } else {
            self.backoff.clear_delay(Instant::now());
        }
    }

    pub(super) fn data_call_list_changed(&mut self) {
        if self.families.any_connected() {
            self.backoff.settle(Instant::now(), self.config.settle_delay);
        }
        self.post(Control::HealthCheck);
    }

    pub(super) fn loopback_requested(&mut self, enabled: bool, replication_factor: u32) {
        info!(
            "Loopback config: enabled {} replication factor {}",
            enabled, replication_factor
        );
        self.profile.loopback.enabled = enabled;
        self.profile.loopback.replication_factor = replication_factor;
        if enabled {
            self.post(Control::StartAttempt);
        }
    }

    /// Tear down connected calls, drop the link and release the modem.
    pub(super) async fn stop(&mut self, ops: &mut dyn RequestOps) {
        let caps = ops.capabilities();
        for family in IpFamily::ALL {
            if !self.profile.is_enabled(family) || !self.families.is_connected(family) {
                continue;
            }
            if family == IpFamily::V6 && self.mirrors_ipv6(caps) {
                continue;
            }
            if let Err(e) = ops.deactivate_data_call(&self.profile, family).await {
                warn!("{} deactivate failed: {}", family, e);
            }
        }
        for family in IpFamily::ALL {
            self.families.set(family, ConnectionStatus::Disconnected);
        }
        self.update_link().await;

        if let Err(e) = ops.deinit().await {
            warn!("Modem deinit failed: {}", e);
        }
    }
}
