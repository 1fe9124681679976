use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{Attempt, Session};
use crate::apn::home_network;
use crate::error::{CallError, SessionError};
use crate::event::{Control, Event};
use crate::ops::{RequestOps, SimStatus};

/// Log a failed best-effort call. Operations the variant does not offer are
/// not worth a warning.
fn best_effort<T>(what: &str, result: Result<T, CallError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(CallError::NotImplemented) => {
            debug!("{}: not offered by this modem protocol", what);
            None
        }
        Err(e) => {
            warn!("{} failed: {}", what, e);
            None
        }
    }
}

impl Session {
    /// Initializing: everything between opening the device and the first
    /// health check. Returns false if Stop arrived meanwhile.
    pub(super) async fn bring_up(&mut self, attempt: &mut Attempt) -> Result<bool, SessionError> {
        self.wait_connected(attempt).await?;

        let ops = attempt.ops.as_mut();
        ops.init(&self.profile)
            .await
            .map_err(SessionError::InitFailed)?;

        if let Some(imei) = best_effort("Get IMEI", ops.get_imei().await) {
            info!("IMEI: {}", imei);
            self.profile.identity.imei = Some(imei);
        }
        if let Some(version) = best_effort("Get baseband version", ops.get_baseband_version().await)
        {
            info!("Baseband version: {}", version);
            self.profile.identity.baseband_version = Some(version);
        }
        best_effort("Set data format", ops.set_ethernet_mode(&self.profile).await);

        if self.profile.loopback.enabled {
            info!(
                "Requesting loopback test mode, replication factor {}",
                self.profile.loopback.replication_factor
            );
            best_effort(
                "Set loopback state",
                ops.set_loopback_state(self.profile.loopback).await,
            );
            self.profile.loopback.enabled = false;
        }

        let sim = match self.poll_sim(ops).await {
            Some(sim) => sim,
            None => return Ok(false),
        };
        info!("SIM status: {}", sim);

        if sim == SimStatus::Pin {
            match self.profile.pin.clone() {
                Some(pin) => {
                    best_effort("Enter SIM PIN", ops.enter_sim_pin(&pin).await);
                }
                None => warn!("SIM is PIN locked and no PIN was configured"),
            }
        }

        if sim == SimStatus::Ready {
            self.read_sim_identity(ops).await;
        }

        if !self.profile.apn.is_empty() {
            best_effort("Set profile", ops.set_profile(&self.profile).await);
        }
        if let Some(stored) = best_effort("Get profile", ops.get_profile(self.profile.pdp).await) {
            info!(
                "Profile {}: apn {:?} user {:?} auth {}",
                self.profile.pdp, stored.apn, stored.user, stored.auth
            );
        }

        self.ps_attached = match ops.get_registration_state().await {
            Ok(attached) => attached,
            Err(e) => {
                warn!("Get registration state failed: {}", e);
                false
            }
        };
        info!("PS attached: {}", self.ps_attached);

        self.post(Control::HealthCheck);
        Ok(true)
    }

    async fn wait_connected(&mut self, attempt: &mut Attempt) -> Result<(), SessionError> {
        let events = &mut attempt.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Some(Event::DeviceConnected) => return true,
                    Some(Event::DeviceDisconnected) | None => return false,
                    Some(other) => debug!("Ignoring {:?} before device connected", other),
                }
            }
        };
        let name = attempt.engine.client().codec().name();
        match timeout(self.config.connect_timeout, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SessionError::NoDeviceConnected(format!(
                "{} device closed during startup",
                name
            ))),
            Err(_) => Err(SessionError::NoDeviceConnected(format!(
                "no {} device within {:?}",
                name, self.config.connect_timeout
            ))),
        }
    }

    /// Poll while the modem says the SIM query is unsupported (it is still
    /// starting). `None` means Stop was requested.
    async fn poll_sim(&mut self, ops: &mut dyn RequestOps) -> Option<SimStatus> {
        loop {
            match ops.get_sim_status().await {
                Ok(status) => return Some(status),
                Err(CallError::DeviceUnsupported) => {
                    debug!("SIM status not available yet");
                    sleep(self.config.sim_poll_interval).await;
                    if self.stop_requested() {
                        return None;
                    }
                }
                Err(CallError::NotImplemented) => return Some(SimStatus::NotReady),
                Err(e) => {
                    warn!("Get SIM status failed: {}", e);
                    return Some(SimStatus::NotReady);
                }
            }
        }
    }

    async fn read_sim_identity(&mut self, ops: &mut dyn RequestOps) {
        if let Some(iccid) = best_effort("Get ICCID", ops.get_iccid().await) {
            info!("ICCID: {}", iccid);
            self.profile.identity.iccid = Some(iccid);
        }

        let Some(imsi) = best_effort("Get IMSI", ops.get_imsi().await) else {
            return;
        };
        info!("IMSI: {}", imsi);

        if self.profile.apn.is_empty() {
            if let (Some(resolver), Some((mcc, mnc))) = (&self.resolver, home_network(&imsi)) {
                match resolver.lookup(mcc, mnc) {
                    Some(settings) => {
                        info!("APN for {}/{}: {:?}", mcc, mnc, settings.apn);
                        self.profile.apn = settings;
                    }
                    None => info!("No APN known for {}/{}", mcc, mnc),
                }
            }
        }
        self.profile.identity.imsi = Some(imsi);
    }
}
