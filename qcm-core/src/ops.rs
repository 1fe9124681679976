//! Request operations: the protocol-specific calls the state machine drives.
//!
//! Every call is awaited to completion by the control loop and may issue any
//! number of engine round trips. Operations a protocol variant does not
//! offer keep the default body and report [`CallError::NotImplemented`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use strum::Display;

use crate::connection::{EngineClient, Transport};
use crate::error::{CallError, TransportError};
use crate::frame::Codec;
use crate::profile::{ApnSettings, IpFamily, IpSettings, LoopbackConfig, Profile};
use crate::state::ConnectionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum SimStatus {
    Absent,
    NotReady,
    Ready,
    Pin,
    Puk,
    NetworkPersonalization,
    Bad,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalInfo {
    pub rssi_dbm: Option<i16>,
    pub radio: Option<String>,
}

/// Per-variant behavior flags the state machine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// IPv4 and IPv6 calls can be set up and queried separately. When
    /// false, IPv6 mirrors the IPv4 call.
    pub independent_dual_stack: bool,
    /// Re-reading the address of a live call returns the same address, so
    /// a difference means the local view is stale.
    pub stable_runtime_address: bool,
}

#[async_trait]
pub trait RequestOps: Send {
    fn capabilities(&self) -> Capabilities;

    /// Variant-specific bring-up run right after the device connects.
    async fn init(&mut self, _profile: &Profile) -> Result<(), CallError> {
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), CallError> {
        Ok(())
    }

    async fn get_imei(&mut self) -> Result<String, CallError> {
        Err(CallError::NotImplemented)
    }

    async fn get_baseband_version(&mut self) -> Result<String, CallError> {
        Err(CallError::NotImplemented)
    }

    async fn set_ethernet_mode(&mut self, _profile: &Profile) -> Result<(), CallError> {
        Err(CallError::NotImplemented)
    }

    async fn set_loopback_state(&mut self, _loopback: LoopbackConfig) -> Result<(), CallError> {
        Err(CallError::NotImplemented)
    }

    async fn get_sim_status(&mut self) -> Result<SimStatus, CallError> {
        Err(CallError::NotImplemented)
    }

    async fn enter_sim_pin(&mut self, _pin: &str) -> Result<(), CallError> {
        Err(CallError::NotImplemented)
    }

    async fn get_iccid(&mut self) -> Result<String, CallError> {
        Err(CallError::NotImplemented)
    }

    async fn get_imsi(&mut self) -> Result<String, CallError> {
        Err(CallError::NotImplemented)
    }

    async fn set_profile(&mut self, _profile: &Profile) -> Result<(), CallError> {
        Err(CallError::NotImplemented)
    }

    async fn get_profile(&mut self, _pdp: u8) -> Result<ApnSettings, CallError> {
        Err(CallError::NotImplemented)
    }

    /// True when the modem is attached to the packet-switched domain.
    async fn get_registration_state(&mut self) -> Result<bool, CallError>;

    async fn setup_data_call(
        &mut self,
        profile: &Profile,
        family: IpFamily,
    ) -> Result<(), CallError>;

    async fn query_data_call(&mut self, family: IpFamily) -> Result<ConnectionStatus, CallError>;

    async fn deactivate_data_call(
        &mut self,
        profile: &Profile,
        family: IpFamily,
    ) -> Result<(), CallError>;

    async fn get_ip_address(
        &mut self,
        profile: &Profile,
        family: IpFamily,
    ) -> Result<IpSettings, CallError>;

    async fn get_signal_info(&mut self) -> Result<SignalInfo, CallError> {
        Err(CallError::NotImplemented)
    }
}

/// One protocol variant (QMI, MBIM, ...), chosen once at startup.
///
/// A modem reset invalidates the open device, so every session attempt gets
/// a fresh transport from [`Backend::open`] and fresh request operations
/// bound to that attempt's engine.
#[async_trait]
pub trait Backend: Send + Sync {
    fn codec(&self) -> Arc<dyn Codec>;

    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError>;

    fn bind(&self, engine: EngineClient) -> Box<dyn RequestOps>;
}
