//! QMI request operations over the correlation engine.
//!
//! DMS, NAS and WDA clients are shared; WDS gets one client per enabled IP
//! family so IPv4 and IPv6 calls can be driven independently.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

use super::tlv::{self, TlvWriter, Tlvs};
use super::*;
use crate::connection::EngineClient;
use crate::error::{CallError, ProtocolError};
use crate::frame::{Channel, Frame};
use crate::ops::{Capabilities, RequestOps, SignalInfo, SimStatus};
use crate::profile::{
    ApnSettings, AuthMode, IpFamily, IpSettings, Ipv4Settings, Ipv6Settings, LoopbackConfig,
    Profile, is_valid_pin,
};
use crate::state::ConnectionStatus;

const NAS_REGISTER_INDICATIONS: u16 = 0x0003;

const TLV_VERBOSE_END_REASON: u8 = 0x11;
const END_REASON_TYPE_3GPP: u16 = 6;
const CAUSE_USER_AUTHENTICATION_FAILED: u16 = 29;

/// DNS, IP address, gateway and MTU.
const RUNTIME_SETTINGS_MASK: u32 = 0x2310;

const GLOBAL_PACKET_HANDLE: u32 = 0xffff_ffff;

const PKT_STATUS_CONNECTED: u8 = 0x02;

#[derive(Debug, Default, Clone, Copy)]
struct Clients {
    dms: Option<u8>,
    nas: Option<u8>,
    wda: Option<u8>,
    wds: [Option<u8>; 2],
}

pub struct QmiRequestOps {
    engine: EngineClient,
    clients: Clients,
    handles: [Option<u32>; 2],
}

fn service_channel(client: Option<u8>, service: u8) -> Result<Channel, CallError> {
    client
        .map(|client| Channel::Service { service, client })
        .ok_or(CallError::Protocol(ProtocolError::Unencodable(
            "service client not allocated",
        )))
}

fn map_error(code: u16) -> CallError {
    match code {
        ERR_DEVICE_UNSUPPORTED => CallError::DeviceUnsupported,
        code => CallError::Rejected(code),
    }
}

/// Parse a response and fail unless its result TLV reports success.
fn success(frame: &Frame) -> Result<Tlvs<'_>, CallError> {
    let tlvs = Tlvs::parse(&frame.payload)?;
    match tlvs.result()? {
        Ok(()) => Ok(tlvs),
        Err(code) => Err(map_error(code)),
    }
}

fn is_auth_failure(tlvs: &Tlvs<'_>) -> bool {
    let Some(value) = tlvs.get(TLV_VERBOSE_END_REASON) else {
        return false;
    };
    let kind = tlv::le_u16(TLV_VERBOSE_END_REASON, value, 0);
    let reason = tlv::le_u16(TLV_VERBOSE_END_REASON, value, 2);
    matches!(
        (kind, reason),
        (Ok(END_REASON_TYPE_3GPP), Ok(CAUSE_USER_AUTHENTICATION_FAILED))
    )
}

fn auth_bits(auth: AuthMode) -> u8 {
    match auth {
        AuthMode::None => 0,
        AuthMode::Pap => 1,
        AuthMode::Chap => 2,
    }
}

fn auth_from_bits(bits: u8) -> AuthMode {
    if bits & 0x02 != 0 {
        AuthMode::Chap
    } else if bits & 0x01 != 0 {
        AuthMode::Pap
    } else {
        AuthMode::None
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn radio_name(radio: u8) -> Option<&'static str> {
    match radio {
        0x01 => Some("cdma1x"),
        0x02 => Some("evdo"),
        0x04 => Some("gsm"),
        0x05 => Some("umts"),
        0x08 => Some("lte"),
        0x0c => Some("nr5g"),
        _ => None,
    }
}

fn ipv6_with_prefix(tlvs: &Tlvs<'_>, tag: u8) -> Result<Option<(Ipv6Addr, u8)>, ProtocolError> {
    match tlvs.get(tag) {
        Some(value) => {
            let addr = Ipv6Addr::from(tlv::array16(tag, value, 0)?);
            let prefix = tlv::le_u8(tag, value, 16)?;
            Ok(Some((addr, prefix)))
        }
        None => Ok(None),
    }
}

fn ipv6(tlvs: &Tlvs<'_>, tag: u8) -> Result<Option<Ipv6Addr>, ProtocolError> {
    tlvs.get(tag)
        .map(|value| tlv::array16(tag, value, 0).map(Ipv6Addr::from))
        .transpose()
}

impl QmiRequestOps {
    pub fn new(engine: EngineClient) -> Self {
        Self {
            engine,
            clients: Clients::default(),
            handles: [None; 2],
        }
    }

    async fn request(
        &self,
        channel: Channel,
        message: u16,
        payload: Bytes,
    ) -> Result<Frame, CallError> {
        self.engine
            .send_and_wait(Frame::request(channel, message as u32, payload))
            .await
    }

    fn dms(&self) -> Result<Channel, CallError> {
        service_channel(self.clients.dms, SERVICE_DMS)
    }

    fn nas(&self) -> Result<Channel, CallError> {
        service_channel(self.clients.nas, SERVICE_NAS)
    }

    fn wds(&self, family: IpFamily) -> Result<Channel, CallError> {
        service_channel(self.clients.wds[family.index()], SERVICE_WDS)
    }

    /// Profile management is not per family; any WDS client will do.
    fn any_wds(&self) -> Result<Channel, CallError> {
        let client = self.clients.wds.iter().flatten().next().copied();
        service_channel(client, SERVICE_WDS)
    }

    fn wda(&self) -> Result<Channel, CallError> {
        self.clients
            .wda
            .map(|client| Channel::Service {
                service: SERVICE_WDA,
                client,
            })
            .ok_or(CallError::DeviceUnsupported)
    }

    async fn allocate_client(&self, service: u8) -> Result<u8, CallError> {
        let payload = TlvWriter::new().u8(0x01, service).finish();
        let response = self
            .request(Channel::Control, CTL_GET_CLIENT_ID, payload)
            .await?;
        let tlvs = success(&response)?;
        let value = tlvs.require(0x01)?;
        if tlv::le_u8(0x01, value, 0)? != service {
            return Err(ProtocolError::InvalidTlv {
                tlv: 0x01,
                reason: "client granted for another service",
            }
            .into());
        }
        let client = tlv::le_u8(0x01, value, 1)?;
        debug!("Allocated client {} for service 0x{:02x}", client, service);
        Ok(client)
    }

    async fn release_client(&self, service: u8, client: u8) -> Result<(), CallError> {
        let payload = TlvWriter::new().bytes(0x01, &[service, client]).finish();
        let response = self
            .request(Channel::Control, CTL_RELEASE_CLIENT_ID, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn set_ip_family_preference(&self, family: IpFamily) -> Result<(), CallError> {
        let payload = TlvWriter::new().u8(0x01, family as u8).finish();
        let response = self
            .request(self.wds(family)?, WDS_SET_CLIENT_IP_FAMILY_PREF, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn register_indications(&self) -> Result<(), CallError> {
        let payload = TlvWriter::new().u8(0x13, 1).finish();
        let response = self
            .request(self.nas()?, NAS_REGISTER_INDICATIONS, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn pin_status(&self) -> Result<SimStatus, CallError> {
        let response = self
            .request(self.dms()?, DMS_UIM_GET_PIN_STATUS, Bytes::new())
            .await?;
        let tlvs = success(&response)?;
        let status = match tlvs.get(0x11) {
            Some(value) => tlv::le_u8(0x11, value, 0)?,
            None => return Ok(SimStatus::Ready),
        };
        Ok(match status {
            0x01 => SimStatus::Pin,
            0x04 => SimStatus::Puk,
            0x05 => SimStatus::Bad,
            _ => SimStatus::Ready,
        })
    }

    async fn dms_string(&self, message: u16, tag: u8) -> Result<String, CallError> {
        let response = self.request(self.dms()?, message, Bytes::new()).await?;
        let tlvs = success(&response)?;
        tlvs.string(tag)
            .ok_or_else(|| ProtocolError::MissingTlv(tag).into())
    }
}

#[async_trait]
impl RequestOps for QmiRequestOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            independent_dual_stack: true,
            stable_runtime_address: true,
        }
    }

    async fn init(&mut self, profile: &Profile) -> Result<(), CallError> {
        self.clients.dms = Some(self.allocate_client(SERVICE_DMS).await?);
        self.clients.nas = Some(self.allocate_client(SERVICE_NAS).await?);
        self.clients.wda = match self.allocate_client(SERVICE_WDA).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("WDA service unavailable: {}", e);
                None
            }
        };

        for family in IpFamily::ALL {
            if !profile.is_enabled(family) {
                continue;
            }
            self.clients.wds[family.index()] = Some(self.allocate_client(SERVICE_WDS).await?);
            self.set_ip_family_preference(family).await?;
        }

        if let Err(e) = self.register_indications().await {
            warn!("Could not register for serving system indications: {}", e);
        }
        info!("QMI clients ready: {:?}", self.clients);
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), CallError> {
        let clients = std::mem::take(&mut self.clients);
        self.handles = [None; 2];

        let mut allocated = vec![
            (SERVICE_DMS, clients.dms),
            (SERVICE_NAS, clients.nas),
            (SERVICE_WDA, clients.wda),
        ];
        allocated.extend(clients.wds.iter().map(|c| (SERVICE_WDS, *c)));

        for (service, client) in allocated {
            let Some(client) = client else { continue };
            if let Err(e) = self.release_client(service, client).await {
                warn!(
                    "Failed to release client {} of service 0x{:02x}: {}",
                    client, service, e
                );
            }
        }
        Ok(())
    }

    async fn get_imei(&mut self) -> Result<String, CallError> {
        self.dms_string(DMS_GET_IDS, 0x11).await
    }

    async fn get_baseband_version(&mut self) -> Result<String, CallError> {
        self.dms_string(DMS_GET_REVISION, 0x01).await
    }

    async fn set_ethernet_mode(&mut self, profile: &Profile) -> Result<(), CallError> {
        let format: u32 = if profile.raw_ip { 2 } else { 1 };
        let payload = TlvWriter::new().u32(0x11, format).finish();
        let response = self
            .request(self.wda()?, WDA_SET_DATA_FORMAT, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn set_loopback_state(&mut self, loopback: LoopbackConfig) -> Result<(), CallError> {
        let payload = TlvWriter::new()
            .u8(0x01, loopback.enabled as u8)
            .u32(0x02, loopback.replication_factor)
            .finish();
        let response = self
            .request(self.wda()?, WDA_LOOPBACK_CONFIG, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn get_sim_status(&mut self) -> Result<SimStatus, CallError> {
        let response = self
            .request(self.dms()?, DMS_UIM_GET_STATE, Bytes::new())
            .await?;
        let state = success(&response)?
            .u8(0x01)?
            .ok_or(ProtocolError::MissingTlv(0x01))?;
        match state {
            0x00 => self.pin_status().await,
            0x01 => Ok(SimStatus::Bad),
            0x02 => Ok(SimStatus::Absent),
            _ => Ok(SimStatus::NotReady),
        }
    }

    async fn enter_sim_pin(&mut self, pin: &str) -> Result<(), CallError> {
        if !is_valid_pin(pin) {
            return Err(ProtocolError::Unencodable("SIM PIN must be 4 to 8 digits").into());
        }
        let mut value = vec![0x01, pin.len() as u8];
        value.extend_from_slice(pin.as_bytes());
        let payload = TlvWriter::new().bytes(0x01, &value).finish();
        let response = self
            .request(self.dms()?, DMS_UIM_VERIFY_PIN, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn get_iccid(&mut self) -> Result<String, CallError> {
        self.dms_string(DMS_UIM_GET_ICCID, 0x01).await
    }

    async fn get_imsi(&mut self) -> Result<String, CallError> {
        self.dms_string(DMS_UIM_GET_IMSI, 0x01).await
    }

    async fn set_profile(&mut self, profile: &Profile) -> Result<(), CallError> {
        let apn = &profile.apn;
        let mut payload = TlvWriter::new()
            .bytes(0x01, &[0x00, profile.pdp])
            .string(0x14, apn.apn.as_deref().unwrap_or(""));
        if let Some(user) = apn.user.as_deref() {
            payload = payload.string(0x1b, user);
        }
        if let Some(password) = apn.password.as_deref() {
            payload = payload.string(0x1c, password);
        }
        let payload = payload.u8(0x1d, auth_bits(apn.auth)).finish();

        let response = self
            .request(self.any_wds()?, WDS_MODIFY_PROFILE, payload)
            .await?;
        success(&response)?;
        Ok(())
    }

    async fn get_profile(&mut self, pdp: u8) -> Result<ApnSettings, CallError> {
        let payload = TlvWriter::new().bytes(0x01, &[0x00, pdp]).finish();
        let response = self
            .request(self.any_wds()?, WDS_GET_PROFILE_SETTINGS, payload)
            .await?;
        let tlvs = success(&response)?;
        Ok(ApnSettings {
            apn: non_empty(tlvs.string(0x14)),
            user: non_empty(tlvs.string(0x1b)),
            password: non_empty(tlvs.string(0x1c)),
            auth: auth_from_bits(tlvs.u8(0x1d)?.unwrap_or(0)),
        })
    }

    async fn get_registration_state(&mut self) -> Result<bool, CallError> {
        let response = self
            .request(self.nas()?, NAS_SERVING_SYSTEM, Bytes::new())
            .await?;
        let tlvs = success(&response)?;
        let value = tlvs.require(0x01)?;
        let registration = tlv::le_u8(0x01, value, 0)?;
        let ps_attached = tlv::le_u8(0x01, value, 2)? == 0x01;
        debug!(
            "Serving system: registration {} PS attached {}",
            registration, ps_attached
        );
        Ok(ps_attached)
    }

    async fn setup_data_call(
        &mut self,
        profile: &Profile,
        family: IpFamily,
    ) -> Result<(), CallError> {
        let apn = &profile.apn;
        let mut payload = TlvWriter::new();
        if let Some(name) = apn.apn.as_deref() {
            payload = payload.string(0x14, name);
        }
        if apn.has_credentials() {
            payload = payload
                .u8(0x16, auth_bits(apn.auth))
                .string(0x17, apn.user.as_deref().unwrap_or(""))
                .string(0x18, apn.password.as_deref().unwrap_or(""));
        }
        let payload = payload
            .u8(0x19, family as u8)
            .u8(0x31, profile.pdp)
            .finish();

        let response = self
            .request(self.wds(family)?, WDS_START_NETWORK, payload)
            .await?;
        let tlvs = Tlvs::parse(&response.payload)?;
        match tlvs.result()? {
            Ok(()) => {
                let handle = tlvs.u32(0x01)?.ok_or(ProtocolError::MissingTlv(0x01))?;
                self.handles[family.index()] = Some(handle);
                info!("{} data call started (handle 0x{:08x})", family, handle);
                Ok(())
            }
            Err(ERR_NO_EFFECT) => {
                info!("{} data call already active", family);
                Ok(())
            }
            Err(ERR_CALL_FAILED) if is_auth_failure(&tlvs) => Err(CallError::Auth),
            Err(code) => Err(map_error(code)),
        }
    }

    async fn query_data_call(&mut self, family: IpFamily) -> Result<ConnectionStatus, CallError> {
        let response = self
            .request(self.wds(family)?, WDS_GET_PKT_SRVC_STATUS, Bytes::new())
            .await?;
        let status = success(&response)?
            .u8(0x01)?
            .ok_or(ProtocolError::MissingTlv(0x01))?;
        Ok(if status == PKT_STATUS_CONNECTED {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        })
    }

    async fn deactivate_data_call(
        &mut self,
        _profile: &Profile,
        family: IpFamily,
    ) -> Result<(), CallError> {
        let handle = self.handles[family.index()]
            .take()
            .unwrap_or(GLOBAL_PACKET_HANDLE);
        let payload = TlvWriter::new().u32(0x01, handle).finish();
        let response = self
            .request(self.wds(family)?, WDS_STOP_NETWORK, payload)
            .await?;
        match Tlvs::parse(&response.payload)?.result()? {
            Ok(()) | Err(ERR_NO_EFFECT) => Ok(()),
            Err(code) => Err(map_error(code)),
        }
    }

    async fn get_ip_address(
        &mut self,
        _profile: &Profile,
        family: IpFamily,
    ) -> Result<IpSettings, CallError> {
        let payload = TlvWriter::new().u32(0x10, RUNTIME_SETTINGS_MASK).finish();
        let response = self
            .request(self.wds(family)?, WDS_GET_RUNTIME_SETTINGS, payload)
            .await?;
        let tlvs = success(&response)?;
        let v4 = |tag: u8| tlvs.u32(tag).map(|v| v.map(Ipv4Addr::from));

        match family {
            IpFamily::V4 => {
                let address = v4(0x1e)?.ok_or(ProtocolError::MissingTlv(0x1e))?;
                Ok(IpSettings::V4(Ipv4Settings {
                    address: Some(address),
                    gateway: v4(0x20)?,
                    subnet_mask: v4(0x21)?,
                    dns_primary: v4(0x15)?,
                    dns_secondary: v4(0x16)?,
                    mtu: tlvs.u32(0x29)?,
                }))
            }
            IpFamily::V6 => {
                let (address, prefix_len) =
                    ipv6_with_prefix(&tlvs, 0x25)?.ok_or(ProtocolError::MissingTlv(0x25))?;
                let gateway = ipv6_with_prefix(&tlvs, 0x26)?;
                Ok(IpSettings::V6(Ipv6Settings {
                    address: Some(address),
                    prefix_len,
                    gateway: gateway.map(|(addr, _)| addr),
                    gateway_prefix_len: gateway.map(|(_, len)| len).unwrap_or(0),
                    dns_primary: ipv6(&tlvs, 0x27)?,
                    dns_secondary: ipv6(&tlvs, 0x28)?,
                    mtu: tlvs.u32(0x29)?,
                }))
            }
        }
    }

    async fn get_signal_info(&mut self) -> Result<SignalInfo, CallError> {
        let response = self
            .request(self.nas()?, NAS_GET_SIGNAL_STRENGTH, Bytes::new())
            .await?;
        let tlvs = success(&response)?;
        let value = tlvs.require(0x01)?;
        let rssi = tlv::le_u8(0x01, value, 0)? as i8;
        let radio = tlv::le_u8(0x01, value, 1)?;
        Ok(SignalInfo {
            rssi_dbm: Some(rssi as i16),
            radio: radio_name(radio).map(str::to_string),
        })
    }
}
