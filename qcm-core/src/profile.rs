use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use strum::{Display, EnumString};

/// IP family of a data call. The discriminants match the QMI/MBIM wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    V4 = 4,
    V6 = 6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    pub fn index(self) -> usize {
        match self {
            IpFamily::V4 => 0,
            IpFamily::V6 => 1,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Set of IP families carried by the host link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySet {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl FamilySet {
    pub const NONE: FamilySet = FamilySet {
        ipv4: false,
        ipv6: false,
    };

    pub fn contains(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.ipv4,
            IpFamily::V6 => self.ipv6,
        }
    }

    pub fn insert(&mut self, family: IpFamily) {
        match family {
            IpFamily::V4 => self.ipv4 = true,
            IpFamily::V6 => self.ipv6 = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.ipv4 && !self.ipv6
    }
}

/// PPP-style authentication used when the network asks for credentials.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    #[strum(to_string = "none", serialize = "0")]
    None,
    #[strum(to_string = "pap", serialize = "1")]
    Pap,
    #[strum(to_string = "chap", serialize = "2")]
    Chap,
}

impl AuthMode {
    /// The mode tried when the configured one is rejected (PAP <-> CHAP).
    pub fn toggled(self) -> AuthMode {
        match self {
            AuthMode::Pap => AuthMode::Chap,
            _ => AuthMode::Pap,
        }
    }
}

/// APN and credentials, as configured locally or as stored in the modem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnSettings {
    pub apn: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub auth: AuthMode,
}

impl ApnSettings {
    pub fn is_empty(&self) -> bool {
        self.apn.is_none() && self.user.is_none() && self.password.is_none()
    }

    pub fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.user) && filled(&self.password)
    }
}

/// A SIM PIN is 4 to 8 decimal digits.
pub fn is_valid_pin(pin: &str) -> bool {
    (4..=8).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Settings {
    pub address: Option<Ipv6Addr>,
    pub prefix_len: u8,
    pub gateway: Option<Ipv6Addr>,
    pub gateway_prefix_len: u8,
    pub dns_primary: Option<Ipv6Addr>,
    pub dns_secondary: Option<Ipv6Addr>,
    pub mtu: Option<u32>,
}

/// Address configuration reported by the modem for one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSettings {
    V4(Ipv4Settings),
    V6(Ipv6Settings),
}

impl IpSettings {
    pub fn family(&self) -> IpFamily {
        match self {
            IpSettings::V4(_) => IpFamily::V4,
            IpSettings::V6(_) => IpFamily::V6,
        }
    }

    pub fn has_address(&self) -> bool {
        match self {
            IpSettings::V4(v4) => v4.address.is_some(),
            IpSettings::V6(v6) => v6.address.is_some(),
        }
    }
}

/// Modem data-path loopback test request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    pub enabled: bool,
    pub replication_factor: u32,
}

/// USB bus/device numbers of the modem, used to watch for it after a reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceId {
    pub busnum: u16,
    pub devnum: u16,
}

impl UsbDeviceId {
    pub fn node_path(&self) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", self.busnum, self.devnum)
    }
}

/// Identity strings read from the modem during bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemIdentity {
    pub imei: Option<String>,
    pub baseband_version: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
}

/// Configuration and runtime state of one modem session.
///
/// Owned by the connection state machine; the correlation engine never
/// touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub apn: ApnSettings,
    pub pin: Option<String>,
    pub pdp: u8,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub raw_ip: bool,
    pub ipv4: Ipv4Settings,
    pub ipv6: Ipv6Settings,
    pub loopback: LoopbackConfig,
    pub usb: UsbDeviceId,
    pub interface: Option<String>,
    pub identity: ModemIdentity,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            apn: ApnSettings::default(),
            pin: None,
            pdp: 1,
            enable_ipv4: true,
            enable_ipv6: false,
            raw_ip: false,
            ipv4: Ipv4Settings::default(),
            ipv6: Ipv6Settings::default(),
            loopback: LoopbackConfig::default(),
            usb: UsbDeviceId::default(),
            interface: None,
            identity: ModemIdentity::default(),
        }
    }
}

impl Profile {
    pub fn is_enabled(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.enable_ipv4,
            IpFamily::V6 => self.enable_ipv6,
        }
    }

    pub fn has_address(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.ipv4.address.is_some(),
            IpFamily::V6 => self.ipv6.address.is_some(),
        }
    }

    pub fn settings(&self, family: IpFamily) -> IpSettings {
        match family {
            IpFamily::V4 => IpSettings::V4(self.ipv4.clone()),
            IpFamily::V6 => IpSettings::V6(self.ipv6.clone()),
        }
    }

    /// True when the cached address of `family` equals the one in `settings`.
    pub fn address_matches(&self, settings: &IpSettings) -> bool {
        match settings {
            IpSettings::V4(v4) => self.ipv4.address == v4.address,
            IpSettings::V6(v6) => self.ipv6.address == v6.address,
        }
    }

    pub fn store_settings(&mut self, settings: IpSettings) {
        match settings {
            IpSettings::V4(v4) => self.ipv4 = v4,
            IpSettings::V6(v6) => self.ipv6 = v6,
        }
    }

    pub fn clear_settings(&mut self, family: IpFamily) {
        match family {
            IpFamily::V4 => self.ipv4 = Ipv4Settings::default(),
            IpFamily::V6 => self.ipv6 = Ipv6Settings::default(),
        }
    }
}
