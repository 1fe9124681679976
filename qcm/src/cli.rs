use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use qcm_core::profile::{ApnSettings, LoopbackConfig, UsbDeviceId, is_valid_pin};
use qcm_core::{AuthMode, Profile};

#[derive(Parser, Debug)]
#[command(name = "qcm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// QMI control device
    #[arg(short = 'D', long, default_value = "/dev/cdc-wdm0")]
    pub device: PathBuf,

    /// Network interface the data path shows up on (e.g., wwan0)
    #[arg(short = 'i', long)]
    pub interface: Option<String>,

    /// Access point name
    #[arg(short = 's', long)]
    pub apn: Option<String>,

    /// APN user name
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// APN password
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Authentication: none, pap, chap (or 0, 1, 2). Defaults to chap when a
    /// password is given
    #[arg(short = 'a', long)]
    pub auth: Option<AuthMode>,

    /// SIM PIN (4 to 8 digits), entered if the SIM is locked
    #[arg(long, value_parser = parse_pin)]
    pub pin: Option<String>,

    /// Bring up IPv4 (the default when neither -4 nor -6 is given)
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Bring up IPv6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// PDP context / profile index
    #[arg(short = 'n', long, default_value = "1")]
    pub pdp: u8,

    /// USB bus number of the modem, watched after a modem reset
    #[arg(long, requires = "usb_dev")]
    pub usb_bus: Option<u16>,

    /// USB device number of the modem
    #[arg(long, requires = "usb_bus")]
    pub usb_dev: Option<u16>,

    /// JSON carrier database used when no APN is configured
    #[arg(long)]
    pub apn_db: Option<PathBuf>,

    /// Enable modem loopback test mode with this replication factor
    #[arg(long, value_name = "FACTOR")]
    pub loopback: Option<u32>,

    /// Use raw-IP instead of ethernet framing on the data path
    #[arg(long)]
    pub raw_ip: bool,

    /// Per-request timeout (e.g., 30s, 1m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Session timing configuration (JSON)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Do not run a DHCP client on link changes
    #[arg(long)]
    pub no_dhcp: bool,

    /// Print link events as JSON lines
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Also append logs to this file
    #[arg(short = 'f', long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn parse_pin(value: &str) -> Result<String, String> {
    if is_valid_pin(value) {
        Ok(value.to_string())
    } else {
        Err("expected 4 to 8 digits".to_string())
    }
}

impl Cli {
    pub fn usb_id(&self) -> Option<UsbDeviceId> {
        Some(UsbDeviceId {
            busnum: self.usb_bus?,
            devnum: self.usb_dev?,
        })
    }

    pub fn profile(&self) -> Profile {
        let auth = match (self.auth, &self.password) {
            (Some(auth), _) => auth,
            (None, Some(_)) => AuthMode::Chap,
            (None, None) => AuthMode::None,
        };

        Profile {
            apn: ApnSettings {
                apn: self.apn.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
                auth,
            },
            pin: self.pin.clone(),
            pdp: self.pdp,
            enable_ipv4: self.ipv4 || !self.ipv6,
            enable_ipv6: self.ipv6,
            raw_ip: self.raw_ip,
            loopback: LoopbackConfig {
                enabled: self.loopback.is_some(),
                replication_factor: self.loopback.unwrap_or(0),
            },
            usb: self.usb_id().unwrap_or_default(),
            interface: self.interface.clone(),
            ..Default::default()
        }
    }
}
