use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use qcm_core::{FamilySet, LinkNotifier, Profile};

/// One line of `--json` output.
#[derive(Debug, Serialize)]
struct LinkEvent<'a> {
    timestamp: String,
    event: &'static str,
    interface: Option<&'a str>,
    ipv4: bool,
    ipv6: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

/// Brings the host interface up by running a DHCP client on it.
pub struct DhcpNotifier {
    interface: Option<String>,
    run_dhcp: bool,
    json: bool,
    client: Option<Child>,
}

impl DhcpNotifier {
    pub fn new(interface: Option<String>, run_dhcp: bool, json: bool) -> Self {
        Self {
            interface,
            run_dhcp,
            json,
            client: None,
        }
    }

    fn emit(&self, event: &'static str, families: FamilySet, address: Option<String>) {
        if !self.json {
            return;
        }
        let line = LinkEvent {
            timestamp: Utc::now().to_rfc3339(),
            event,
            interface: self.interface.as_deref(),
            ipv4: families.ipv4,
            ipv6: families.ipv6,
            address,
        };
        match serde_json::to_string(&line) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Failed to encode link event: {}", e),
        }
    }

    async fn stop_client(&mut self) {
        let Some(mut child) = self.client.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!("Failed to stop DHCP client: {}", e);
        } else {
            debug!("DHCP client stopped");
        }
    }
}

#[async_trait]
impl LinkNotifier for DhcpNotifier {
    async fn link_up(&mut self, families: FamilySet, profile: &Profile) {
        let address = profile.ipv4.address.map(|a| a.to_string());
        self.emit("link_up", families, address);

        let Some(interface) = self.interface.clone() else {
            info!("Link up, no interface configured");
            return;
        };
        if !self.run_dhcp {
            info!("Link up on {} (DHCP disabled)", interface);
            return;
        }

        self.stop_client().await;
        match Command::new("udhcpc")
            .arg("-i")
            .arg(&interface)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                info!("Started udhcpc on {}", interface);
                self.client = Some(child);
            }
            Err(e) => warn!("Failed to start udhcpc on {}: {}", interface, e),
        }
    }

    async fn link_down(&mut self) {
        self.emit("link_down", FamilySet::NONE, None);
        if self.run_dhcp {
            self.stop_client().await;
        }
        info!("Link down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_link_event_line() -> Result<()> {
        let line = LinkEvent {
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
            event: "link_up",
            interface: Some("wwan0"),
            ipv4: true,
            ipv6: false,
            address: Some("10.64.1.2".to_string()),
        };
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&line)?)?;
        assert_eq!(value["event"], "link_up");
        assert_eq!(value["interface"], "wwan0");
        assert_eq!(value["address"], "10.64.1.2");

        let down = LinkEvent {
            address: None,
            event: "link_down",
            ..line
        };
        let text = serde_json::to_string(&down)?;
        assert!(!text.contains("address"));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_dhcp_only_logs() {
        let mut notifier = DhcpNotifier::new(Some("wwan0".to_string()), false, false);
        let both = FamilySet {
            ipv4: true,
            ipv6: true,
        };
        notifier.link_up(both, &Profile::default()).await;
        assert!(notifier.client.is_none());
        notifier.link_down().await;
        assert!(notifier.client.is_none());
    }
}
