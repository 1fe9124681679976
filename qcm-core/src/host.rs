//! Host-side collaborators of a session.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::profile::{FamilySet, Profile, UsbDeviceId};

/// Receives aggregate link changes and configures the host interface.
///
/// Only called when the set of connected families changes. Implementations
/// log their own failures; the session does not react to them.
#[async_trait]
pub trait LinkNotifier: Send {
    async fn link_up(&mut self, families: FamilySet, profile: &Profile);

    async fn link_down(&mut self);
}

/// Checks whether the modem is still attached after a reset.
#[async_trait]
pub trait DeviceWatch: Send + Sync {
    async fn is_present(&self) -> bool;

    fn describe(&self) -> String;
}

/// Watches the modem's node under `/dev/bus/usb`.
#[derive(Debug, Clone)]
pub struct UsbNodeWatch {
    path: PathBuf,
}

impl UsbNodeWatch {
    pub fn new(usb: UsbDeviceId) -> Self {
        Self {
            path: PathBuf::from(usb.node_path()),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceWatch for UsbNodeWatch {
    async fn is_present(&self) -> bool {
        let present = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        debug!("{} present: {}", self.path.display(), present);
        present
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_usb_watch_checks_node() {
        let watch = UsbNodeWatch::new(UsbDeviceId {
            busnum: 999,
            devnum: 999,
        });
        assert_eq!(watch.describe(), "/dev/bus/usb/999/999");
        assert!(!watch.is_present().await);

        let here = UsbNodeWatch::at(std::env::temp_dir());
        assert!(here.is_present().await);
    }
}
