use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};

use crate::profile::{FamilySet, IpFamily};

/// Data-call status of one IP family, as last seen by the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Unknown, _) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            _ => false,
        }
    }
}

/// Status of both families. Owned by the control loop only.
#[derive(Debug, Clone, Default)]
pub struct FamilyStates {
    status: [ConnectionStatus; 2],
}

impl FamilyStates {
    pub fn get(&self, family: IpFamily) -> ConnectionStatus {
        self.status[family.index()]
    }

    pub fn set(&mut self, family: IpFamily, next: ConnectionStatus) {
        let current = self.get(family);
        if !current.can_transition_to(next) {
            warn!("{} status jumped {} -> {}", family, current, next);
        } else if current != next {
            debug!("{} status {} -> {}", family, current, next);
        }
        self.status[family.index()] = next;
    }

    /// Take another family's status verbatim, for variants where IPv6 rides
    /// on the IPv4 call.
    pub fn mirror(&mut self, from: IpFamily, to: IpFamily) {
        self.status[to.index()] = self.get(from);
    }

    pub fn is_connected(&self, family: IpFamily) -> bool {
        self.get(family) == ConnectionStatus::Connected
    }

    pub fn any_connected(&self) -> bool {
        IpFamily::ALL.iter().any(|f| self.is_connected(*f))
    }

    pub fn connected_set(&self) -> FamilySet {
        let mut set = FamilySet::NONE;
        for family in IpFamily::ALL {
            if self.is_connected(family) {
                set.insert(family);
            }
        }
        set
    }
}

/// Host-visible link state, remembered so the host collaborator is only
/// told about changes.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    notified: Option<FamilySet>,
}

impl LinkState {
    /// Record `next`; true if it differs from what the host last saw.
    pub fn update(&mut self, next: FamilySet) -> bool {
        if self.notified == Some(next) {
            return false;
        }
        self.notified = Some(next);
        true
    }

    /// Mark the link down without telling the host.
    pub fn force_down(&mut self) {
        self.notified = Some(FamilySet::NONE);
    }

    pub fn current(&self) -> Option<FamilySet> {
        self.notified
    }
}

/// Top-level state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Initializing,
    Ready,
    Resetting,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, Ready | ShuttingDown | Terminated)
                | (Ready, ShuttingDown | Resetting | Terminated)
                | (Resetting, Initializing | Terminated)
                | (ShuttingDown, Terminated)
        )
    }
}
