//! Core library for qcm, a cellular modem connectivity manager
//!
//! This crate provides the message correlation engine that turns a QMI or
//! MBIM control channel into request/response calls plus an indication
//! stream, and the connection state machine that keeps the modem's packet
//! data session up on top of it.

pub mod apn;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod host;
pub mod mbim;
pub mod ops;
pub mod profile;
pub mod qmi;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use apn::{ApnDatabase, ApnResolver};
pub use config::SessionConfig;
pub use connection::{Engine, EngineClient, Transport};
pub use error::{CallError, ProtocolError, SessionError, TransportError};
pub use event::{Control, ControlSender, Event};
pub use host::{DeviceWatch, LinkNotifier, UsbNodeWatch};
pub use ops::{Backend, Capabilities, RequestOps};
pub use profile::{AuthMode, FamilySet, IpFamily, Profile};
pub use session::{Session, SessionOutcome};
