//! Protocol-neutral view of a control-channel message.
//!
//! Both QMI and MBIM frames carry a family marker (control vs. service
//! multiplexed), a transaction id and a length. The codecs in [`crate::qmi`]
//! and [`crate::mbim`] map their wire headers onto [`Frame`]; everything
//! above the codec only looks at this type.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::event::Event;

/// Which logical endpoint a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// QMI CTL service, or MBIM OPEN/CLOSE.
    Control,
    /// A QMI service client allocated through CTL.
    Service { service: u8, client: u8 },
    /// An MBIM device service.
    Device { service: [u8; 16] },
}

impl Channel {
    pub fn id_space(&self) -> IdSpace {
        match *self {
            Channel::Control => IdSpace::Control,
            Channel::Service { service, client } => IdSpace::Client { service, client },
            Channel::Device { .. } => IdSpace::Control,
        }
    }
}

/// A range transaction ids are unique within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdSpace {
    Control,
    Client { service: u8, client: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Indication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub kind: FrameKind,
    /// Zero on a request means "allocate one for me"; zero on an
    /// indication is the unsolicited marker.
    pub transaction_id: u32,
    pub message_id: u32,
    /// MBIM only: command type on requests, status on responses.
    pub code: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(channel: Channel, message_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            kind: FrameKind::Request,
            transaction_id: 0,
            message_id,
            code: 0,
            payload: payload.into(),
        }
    }

    pub fn response(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: self.channel,
            kind: FrameKind::Response,
            transaction_id: self.transaction_id,
            message_id: self.message_id,
            code: 0,
            payload: payload.into(),
        }
    }

    pub fn indication(channel: Channel, message_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            kind: FrameKind::Indication,
            transaction_id: 0,
            message_id,
            code: 0,
            payload: payload.into(),
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = code;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: u32) -> Self {
        self.transaction_id = transaction_id;
        self
    }
}

/// Wire format of one protocol variant.
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError>;

    fn decode(&self, raw: &[u8]) -> Result<Frame, ProtocolError>;

    /// Largest transaction id the header can carry in `space`.
    fn max_transaction_id(&self, space: IdSpace) -> u32;

    /// Map an indication to an [`Event`]; `None` for indications nobody
    /// above the engine cares about.
    fn indication_event(&self, frame: &Frame) -> Option<Event>;
}
