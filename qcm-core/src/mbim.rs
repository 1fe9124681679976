//! MBIM control message envelope.
//!
//! Every message starts with a 12 byte header (type, total length,
//! transaction id, all u32 LE). OPEN and CLOSE travel on
//! [`Channel::Control`]; commands and status indications carry a fragment
//! header, a device-service UUID and a CID and travel on
//! [`Channel::Device`]. Transaction ids share a single 32 bit space.
//!
//! Multi-fragment messages are not reassembled.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::event::Event;
use crate::frame::{Channel, Codec, Frame, FrameKind, IdSpace};

pub const MBIM_OPEN: u32 = 0x0000_0001;
pub const MBIM_CLOSE: u32 = 0x0000_0002;
pub const MBIM_COMMAND: u32 = 0x0000_0003;
pub const MBIM_OPEN_DONE: u32 = 0x8000_0001;
pub const MBIM_CLOSE_DONE: u32 = 0x8000_0002;
pub const MBIM_COMMAND_DONE: u32 = 0x8000_0003;
pub const MBIM_FUNCTION_ERROR: u32 = 0x8000_0004;
pub const MBIM_INDICATE_STATUS: u32 = 0x8000_0007;

const DONE_BIT: u32 = 0x8000_0000;
const HEADER_LEN: usize = 12;
/// Fragment header, service UUID and CID.
const COMMAND_PREFIX_LEN: usize = 8 + 16 + 4;

pub const COMMAND_TYPE_QUERY: u32 = 0;
pub const COMMAND_TYPE_SET: u32 = 1;

/// Basic Connect service, a289cc33-bcbb-8b4f-b6b0-133ec2aae6df.
pub const UUID_BASIC_CONNECT: [u8; 16] = [
    0xa2, 0x89, 0xcc, 0x33, 0xbc, 0xbb, 0x8b, 0x4f, 0xb6, 0xb0, 0x13, 0x3e, 0xc2, 0xaa, 0xe6, 0xdf,
];

pub const CID_REGISTER_STATE: u32 = 9;
pub const CID_PACKET_SERVICE: u32 = 10;
pub const CID_CONNECT: u32 = 12;

#[derive(Debug, Clone, Copy, Default)]
pub struct MbimCodec;

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(raw: &'a [u8], pos: usize) -> Self {
        Self { raw, pos }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + len;
        let slice = self.raw.get(self.pos..end).ok_or(ProtocolError::Truncated {
            needed: end,
            available: self.raw.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uuid(&mut self) -> Result<[u8; 16], ProtocolError> {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(self.take(16)?);
        Ok(uuid)
    }

    fn rest(&self) -> &'a [u8] {
        &self.raw[self.pos..]
    }
}

fn header(buf: &mut BytesMut, message_type: u32, total: usize, transaction_id: u32) {
    buf.put_u32_le(message_type);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(transaction_id);
}

impl MbimCodec {
    fn decode_device(
        &self,
        reader: &mut Reader<'_>,
        kind: FrameKind,
        transaction_id: u32,
    ) -> Result<Frame, ProtocolError> {
        let total = reader.u32()?;
        let current = reader.u32()?;
        if total != 1 || current != 0 {
            return Err(ProtocolError::InvalidTlv {
                tlv: 0,
                reason: "fragmented MBIM message",
            });
        }
        let service = reader.uuid()?;
        let cid = reader.u32()?;
        let code = match kind {
            FrameKind::Indication => 0,
            _ => reader.u32()?,
        };
        let info_len = reader.u32()? as usize;
        let info = reader.rest();
        if info.len() != info_len {
            return Err(ProtocolError::LengthMismatch {
                declared: info_len,
                actual: info.len(),
            });
        }
        Ok(Frame {
            channel: Channel::Device { service },
            kind,
            transaction_id,
            message_id: cid,
            code,
            payload: Bytes::copy_from_slice(info),
        })
    }
}

impl Codec for MbimCodec {
    fn name(&self) -> &'static str {
        "MBIM"
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        match frame.channel {
            Channel::Control => {
                let message_type = match frame.kind {
                    FrameKind::Request => frame.message_id,
                    FrameKind::Response => frame.message_id | DONE_BIT,
                    FrameKind::Indication => {
                        return Err(ProtocolError::Unencodable("MBIM control indication"));
                    }
                };
                let status_len = if frame.kind == FrameKind::Response { 4 } else { 0 };
                let total = HEADER_LEN + status_len + frame.payload.len();
                let mut buf = BytesMut::with_capacity(total);
                header(&mut buf, message_type, total, frame.transaction_id);
                if status_len > 0 {
                    buf.put_u32_le(frame.code);
                }
                buf.put_slice(&frame.payload);
                Ok(buf.freeze())
            }
            Channel::Device { service } => {
                let (message_type, has_code) = match frame.kind {
                    FrameKind::Request => (MBIM_COMMAND, true),
                    FrameKind::Response => (MBIM_COMMAND_DONE, true),
                    FrameKind::Indication => (MBIM_INDICATE_STATUS, false),
                };
                let code_len = if has_code { 4 } else { 0 };
                let total = HEADER_LEN + COMMAND_PREFIX_LEN + code_len + 4 + frame.payload.len();
                let mut buf = BytesMut::with_capacity(total);
                header(&mut buf, message_type, total, frame.transaction_id);
                buf.put_u32_le(1);
                buf.put_u32_le(0);
                buf.put_slice(&service);
                buf.put_u32_le(frame.message_id);
                if has_code {
                    buf.put_u32_le(frame.code);
                }
                buf.put_u32_le(frame.payload.len() as u32);
                buf.put_slice(&frame.payload);
                Ok(buf.freeze())
            }
            Channel::Service { .. } => Err(ProtocolError::Unencodable("QMI channel on MBIM device")),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Frame, ProtocolError> {
        let mut reader = Reader::new(raw, 0);
        let message_type = reader.u32()?;
        let declared = reader.u32()? as usize;
        let transaction_id = reader.u32()?;
        if declared != raw.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: raw.len(),
            });
        }

        match message_type {
            MBIM_OPEN | MBIM_CLOSE => Ok(Frame {
                channel: Channel::Control,
                kind: FrameKind::Request,
                transaction_id,
                message_id: message_type,
                code: 0,
                payload: Bytes::copy_from_slice(reader.rest()),
            }),
            MBIM_OPEN_DONE | MBIM_CLOSE_DONE | MBIM_FUNCTION_ERROR => {
                let status = reader.u32()?;
                Ok(Frame {
                    channel: Channel::Control,
                    kind: FrameKind::Response,
                    transaction_id,
                    message_id: message_type & !DONE_BIT,
                    code: status,
                    payload: Bytes::copy_from_slice(reader.rest()),
                })
            }
            MBIM_COMMAND => self.decode_device(&mut reader, FrameKind::Request, transaction_id),
            MBIM_COMMAND_DONE => {
                self.decode_device(&mut reader, FrameKind::Response, transaction_id)
            }
            MBIM_INDICATE_STATUS => {
                self.decode_device(&mut reader, FrameKind::Indication, transaction_id)
            }
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    fn max_transaction_id(&self, _space: IdSpace) -> u32 {
        u32::MAX
    }

    fn indication_event(&self, frame: &Frame) -> Option<Event> {
        let Channel::Device { service } = frame.channel else {
            return None;
        };
        if service != UUID_BASIC_CONNECT {
            return None;
        }
        match frame.message_id {
            CID_REGISTER_STATE | CID_PACKET_SERVICE => Some(Event::RegistrationChanged),
            CID_CONNECT => Some(Event::DataCallListChanged),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_open_layout() -> Result<()> {
        let open = Frame::request(
            Channel::Control,
            MBIM_OPEN,
            Bytes::from_static(&[0x00, 0x10, 0x00, 0x00]),
        )
            .with_transaction_id(1);
        let raw = MbimCodec.encode(&open)?;
        assert_eq!(
            raw.as_ref(),
            &[
                0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
                0x10, 0x00, 0x00,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_function_error_is_a_response() -> Result<()> {
        let raw = [
            0x04, 0x00, 0x00, 0x80, 0x10, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x00,
            0x00, 0x00,
        ];
        let frame = MbimCodec.decode(&raw)?;
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.channel, Channel::Control);
        assert_eq!(frame.transaction_id, 7);
        assert_eq!(frame.code, 2);
        Ok(())
    }

    #[test]
    fn test_command_done_decode() -> Result<()> {
        let request = Frame::request(
            Channel::Device {
                service: UUID_BASIC_CONNECT,
            },
            CID_CONNECT,
            &b""[..],
        )
        .with_code(COMMAND_TYPE_QUERY)
        .with_transaction_id(0x1234_5678);

        let done = request.response(&b"\x01\x00\x00\x00"[..]).with_code(0);
        let frame = MbimCodec.decode(&MbimCodec.encode(&done)?)?;
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.transaction_id, 0x1234_5678);
        assert_eq!(frame.message_id, CID_CONNECT);
        assert_eq!(frame.payload.as_ref(), b"\x01\x00\x00\x00");
        assert_eq!(frame.channel.id_space(), IdSpace::Control);
        Ok(())
    }

    #[test]
    fn test_indications_map_to_events() -> Result<()> {
        let device = Channel::Device {
            service: UUID_BASIC_CONNECT,
        };
        let raw = MbimCodec.encode(&Frame::indication(device, CID_REGISTER_STATE, &b""[..]))?;
        let frame = MbimCodec.decode(&raw)?;
        assert_eq!(frame.kind, FrameKind::Indication);
        assert_eq!(
            MbimCodec.indication_event(&frame),
            Some(Event::RegistrationChanged)
        );

        let connect = Frame::indication(device, CID_CONNECT, &b""[..]);
        assert_eq!(
            MbimCodec.indication_event(&connect),
            Some(Event::DataCallListChanged)
        );

        let other = Frame::indication(Channel::Device { service: [0; 16] }, CID_CONNECT, &b""[..]);
        assert_eq!(MbimCodec.indication_event(&other), None);
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            MbimCodec.decode(&[0x01, 0x00]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            MbimCodec.decode(&[0x09, 0, 0, 0, 0x0c, 0, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownMessageType(9))
        ));
        assert!(matches!(
            MbimCodec.decode(&[0x01, 0, 0, 0, 0x20, 0, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }
}
