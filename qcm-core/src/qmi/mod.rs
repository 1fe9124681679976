//! QMI envelope: QMUX header followed by a CTL or service SDU.
//!
//! ```text
//! QMUX  | 0x01 | len u16 | ctl flags u8 | service u8 | client u8 |
//! CTL   | flags u8 | txn u8  | msg u16 | tlv len u16 | tlvs... |
//! other | flags u8 | txn u16 | msg u16 | tlv len u16 | tlvs... |
//! ```
//!
//! All integers are little endian. `len` counts everything after the
//! leading 0x01.

pub mod ops;
pub mod tlv;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::ProtocolError;
use crate::event::Event;
use crate::frame::{Channel, Codec, Frame, FrameKind, IdSpace};
use tlv::Tlvs;

pub use ops::QmiRequestOps;

pub const QMUX_IF_TYPE: u8 = 0x01;
const QMUX_HEADER_LEN: usize = 6;
const CTL_SDU_HEADER_LEN: usize = 6;
const SERVICE_SDU_HEADER_LEN: usize = 7;

const QMUX_FLAG_FROM_SERVICE: u8 = 0x80;

const CTL_FLAG_RESPONSE: u8 = 0x01;
const CTL_FLAG_INDICATION: u8 = 0x02;
const SDU_FLAG_RESPONSE: u8 = 0x02;
const SDU_FLAG_INDICATION: u8 = 0x04;

pub const SERVICE_CTL: u8 = 0x00;
pub const SERVICE_WDS: u8 = 0x01;
pub const SERVICE_DMS: u8 = 0x02;
pub const SERVICE_NAS: u8 = 0x03;
pub const SERVICE_WDA: u8 = 0x1a;

pub const CTL_GET_CLIENT_ID: u16 = 0x0022;
pub const CTL_RELEASE_CLIENT_ID: u16 = 0x0023;
pub const CTL_REVOKE_CLIENT_ID_IND: u16 = 0x0024;
pub const CTL_SYNC: u16 = 0x0027;

pub const WDS_START_NETWORK: u16 = 0x0020;
pub const WDS_STOP_NETWORK: u16 = 0x0021;
pub const WDS_GET_PKT_SRVC_STATUS: u16 = 0x0022;
pub const WDS_MODIFY_PROFILE: u16 = 0x0028;
pub const WDS_GET_PROFILE_SETTINGS: u16 = 0x002b;
pub const WDS_GET_RUNTIME_SETTINGS: u16 = 0x002d;
pub const WDS_SET_CLIENT_IP_FAMILY_PREF: u16 = 0x004d;

pub const DMS_GET_REVISION: u16 = 0x0023;
pub const DMS_GET_IDS: u16 = 0x0025;
pub const DMS_UIM_VERIFY_PIN: u16 = 0x0028;
pub const DMS_UIM_GET_PIN_STATUS: u16 = 0x002b;
pub const DMS_UIM_GET_ICCID: u16 = 0x003c;
pub const DMS_UIM_GET_IMSI: u16 = 0x0043;
pub const DMS_UIM_GET_STATE: u16 = 0x0044;

pub const NAS_GET_SIGNAL_STRENGTH: u16 = 0x0020;
pub const NAS_SERVING_SYSTEM: u16 = 0x0024;
pub const NAS_SYS_INFO_IND: u16 = 0x004e;

pub const WDA_SET_DATA_FORMAT: u16 = 0x0020;
pub const WDA_LOOPBACK_CONFIG: u16 = 0x002f;

pub const ERR_CALL_FAILED: u16 = 0x000e;
pub const ERR_DEVICE_UNSUPPORTED: u16 = 0x0019;
pub const ERR_NO_EFFECT: u16 = 0x001a;

/// Codec for QMI over a cdc-wdm / qcqmi character device.
#[derive(Debug, Clone, Copy, Default)]
pub struct QmiCodec;

impl QmiCodec {
    fn loopback_event(frame: &Frame) -> Option<Event> {
        let parsed = Tlvs::parse(&frame.payload).and_then(|tlvs| {
            let enabled = tlvs.u8(0x01)?.ok_or(ProtocolError::MissingTlv(0x01))?;
            let replication_factor = tlvs.u32(0x02)?.unwrap_or(0);
            Ok(Event::LoopbackConfig {
                enabled: enabled != 0,
                replication_factor,
            })
        });
        match parsed {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Malformed loopback indication: {}", e);
                None
            }
        }
    }
}

impl Codec for QmiCodec {
    fn name(&self) -> &'static str {
        "QMI"
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let (service, client, sdu_len) = match frame.channel {
            Channel::Control => (SERVICE_CTL, 0, CTL_SDU_HEADER_LEN),
            Channel::Service { service, client } => (service, client, SERVICE_SDU_HEADER_LEN),
            Channel::Device { .. } => {
                return Err(ProtocolError::Unencodable("MBIM channel on QMI device"));
            }
        };

        let total = QMUX_HEADER_LEN + sdu_len + frame.payload.len();
        if total - 1 > u16::MAX as usize {
            return Err(ProtocolError::Unencodable("frame too large"));
        }
        let message_id = u16::try_from(frame.message_id)
            .map_err(|_| ProtocolError::Unencodable("message id exceeds 16 bits"))?;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(QMUX_IF_TYPE);
        buf.put_u16_le((total - 1) as u16);
        buf.put_u8(match frame.kind {
            FrameKind::Request => 0x00,
            FrameKind::Response | FrameKind::Indication => QMUX_FLAG_FROM_SERVICE,
        });
        buf.put_u8(service);
        buf.put_u8(client);

        if service == SERVICE_CTL {
            let txn = u8::try_from(frame.transaction_id)
                .map_err(|_| ProtocolError::Unencodable("CTL transaction id exceeds 8 bits"))?;
            buf.put_u8(match frame.kind {
                FrameKind::Request => 0x00,
                FrameKind::Response => CTL_FLAG_RESPONSE,
                FrameKind::Indication => CTL_FLAG_INDICATION,
            });
            buf.put_u8(txn);
        } else {
            let txn = u16::try_from(frame.transaction_id)
                .map_err(|_| ProtocolError::Unencodable("transaction id exceeds 16 bits"))?;
            buf.put_u8(match frame.kind {
                FrameKind::Request => 0x00,
                FrameKind::Response => SDU_FLAG_RESPONSE,
                FrameKind::Indication => SDU_FLAG_INDICATION,
            });
            buf.put_u16_le(txn);
        }
        buf.put_u16_le(message_id);
        buf.put_u16_le(frame.payload.len() as u16);
        buf.put_slice(&frame.payload);
        Ok(buf.freeze())
    }

    fn decode(&self, raw: &[u8]) -> Result<Frame, ProtocolError> {
        if raw.len() < QMUX_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: QMUX_HEADER_LEN,
                available: raw.len(),
            });
        }
        if raw[0] != QMUX_IF_TYPE {
            return Err(ProtocolError::BadMarker(raw[0]));
        }
        let declared = u16::from_le_bytes([raw[1], raw[2]]) as usize + 1;
        if declared != raw.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: raw.len(),
            });
        }

        let service = raw[4];
        let client = raw[5];
        let sdu = &raw[QMUX_HEADER_LEN..];

        let (channel, kind, transaction_id, rest) = if service == SERVICE_CTL {
            if sdu.len() < CTL_SDU_HEADER_LEN {
                return Err(ProtocolError::Truncated {
                    needed: CTL_SDU_HEADER_LEN,
                    available: sdu.len(),
                });
            }
            let kind = if sdu[0] & CTL_FLAG_INDICATION != 0 {
                FrameKind::Indication
            } else if sdu[0] & CTL_FLAG_RESPONSE != 0 {
                FrameKind::Response
            } else {
                FrameKind::Request
            };
            (Channel::Control, kind, sdu[1] as u32, &sdu[2..])
        } else {
            if sdu.len() < SERVICE_SDU_HEADER_LEN {
                return Err(ProtocolError::Truncated {
                    needed: SERVICE_SDU_HEADER_LEN,
                    available: sdu.len(),
                });
            }
            let kind = if sdu[0] & SDU_FLAG_INDICATION != 0 {
                FrameKind::Indication
            } else if sdu[0] & SDU_FLAG_RESPONSE != 0 {
                FrameKind::Response
            } else {
                FrameKind::Request
            };
            let txn = u16::from_le_bytes([sdu[1], sdu[2]]) as u32;
            (Channel::Service { service, client }, kind, txn, &sdu[3..])
        };

        let message_id = u16::from_le_bytes([rest[0], rest[1]]) as u32;
        let tlv_len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let payload = &rest[4..];
        if tlv_len != payload.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: tlv_len,
                actual: payload.len(),
            });
        }

        Ok(Frame {
            channel,
            kind,
            transaction_id,
            message_id,
            code: 0,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    fn max_transaction_id(&self, space: IdSpace) -> u32 {
        match space {
            IdSpace::Control => u8::MAX as u32,
            IdSpace::Client { .. } => u16::MAX as u32,
        }
    }

    fn indication_event(&self, frame: &Frame) -> Option<Event> {
        let message_id = u16::try_from(frame.message_id).ok()?;
        match (frame.channel, message_id) {
            (Channel::Control, CTL_REVOKE_CLIENT_ID_IND | CTL_SYNC) => Some(Event::ModemReset),
            (Channel::Service { service: SERVICE_WDS, .. }, WDS_GET_PKT_SRVC_STATUS) => {
                Some(Event::DataCallListChanged)
            }
            (
                Channel::Service {
                    service: SERVICE_NAS,
                    ..
                },
                NAS_SERVING_SYSTEM | NAS_SYS_INFO_IND,
            ) => Some(Event::RegistrationChanged),
            (Channel::Service { service: SERVICE_WDA, .. }, WDA_LOOPBACK_CONFIG) => {
                Self::loopback_event(frame)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_service_request_layout() -> Result<()> {
        let frame = Frame::request(
            Channel::Service {
                service: SERVICE_WDS,
                client: 0x05,
            },
            WDS_GET_PKT_SRVC_STATUS as u32,
            &b""[..],
        )
        .with_transaction_id(0x0102);

        let raw = QmiCodec.encode(&frame)?;
        assert_eq!(
            raw.as_ref(),
            &[
                0x01, 0x0c, 0x00, 0x00, 0x01, 0x05, // QMUX
                0x00, 0x02, 0x01, 0x22, 0x00, 0x00, 0x00, // SDU
            ]
        );
        Ok(())
    }

    #[test]
    fn test_ctl_response_decode() -> Result<()> {
        // CTL Get Client ID response: WDS client 0x07, success.
        let raw = [
            0x01, 0x17, 0x00, 0x80, 0x00, 0x00, // QMUX
            0x01, 0x03, 0x22, 0x00, 0x0c, 0x00, // CTL
            0x02, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, // result
            0x01, 0x02, 0x00, 0x01, 0x07, // client id
        ];
        let frame = QmiCodec.decode(&raw)?;
        assert_eq!(frame.channel, Channel::Control);
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.transaction_id, 3);
        assert_eq!(frame.message_id, CTL_GET_CLIENT_ID as u32);

        let tlvs = Tlvs::parse(&frame.payload)?;
        assert_eq!(tlvs.result()?, Ok(()));
        assert_eq!(tlvs.get(0x01), Some(&[0x01, 0x07][..]));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_bad_envelopes() {
        assert!(matches!(
            QmiCodec.decode(&[0x02, 0x05, 0x00, 0x80, 0x01, 0x01]),
            Err(ProtocolError::BadMarker(0x02))
        ));
        assert!(matches!(
            QmiCodec.decode(&[0x01, 0x0c, 0x00, 0x80, 0x01, 0x01, 0x02]),
            Err(ProtocolError::LengthMismatch { .. })
        ));
        assert!(matches!(
            QmiCodec.decode(&[0x01, 0x02]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ctl_transaction_id_limit() {
        let frame = Frame::request(Channel::Control, CTL_GET_CLIENT_ID as u32, &b""[..])
            .with_transaction_id(0x100);
        assert!(QmiCodec.encode(&frame).is_err());
        assert_eq!(QmiCodec.max_transaction_id(IdSpace::Control), 0xff);
    }

    #[test]
    fn test_indication_mapping() -> Result<()> {
        let wds = Channel::Service {
            service: SERVICE_WDS,
            client: 1,
        };
        let raw = QmiCodec.encode(&Frame::indication(
            wds,
            WDS_GET_PKT_SRVC_STATUS as u32,
            &b"\x01\x02\x00\x01\x00"[..],
        ))?;
        let frame = QmiCodec.decode(&raw)?;
        assert_eq!(frame.kind, FrameKind::Indication);
        assert_eq!(
            QmiCodec.indication_event(&frame),
            Some(Event::DataCallListChanged)
        );

        let reset = Frame::indication(Channel::Control, CTL_REVOKE_CLIENT_ID_IND as u32, &b""[..]);
        assert_eq!(QmiCodec.indication_event(&reset), Some(Event::ModemReset));

        let loopback = Frame::indication(
            Channel::Service {
                service: SERVICE_WDA,
                client: 3,
            },
            WDA_LOOPBACK_CONFIG as u32,
            tlv::TlvWriter::new().u8(0x01, 1).u32(0x02, 4).finish(),
        );
        assert_eq!(
            QmiCodec.indication_event(&loopback),
            Some(Event::LoopbackConfig {
                enabled: true,
                replication_factor: 4
            })
        );

        let unknown = Frame::indication(wds, 0x0001, &b""[..]);
        assert_eq!(QmiCodec.indication_event(&unknown), None);
        Ok(())
    }
}
