use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TLV 0x02 present in every QMI response.
pub const TLV_RESULT: u8 = 0x02;

pub const QMI_RESULT_SUCCESS: u16 = 0x0000;

/// Builds a TLV payload: u8 type, u16 LE length, value.
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: BytesMut,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, tlv: u8, value: &[u8]) -> Self {
        self.buf.put_u8(tlv);
        self.buf.put_u16_le(value.len() as u16);
        self.buf.put_slice(value);
        self
    }

    pub fn u8(self, tlv: u8, value: u8) -> Self {
        self.bytes(tlv, &[value])
    }

    pub fn u16(self, tlv: u8, value: u16) -> Self {
        self.bytes(tlv, &value.to_le_bytes())
    }

    pub fn u32(self, tlv: u8, value: u32) -> Self {
        self.bytes(tlv, &value.to_le_bytes())
    }

    pub fn string(self, tlv: u8, value: &str) -> Self {
        self.bytes(tlv, value.as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Parsed view over a TLV payload.
#[derive(Debug)]
pub struct Tlvs<'a> {
    entries: Vec<(u8, &'a [u8])>,
}

impl<'a> Tlvs<'a> {
    pub fn parse(mut payload: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        while !payload.is_empty() {
            if payload.len() < 3 {
                return Err(ProtocolError::Truncated {
                    needed: 3,
                    available: payload.len(),
                });
            }
            let tlv = payload[0];
            let len = u16::from_le_bytes([payload[1], payload[2]]) as usize;
            let rest = &payload[3..];
            if rest.len() < len {
                return Err(ProtocolError::Truncated {
                    needed: len,
                    available: rest.len(),
                });
            }
            entries.push((tlv, &rest[..len]));
            payload = &rest[len..];
        }
        Ok(Self { entries })
    }

    pub fn get(&self, tlv: u8) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tlv)
            .map(|(_, value)| *value)
    }

    pub fn require(&self, tlv: u8) -> Result<&'a [u8], ProtocolError> {
        self.get(tlv).ok_or(ProtocolError::MissingTlv(tlv))
    }

    pub fn u8(&self, tlv: u8) -> Result<Option<u8>, ProtocolError> {
        self.get(tlv).map(|v| le_u8(tlv, v, 0)).transpose()
    }

    pub fn u32(&self, tlv: u8) -> Result<Option<u32>, ProtocolError> {
        self.get(tlv).map(|v| le_u32(tlv, v, 0)).transpose()
    }

    pub fn string(&self, tlv: u8) -> Option<String> {
        self.get(tlv)
            .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
    }

    /// `Ok(())` on success, otherwise the QMI error code.
    pub fn result(&self) -> Result<Result<(), u16>, ProtocolError> {
        let value = self.require(TLV_RESULT)?;
        let result = le_u16(TLV_RESULT, value, 0)?;
        let error = le_u16(TLV_RESULT, value, 2)?;
        if result == QMI_RESULT_SUCCESS {
            Ok(Ok(()))
        } else {
            Ok(Err(error))
        }
    }
}

fn field<'v>(
    tlv: u8,
    value: &'v [u8],
    offset: usize,
    len: usize,
) -> Result<&'v [u8], ProtocolError> {
    value
        .get(offset..offset + len)
        .ok_or(ProtocolError::InvalidTlv {
            tlv,
            reason: "value too short",
        })
}

pub fn le_u8(tlv: u8, value: &[u8], offset: usize) -> Result<u8, ProtocolError> {
    Ok(field(tlv, value, offset, 1)?[0])
}

pub fn le_u16(tlv: u8, value: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    let b = field(tlv, value, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn le_u32(tlv: u8, value: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let b = field(tlv, value, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn array16(tlv: u8, value: &[u8], offset: usize) -> Result<[u8; 16], ProtocolError> {
    let b = field(tlv, value, offset, 16)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(b);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_writer_layout() {
        let payload = TlvWriter::new().u8(0x01, 0x02).u16(0x10, 0x1234).finish();
        assert_eq!(
            payload.as_ref(),
            &[0x01, 0x01, 0x00, 0x02, 0x10, 0x02, 0x00, 0x34, 0x12]
        );
    }

    #[test]
    fn test_result_tlv() -> Result<()> {
        let ok = [0x02, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(Tlvs::parse(&ok)?.result()?, Ok(()));

        let failed = [0x02, 0x04, 0x00, 0x01, 0x00, 0x19, 0x00];
        assert_eq!(Tlvs::parse(&failed)?.result()?, Err(0x0019));

        let missing = Tlvs::parse(&[])?;
        assert_eq!(missing.result(), Err(ProtocolError::MissingTlv(TLV_RESULT)));
        Ok(())
    }

    #[test]
    fn test_truncated_tlv_is_rejected() {
        assert!(Tlvs::parse(&[0x01, 0x05, 0x00, 0xaa]).is_err());
        assert!(Tlvs::parse(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_string_strips_nul_padding() -> Result<()> {
        let payload = TlvWriter::new().bytes(0x01, b"EG25GGBR07A08M2G\0\0").finish();
        let tlvs = Tlvs::parse(&payload)?;
        assert_eq!(tlvs.string(0x01).as_deref(), Some("EG25GGBR07A08M2G"));
        assert_eq!(tlvs.string(0x02), None);
        Ok(())
    }
}
