//! L2CAP channel ids and signaling channel PDUs.

use crate::codec::{Decode, Encode, Error, FixedSize};

/// Fixed channel id of the LE-U signaling channel.
pub const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;
/// Fixed channel id of the LE-U security manager channel.
pub const L2CAP_CID_LE_U_SECURITY_MANAGER: u16 = 0x0006;

/// L2CAP signaling command codes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalCode {
    CommandRejectRes = 0x01,
    ConnectionReq = 0x02,
    ConnectionRes = 0x03,
    ConfigurationReq = 0x04,
    ConfigurationRes = 0x05,
    DisconnectionReq = 0x06,
    DisconnectionRes = 0x07,
    EchoReq = 0x08,
    EchoRes = 0x09,
    InformationReq = 0x0A,
    InformationRes = 0x0B,
    ConnParamUpdateReq = 0x12,
    ConnParamUpdateRes = 0x13,
    LeCreditConnReq = 0x14,
    LeCreditConnRes = 0x15,
    LeCreditFlowInd = 0x16,
}

impl TryFrom<u8> for SignalCode {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x01 => Self::CommandRejectRes,
            0x02 => Self::ConnectionReq,
            0x03 => Self::ConnectionRes,
            0x04 => Self::ConfigurationReq,
            0x05 => Self::ConfigurationRes,
            0x06 => Self::DisconnectionReq,
            0x07 => Self::DisconnectionRes,
            0x08 => Self::EchoReq,
            0x09 => Self::EchoRes,
            0x0A => Self::InformationReq,
            0x0B => Self::InformationRes,
            0x12 => Self::ConnParamUpdateReq,
            0x13 => Self::ConnParamUpdateRes,
            0x14 => Self::LeCreditConnReq,
            0x15 => Self::LeCreditConnRes,
            0x16 => Self::LeCreditFlowInd,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Header of a signaling channel frame: `code, identifier, length`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct SignalHeader {
    /// Raw command code; may be a value outside [`SignalCode`].
    pub code: u8,
    /// Request identifier, echoed by responses.
    pub identifier: u8,
    /// Payload length in bytes.
    pub length: u16,
}

impl FixedSize for SignalHeader {
    const SIZE: usize = 4;
}

impl Decode<'_> for SignalHeader {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        if src.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        Ok(Self {
            code: src[0],
            identifier: src[1],
            length: u16::from_le_bytes([src[2], src[3]]),
        })
    }
}

impl Encode for SignalHeader {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        dest[0] = self.code;
        dest[1] = self.identifier;
        dest[2..4].copy_from_slice(&self.length.to_le_bytes());
        Ok(())
    }
}

/// Connection Parameter Update request payload.
///
/// Intervals in 1.25 ms units, timeout in 10 ms units. The same quad is
/// forwarded verbatim as the `LE Connection Update` command parameters when
/// a request is accepted.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnParamUpdateReq {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl FixedSize for ConnParamUpdateReq {
    const SIZE: usize = 8;
}

impl Decode<'_> for ConnParamUpdateReq {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        if src.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        Ok(Self {
            interval_min: u16::from_le_bytes([src[0], src[1]]),
            interval_max: u16::from_le_bytes([src[2], src[3]]),
            latency: u16::from_le_bytes([src[4], src[5]]),
            timeout: u16::from_le_bytes([src[6], src[7]]),
        })
    }
}

impl Encode for ConnParamUpdateReq {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        dest[0..2].copy_from_slice(&self.interval_min.to_le_bytes());
        dest[2..4].copy_from_slice(&self.interval_max.to_le_bytes());
        dest[4..6].copy_from_slice(&self.latency.to_le_bytes());
        dest[6..8].copy_from_slice(&self.timeout.to_le_bytes());
        Ok(())
    }
}

/// Connection Parameter Update response result codes.
pub const CONN_PARAM_UPDATE_ACCEPTED: u16 = 0x0000;
/// Parameters rejected by local policy.
pub const CONN_PARAM_UPDATE_REJECTED: u16 = 0x0001;

/// Connection Parameter Update response payload.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnParamUpdateRes {
    pub result: u16,
}

impl FixedSize for ConnParamUpdateRes {
    const SIZE: usize = 2;
}

impl Decode<'_> for ConnParamUpdateRes {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        if src.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        Ok(Self {
            result: u16::from_le_bytes([src[0], src[1]]),
        })
    }
}

impl Encode for ConnParamUpdateRes {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        dest[0..2].copy_from_slice(&self.result.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = SignalHeader {
            code: 0x12,
            identifier: 0x2a,
            length: 8,
        };
        let mut buf = [0u8; 4];
        header.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x2a, 0x08, 0x00]);
        let decoded = SignalHeader::decode(&buf).unwrap();
        assert_eq!(decoded.code, 0x12);
        assert_eq!(decoded.identifier, 0x2a);
        assert_eq!(decoded.length, 8);
    }

    #[test]
    fn conn_param_update_req_layout() {
        let req = ConnParamUpdateReq::decode(&[0x20, 0x00, 0x24, 0x00, 0x00, 0x00, 0xf4, 0x01]).unwrap();
        assert_eq!(
            req,
            ConnParamUpdateReq {
                interval_min: 0x0020,
                interval_max: 0x0024,
                latency: 0,
                timeout: 0x01f4,
            }
        );

        let mut buf = [0u8; 8];
        req.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x20, 0x00, 0x24, 0x00, 0x00, 0x00, 0xf4, 0x01]);
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(SignalHeader::decode(&[0x12, 0x01]).is_err());
        assert!(ConnParamUpdateReq::decode(&[0x20, 0x00]).is_err());
        assert!(ConnParamUpdateRes::decode(&[]).is_err());
    }
}
