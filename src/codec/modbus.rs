//! Modbus TCP (MBAP) framing and PDU codec for the server role.

use crate::core::error::{GatewayError, Result};

/// MBAP transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
}

/// Decoded request PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Pdu {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => 0x01,
            Self::ReadDiscreteInputs { .. } => 0x02,
            Self::ReadHoldingRegisters { .. } => 0x03,
            Self::ReadInputRegisters { .. } => 0x04,
            Self::WriteSingleCoil { .. } => 0x05,
            Self::WriteSingleRegister { .. } => 0x06,
            Self::WriteMultipleCoils { .. } => 0x0F,
            Self::WriteMultipleRegisters { .. } => 0x10,
        }
    }
}

/// Modbus exception codes used by the server.
pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Try to decode one request frame from `buf`. Returns the frame and the
/// consumed byte count, or `None` when more data is needed.
pub fn decode_request(buf: &[u8]) -> Result<Option<(MbapHeader, Pdu, usize)>> {
    if buf.len() < 7 {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != 0 {
        return Err(GatewayError::Protocol(format!(
            "invalid MBAP protocol id: {protocol_id}"
        )));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length < 2 {
        return Err(GatewayError::Protocol(format!(
            "invalid MBAP length: {length}"
        )));
    }
    if buf.len() < 6 + length {
        return Ok(None);
    }
    let unit_id = buf[6];
    let pdu = &buf[7..6 + length];
    let consumed = 6 + length;
    let header = MbapHeader {
        transaction_id,
        unit_id,
    };

    let function = pdu[0];
    let body = &pdu[1..];
    let word = |i: usize| -> Result<u16> {
        body.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| GatewayError::Protocol("truncated modbus request".into()))
    };

    let pdu = match function {
        0x01 => Pdu::ReadCoils {
            address: word(0)?,
            quantity: word(1)?,
        },
        0x02 => Pdu::ReadDiscreteInputs {
            address: word(0)?,
            quantity: word(1)?,
        },
        0x03 => Pdu::ReadHoldingRegisters {
            address: word(0)?,
            quantity: word(1)?,
        },
        0x04 => Pdu::ReadInputRegisters {
            address: word(0)?,
            quantity: word(1)?,
        },
        0x05 => Pdu::WriteSingleCoil {
            address: word(0)?,
            value: word(1)? == 0xFF00,
        },
        0x06 => Pdu::WriteSingleRegister {
            address: word(0)?,
            value: word(1)?,
        },
        0x0F => {
            let address = word(0)?;
            let quantity = word(1)? as usize;
            let byte_count = *body
                .get(4)
                .ok_or_else(|| GatewayError::Protocol("truncated modbus request".into()))?
                as usize;
            let bits = body
                .get(5..5 + byte_count)
                .ok_or_else(|| GatewayError::Protocol("truncated modbus request".into()))?;
            let values = (0..quantity)
                .map(|i| bits[i / 8] >> (i % 8) & 1 == 1)
                .collect();
            Pdu::WriteMultipleCoils { address, values }
        }
        0x10 => {
            let address = word(0)?;
            let quantity = word(1)? as usize;
            let data = body
                .get(5..5 + quantity * 2)
                .ok_or_else(|| GatewayError::Protocol("truncated modbus request".into()))?;
            let values = data
                .chunks_exact(2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .collect();
            Pdu::WriteMultipleRegisters { address, values }
        }
        other => {
            return Err(GatewayError::Unsupported(format!(
                "modbus function 0x{other:02X}"
            )))
        }
    };
    Ok(Some((header, pdu, consumed)))
}

fn frame(header: &MbapHeader, pdu_body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu_body.len());
    out.extend_from_slice(&header.transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&((pdu_body.len() + 1) as u16).to_be_bytes());
    out.push(header.unit_id);
    out.extend_from_slice(pdu_body);
    out
}

/// Encode a bit-read response (coils / discrete inputs).
pub fn encode_bits_response(header: &MbapHeader, function: u8, bits: &[bool]) -> Vec<u8> {
    let byte_count = bits.len().div_ceil(8);
    let mut body = Vec::with_capacity(2 + byte_count);
    body.push(function);
    body.push(byte_count as u8);
    let mut packed = vec![0u8; byte_count];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    body.extend_from_slice(&packed);
    frame(header, &body)
}

/// Encode a register-read response (holding / input registers).
pub fn encode_registers_response(header: &MbapHeader, function: u8, registers: &[u16]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + registers.len() * 2);
    body.push(function);
    body.push((registers.len() * 2) as u8);
    for reg in registers {
        body.extend_from_slice(&reg.to_be_bytes());
    }
    frame(header, &body)
}

/// Echo response for single/multiple writes.
pub fn encode_write_response(header: &MbapHeader, function: u8, address: u16, value: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.push(function);
    body.extend_from_slice(&address.to_be_bytes());
    body.extend_from_slice(&value.to_be_bytes());
    frame(header, &body)
}

/// Exception response.
pub fn encode_exception(header: &MbapHeader, function: u8, code: u8) -> Vec<u8> {
    frame(header, &[function | 0x80, code])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(unit: u8, pdu: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x00, 0x2A, 0x00, 0x00];
        buf.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        buf.push(unit);
        buf.extend_from_slice(pdu);
        buf
    }

    #[test]
    fn test_decode_read_holding() {
        let buf = request(1, &[0x03, 0x00, 0x64, 0x00, 0x02]);
        let (header, pdu, consumed) = decode_request(&buf).unwrap().unwrap();
        assert_eq!(header.transaction_id, 0x2A);
        assert_eq!(header.unit_id, 1);
        assert_eq!(consumed, buf.len());
        assert_eq!(
            pdu,
            Pdu::ReadHoldingRegisters {
                address: 100,
                quantity: 2
            }
        );
    }

    #[test]
    fn test_decode_incomplete() {
        let buf = request(1, &[0x03, 0x00, 0x64, 0x00, 0x02]);
        assert!(decode_request(&buf[..5]).unwrap().is_none());
        assert!(decode_request(&buf[..8]).unwrap().is_none());
    }

    #[test]
    fn test_decode_write_multiple_registers() {
        let buf = request(2, &[0x10, 0x00, 0x0A, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]);
        let (_, pdu, _) = decode_request(&buf).unwrap().unwrap();
        assert_eq!(
            pdu,
            Pdu::WriteMultipleRegisters {
                address: 10,
                values: vec![0x0102, 0x0304]
            }
        );
    }

    #[test]
    fn test_decode_write_single_coil() {
        let buf = request(1, &[0x05, 0x00, 0x03, 0xFF, 0x00]);
        let (_, pdu, _) = decode_request(&buf).unwrap().unwrap();
        assert_eq!(
            pdu,
            Pdu::WriteSingleCoil {
                address: 3,
                value: true
            }
        );
    }

    #[test]
    fn test_encode_bits_response_packing() {
        let header = MbapHeader {
            transaction_id: 1,
            unit_id: 1,
        };
        let out = encode_bits_response(&header, 0x01, &[true, false, true]);
        // pdu: fc, byte count, packed bits (0b101)
        assert_eq!(&out[7..], &[0x01, 0x01, 0b0000_0101]);
        // mbap length covers unit + pdu
        assert_eq!(u16::from_be_bytes([out[4], out[5]]), 4);
    }

    #[test]
    fn test_encode_exception() {
        let header = MbapHeader {
            transaction_id: 7,
            unit_id: 3,
        };
        let out = encode_exception(&header, 0x03, ILLEGAL_DATA_ADDRESS);
        assert_eq!(&out[7..], &[0x83, 0x02]);
    }

    #[test]
    fn test_unknown_function() {
        let buf = request(1, &[0x2B, 0x00, 0x00]);
        assert!(decode_request(&buf).is_err());
    }
}
