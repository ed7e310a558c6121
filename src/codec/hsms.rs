//! HSMS framing (SEMI E37) for the SECS/GEM drivers.
//!
//! Messages carry a 4-byte length prefix and a 10-byte header; the SECS-II
//! body stays opaque here and is interpreted by device scripts.

use crate::core::error::{GatewayError, Result};

pub const STYPE_DATA: u8 = 0;
pub const STYPE_SELECT_REQ: u8 = 1;
pub const STYPE_SELECT_RSP: u8 = 2;
pub const STYPE_DESELECT_REQ: u8 = 3;
pub const STYPE_DESELECT_RSP: u8 = 4;
pub const STYPE_LINKTEST_REQ: u8 = 5;
pub const STYPE_LINKTEST_RSP: u8 = 6;
pub const STYPE_SEPARATE: u8 = 9;

/// One HSMS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmsMessage {
    pub session_id: u16,
    /// Stream number; the W-bit is carried separately.
    pub stream: u8,
    pub function: u8,
    pub wait_reply: bool,
    pub s_type: u8,
    pub system_bytes: u32,
    pub body: Vec<u8>,
}

impl HsmsMessage {
    pub fn data(session_id: u16, stream: u8, function: u8, wait_reply: bool, system_bytes: u32, body: Vec<u8>) -> Self {
        Self {
            session_id,
            stream,
            function,
            wait_reply,
            s_type: STYPE_DATA,
            system_bytes,
            body,
        }
    }

    pub fn control(session_id: u16, s_type: u8, system_bytes: u32) -> Self {
        Self {
            session_id,
            stream: 0,
            function: 0,
            wait_reply: false,
            s_type,
            system_bytes,
            body: Vec::new(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.s_type == STYPE_DATA
    }
}

/// Encode a message with its length prefix.
pub fn encode(msg: &HsmsMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + msg.body.len());
    out.extend_from_slice(&((10 + msg.body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&msg.session_id.to_be_bytes());
    out.push(msg.stream | if msg.wait_reply { 0x80 } else { 0 });
    out.push(msg.function);
    out.push(0); // PType: SECS-II
    out.push(msg.s_type);
    out.extend_from_slice(&msg.system_bytes.to_be_bytes());
    out.extend_from_slice(&msg.body);
    out
}

/// Try to decode one message; returns the message and consumed byte count,
/// or `None` when more data is needed.
pub fn decode(buf: &[u8]) -> Result<Option<(HsmsMessage, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length < 10 {
        return Err(GatewayError::Protocol(format!(
            "invalid HSMS message length: {length}"
        )));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    let header = &buf[4..14];
    let msg = HsmsMessage {
        session_id: u16::from_be_bytes([header[0], header[1]]),
        stream: header[2] & 0x7F,
        wait_reply: header[2] & 0x80 != 0,
        function: header[3],
        s_type: header[5],
        system_bytes: u32::from_be_bytes([header[6], header[7], header[8], header[9]]),
        body: buf[14..4 + length].to_vec(),
    };
    Ok(Some((msg, 4 + length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_data_message() {
        let msg = HsmsMessage::data(0x0102, 6, 11, true, 0xDEADBEEF, vec![1, 2, 3]);
        let encoded = encode(&msg);
        let (decoded, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_round_trip_control_message() {
        let msg = HsmsMessage::control(0xFFFF, STYPE_LINKTEST_REQ, 42);
        let (decoded, _) = decode(&encode(&msg)).unwrap().unwrap();
        assert_eq!(decoded.s_type, STYPE_LINKTEST_REQ);
        assert!(decoded.body.is_empty());
        assert!(!decoded.is_data());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&HsmsMessage::control(1, STYPE_SELECT_REQ, 1));
        assert!(decode(&encoded[..3]).unwrap().is_none());
        assert!(decode(&encoded[..10]).unwrap().is_none());
    }

    #[test]
    fn test_decode_two_messages_in_buffer() {
        let mut buf = encode(&HsmsMessage::control(1, STYPE_SELECT_REQ, 1));
        buf.extend(encode(&HsmsMessage::control(1, STYPE_SELECT_RSP, 1)));
        let (first, consumed) = decode(&buf).unwrap().unwrap();
        assert_eq!(first.s_type, STYPE_SELECT_REQ);
        let (second, _) = decode(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(second.s_type, STYPE_SELECT_RSP);
    }

    #[test]
    fn test_invalid_length() {
        let buf = [0, 0, 0, 2, 0, 0];
        assert!(decode(&buf).is_err());
    }
}
