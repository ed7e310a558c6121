//! Byte-level codecs shared by the protocol drivers.

pub mod hsms;
pub mod modbus;
