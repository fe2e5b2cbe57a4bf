pub mod crc;
pub mod protocol;
pub mod reader;

pub use crc::{append_crc, crc16_modbus};
pub use protocol::{DecodeState, Frame, ReadRequest};
pub use reader::ModbusReader;
