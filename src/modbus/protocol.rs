use super::crc::{append_crc, crc16_modbus};
use crate::utils::error::FrameDecodeError;

/// Largest register count a single read request may ask for.
pub const MAX_READ_QUANTITY: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Pending,
    Valid,
    ChecksumFailed,
    Malformed,
}

/// Raw bytes taken off the link. Decoding consumes it exactly once.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub state: DecodeState,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            state: DecodeState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u8,
    pub function: u8,
    pub start: u16,
    pub quantity: u16,
}

impl ReadRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut request = vec![self.address, self.function];
        request.extend_from_slice(&self.start.to_be_bytes());
        request.extend_from_slice(&self.quantity.to_be_bytes());
        append_crc(&mut request);
        request
    }

    /// Address + function + byte count + data + 2 CRC
    pub fn expected_response_len(&self) -> usize {
        5 + self.quantity as usize * 2
    }

    /// Validates length, CRC, address, function code and byte count, then
    /// returns the register words.
    pub fn decode_response(&self, frame: &mut Frame) -> Result<Vec<u16>, FrameDecodeError> {
        if frame.state != DecodeState::Pending {
            return Err(FrameDecodeError::Malformed("frame already consumed".to_string()));
        }

        let result = self.decode_bytes(&frame.bytes);
        frame.state = match &result {
            Ok(_) => DecodeState::Valid,
            Err(FrameDecodeError::ChecksumFailed { .. }) => DecodeState::ChecksumFailed,
            Err(_) => DecodeState::Malformed,
        };
        result
    }

    fn decode_bytes(&self, bytes: &[u8]) -> Result<Vec<u16>, FrameDecodeError> {
        // Exception responses are five bytes long
        if bytes.len() >= 5 && bytes[1] == self.function | EXCEPTION_FLAG {
            check_crc(&bytes[..5])?;
            return Err(FrameDecodeError::Exception {
                function: self.function,
                code: bytes[2],
            });
        }

        let expected = self.expected_response_len();
        if bytes.len() < expected {
            return Err(FrameDecodeError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let frame = &bytes[..expected];
        check_crc(frame)?;

        if frame[0] != self.address {
            return Err(FrameDecodeError::Malformed(format!(
                "response from address {} while polling {}",
                frame[0], self.address
            )));
        }
        if frame[1] != self.function {
            return Err(FrameDecodeError::Malformed(format!(
                "unexpected function code 0x{:02x}",
                frame[1]
            )));
        }
        if frame[2] as usize != self.quantity as usize * 2 {
            return Err(FrameDecodeError::Malformed(format!(
                "byte count {} for {} registers",
                frame[2], self.quantity
            )));
        }

        Ok(frame[3..expected - 2]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

fn check_crc(frame: &[u8]) -> Result<(), FrameDecodeError> {
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let expected = crc16_modbus(&frame[..data_len]);
    if received != expected {
        return Err(FrameDecodeError::ChecksumFailed { expected, received });
    }
    Ok(())
}

/// Builds a well-formed read response, as a meter would send it.
pub fn encode_read_response(address: u8, function: u8, words: &[u16]) -> Vec<u8> {
    let mut response = vec![address, function, (words.len() * 2) as u8];
    for word in words {
        response.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut response);
    response
}
