// Serial message framing
//
// Layout (before COBS):
// [0x55, cmd, addr1, addr2, addr3, flag, len_hi, len_lo, data..., reserved]
//
// The trailing byte is reserved for a checksum and currently always 0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::cobs;

/// First byte of every message
pub const HEADER: u8 = 0x55;

/// Fixed number of non-payload bytes
pub const OVERHEAD: usize = 9;

/// Largest payload accepted in either direction
pub const MAX_DATA_LEN: usize = 128;

/// Message kinds exchanged with the host
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Command {
    Write = 0x01,
    Read = 0x02,
    Answer = 0x03,
    Stream = 0x04,
    Event = 0x05,
    Message = 0x06,
    Function = 0x07,
    Echo = 0x08,
}

/// Module byte plus 16-bit register key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub module: u8,
    pub register: u16,
}

impl Address {
    pub const fn new(module: u8, register: u16) -> Self {
        Self { module, register }
    }

    /// Build from the three raw address bytes
    pub fn from_bytes(a1: u8, a2: u8, a3: u8) -> Self {
        Self {
            module: a1,
            register: u16::from_be_bytes([a2, a3]),
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        let [hi, lo] = self.register.to_be_bytes();
        [self.module, hi, lo]
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Frame too short: {len} bytes")]
    TooShort { len: usize },

    #[error("Invalid header byte 0x{0:02X}")]
    BadHeader(u8),

    #[error("Declared payload length {declared} does not match frame of {frame} bytes")]
    LengthMismatch { declared: usize, frame: usize },

    #[error("Unknown command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// A single command, answer or event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cmd: Command,
    pub address: Address,
    pub flag: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(cmd: Command, address: Address, flag: u8, data: Vec<u8>) -> Self {
        Self {
            cmd,
            address,
            flag,
            data,
        }
    }

    /// Encoded size of this message before byte stuffing
    pub fn encoded_len(&self) -> usize {
        self.data.len() + OVERHEAD
    }

    /// Serialize into the fixed layout
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(MessageError::PayloadTooLarge(self.data.len()));
        }

        let mut buffer = Vec::with_capacity(self.encoded_len());
        buffer.push(HEADER);
        buffer.push(self.cmd.into());
        buffer.extend_from_slice(&self.address.to_bytes());
        buffer.push(self.flag);
        buffer.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&self.data);
        buffer.push(0);
        Ok(buffer)
    }

    /// Cheap structural validation, run before any field is trusted
    pub fn check(buffer: &[u8]) -> Result<()> {
        if buffer.len() < OVERHEAD {
            return Err(MessageError::TooShort { len: buffer.len() });
        }
        if buffer[0] != HEADER {
            return Err(MessageError::BadHeader(buffer[0]));
        }
        let declared = u16::from_be_bytes([buffer[6], buffer[7]]) as usize;
        if buffer.len() != declared + OVERHEAD {
            return Err(MessageError::LengthMismatch {
                declared,
                frame: buffer.len(),
            });
        }
        Ok(())
    }

    /// Parse a buffer produced by [`Message::encode`]
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        Self::check(buffer)?;

        let cmd = Command::try_from(buffer[1]).map_err(|_| MessageError::UnknownCommand(buffer[1]))?;
        let len = buffer.len() - OVERHEAD;
        if len > MAX_DATA_LEN {
            return Err(MessageError::PayloadTooLarge(len));
        }

        Ok(Self {
            cmd,
            address: Address::from_bytes(buffer[2], buffer[3], buffer[4]),
            flag: buffer[5],
            data: buffer[8..8 + len].to_vec(),
        })
    }

    /// Encode and byte-stuff, appending the frame delimiter
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut frame = cobs::encode(&self.encode()?);
        frame.push(cobs::DELIMITER);
        Ok(frame)
    }

    /// Reverse of [`Message::to_frame`]; the delimiter is optional
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        Self::decode(&cobs::decode(frame))
    }
}
