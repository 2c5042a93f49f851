// Event payloads and small structured register values exchanged with the host

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::config::REGISTER_MAP_GENERAL;
use crate::errors::{ErrorCode, Severity};
use crate::protocol::Address;
use crate::registers::{Wire, WireReader};

/// Identifiers of unsolicited event messages
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum EventId {
    Print = 0x0001,
    Error = 0x0002,
    SequencerEvent = 0x0003,
}

impl EventId {
    pub fn address(self) -> Address {
        Address::new(REGISTER_MAP_GENERAL, self.into())
    }
}

/// Level tag carried in the flag byte of a print message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

// Emitted for every entry added to the error log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub code: ErrorCode,
    /// Highest severity since the last clear
    pub overall: Severity,
}

impl Wire for ErrorEvent {
    const SIZE: usize = 3;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.severity.into());
        out.push(self.code.into());
        out.push(self.overall.into());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            severity: Severity::from(bytes[0]),
            code: ErrorCode::from(bytes[1]),
            overall: Severity::from(bytes[2]),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerEventKind {
    Started = 1,
    Finished = 2,
    Aborted = 3,
    Received = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequencerEvent {
    pub event: SequencerEventKind,
    pub sequence_id: u16,
    pub sequence_tick: u32,
    pub tick: u32,
}

impl Wire for SequencerEvent {
    const SIZE: usize = 11;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.event.into());
        self.sequence_id.write_to(out);
        self.sequence_tick.write_to(out);
        self.tick.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        let event = reader.take::<u8>();
        Self {
            event: SequencerEventKind::try_from(event).unwrap_or(SequencerEventKind::Aborted),
            sequence_id: reader.take(),
            sequence_tick: reader.take(),
            tick: reader.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRevision {
    pub major: u8,
    pub minor: u8,
}

impl Wire for FirmwareRevision {
    const SIZE: usize = 2;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.major, self.minor]);
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            major: bytes[0],
            minor: bytes[1],
        }
    }
}

/// Buzzer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeepInput {
    pub frequency: u16,
    pub on_time_ms: u16,
    pub count: u8,
}

impl Wire for BeepInput {
    const SIZE: usize = 5;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.frequency.write_to(out);
        self.on_time_ms.write_to(out);
        out.push(self.count);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            frequency: reader.take(),
            on_time_ms: reader.take(),
            count: reader.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Wire for LedColor {
    const SIZE: usize = 3;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.red, self.green, self.blue]);
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            red: bytes[0],
            green: bytes[1],
            blue: bytes[2],
        }
    }
}
