// Host wire format
//
// Provides:
// - COBS byte stuffing
// - Fixed-header message encoding with cheap structural checks

pub mod cobs;
pub mod message;

pub use message::{Address, Command, Message, MessageError};
