// Periods, table sizes, register addresses and runtime configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::ControlConfig;

// Control loop frequency
pub const CONTROL_HZ: u64 = 100;

// Task periods
pub const CONTROL_PERIOD: Duration = Duration::from_millis(1000 / CONTROL_HZ);
pub const SUPERVISOR_PERIOD: Duration = Duration::from_millis(50);
pub const DRIVE_PERIOD: Duration = Duration::from_millis(10);

// Drive refreshes the supply voltage on this slower cadence
pub const DRIVE_VOLTAGE_PERIOD: Duration = Duration::from_secs(2);

// Supervisor flags the drive as dead if its tick stalls this long
pub const DRIVE_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

// CAN request/response correlation
pub const CAN_PENDING_REQUESTS: usize = 16;
pub const CAN_REMOTE_TIMEOUT: Duration = Duration::from_millis(5);

// RS-485 poll task
pub const MODBUS_TIMEOUT: Duration = Duration::from_millis(20);
pub const MODBUS_QUEUE_DEPTH: usize = 8;

// Buffers
pub const SEQUENCE_CAPACITY: usize = 6000; // 60 s of steps at CONTROL_HZ
pub const SAMPLE_BUFFER_LEN: usize = 100; // 1 s of samples at CONTROL_HZ
pub const ERROR_LOG_LEN: usize = 100;
pub const PRINT_MAX_LEN: usize = 100;
pub const OUTBOX_DEPTH: usize = 64;

// Identification
pub const FIRMWARE_REVISION: [u8; 2] = [1, 0];
pub const BOARD_REVISION: u8 = 4;

// Host serial link
pub const HOST_PORT: &str = "/dev/ttyAMA0";
pub const HOST_BAUDRATE: u32 = 921_600;
pub const MOTOR_BAUDRATE: u32 = 115_200;

/// Module byte of the general register map
pub const REGISTER_MAP_GENERAL: u8 = 0x01;

/// Register addresses within the general map
pub mod address {
    pub const FIRMWARE_STATE: u16 = 0x01;
    pub const FIRMWARE_TICK: u16 = 0x02;
    pub const FIRMWARE_REVISION: u16 = 0x03;
    pub const DEBUG_FUNCTION: u16 = 0x04;
    pub const BEEP: u16 = 0x05;
    pub const BOARD_REVISION: u16 = 0x06;
    pub const EXTERNAL_LED: u16 = 0x07;
    pub const DEBUG_1: u16 = 0x08;
    pub const RESET: u16 = 0x09;

    pub const CONTROL_MODE: u16 = 0x10;
    pub const CONTROL_SET_MODE: u16 = 0x11;
    pub const CONTROL_SET_K: u16 = 0x12;
    pub const CONTROL_SET_FORWARD_PID: u16 = 0x13;
    pub const CONTROL_SET_TURN_PID: u16 = 0x14;
    pub const CONTROL_DIRECT_INPUT: u16 = 0x15;
    pub const CONTROL_BALANCING_INPUT: u16 = 0x16;
    pub const CONTROL_VELOCITY_INPUT: u16 = 0x17;
    pub const CONTROL_GET_CONFIGURATION: u16 = 0x18;
    pub const CONTROL_SET_VIC: u16 = 0x19;

    pub const MAX_WHEEL_SPEED: u16 = 0x20;
    pub const SEQUENCE_LOAD: u16 = 0x21;
    pub const SEQUENCE_START: u16 = 0x22;
    pub const SEQUENCE_STOP: u16 = 0x23;
    pub const SEQUENCE_READ: u16 = 0x24;
    pub const ERROR_STATE: u16 = 0x25;
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wheel motor wiring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    pub left_id: u8,
    pub right_id: u8,
    pub left_direction: i8,
    pub right_direction: i8,
    /// Nm, written to the motors at init and used to scale torque commands
    pub torque_limit: f32,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            left_id: 1,
            right_id: 2,
            left_direction: -1,
            right_direction: 1,
            torque_limit: 0.4,
        }
    }
}

/// Runtime configuration, loadable from a JSON file. Missing fields fall back
/// to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirmwareConfig {
    pub control_period_ms: u64,
    pub supervisor_period_ms: u64,
    pub drive_period_ms: u64,
    pub can_timeout_ms: u64,
    pub modbus_timeout_ms: u64,
    pub max_torque: f32,
    pub max_wheel_speed: f32,
    pub sample_buffer_len: usize,
    /// Answer successful writes with an empty acknowledgement
    pub ack_writes: bool,
    pub motors: MotorConfig,
    pub control: ControlConfig,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            control_period_ms: CONTROL_PERIOD.as_millis() as u64,
            supervisor_period_ms: SUPERVISOR_PERIOD.as_millis() as u64,
            drive_period_ms: DRIVE_PERIOD.as_millis() as u64,
            can_timeout_ms: CAN_REMOTE_TIMEOUT.as_millis() as u64,
            modbus_timeout_ms: MODBUS_TIMEOUT.as_millis() as u64,
            max_torque: 0.4,
            max_wheel_speed: 100.0,
            sample_buffer_len: SAMPLE_BUFFER_LEN,
            ack_writes: false,
            motors: MotorConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl FirmwareConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_millis(self.control_period_ms)
    }

    pub fn supervisor_period(&self) -> Duration {
        Duration::from_millis(self.supervisor_period_ms)
    }

    pub fn drive_period(&self) -> Duration {
        Duration::from_millis(self.drive_period_ms)
    }

    pub fn can_timeout(&self) -> Duration {
        Duration::from_millis(self.can_timeout_ms)
    }

    pub fn modbus_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus_timeout_ms)
    }

    /// Control frequency in Hz, derived from the period
    pub fn control_frequency(&self) -> f32 {
        1000.0 / self.control_period_ms.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: FirmwareConfig =
            serde_json::from_str(r#"{ "max_wheel_speed": 50.0, "motors": { "left_id": 3 } }"#).unwrap();
        assert_eq!(config.max_wheel_speed, 50.0);
        assert_eq!(config.motors.left_id, 3);
        assert_eq!(config.motors.right_id, 2);
        assert_eq!(config.control_period(), CONTROL_PERIOD);
        assert_eq!(config.control, ControlConfig::default());
    }

    #[test]
    fn test_control_frequency() {
        let config = FirmwareConfig::default();
        assert_eq!(config.control_frequency(), 100.0);
    }

    #[test]
    fn test_unknown_file_fails() {
        assert!(matches!(
            FirmwareConfig::load("/nonexistent/bilbo.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
