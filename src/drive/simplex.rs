// SimplexMotion wheel motor
//
// The motor exposes a flat register space. Both bus backends address the same
// registers: CAN uses the register number directly in the identifier
// `(motor_id << 16) | register`, the Modbus interface is zero-based and uses
// `register - 1`. Multi-byte values are big-endian on both.

use std::f32::consts::PI;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, info};

use super::{DriveMotor, MotorError};
use crate::bus::{CanBus, ModbusMaster};

/// Register numbers (CAN numbering)
pub mod register {
    pub const SW_REV: u16 = 2;
    pub const HW_REV: u16 = 12;
    pub const VOLTAGE: u16 = 100;
    pub const SPEED: u16 = 202;
    pub const TORQUE_LIMIT: u16 = 204;
    pub const MODE: u16 = 400;
    pub const TARGET_INPUT: u16 = 450;
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Mode {
    Off = 0,
    Reset = 1,
    QuickStop = 5,
    SpeedRamp = 33,
    SpeedLowRamp = 34,
    Torque = 40,
    Beep = 60,
    Cogging = 110,
}

const BEEP_AMPLITUDE: i32 = 500;
const BEEP_DURATION: Duration = Duration::from_millis(150);

/// Raw register access for one motor
pub trait RegisterAccess: Send + Sync + 'static {
    /// Backends with a single in-flight query cannot refresh speed and
    /// apply torque in the same drive cycle
    const POLLED: bool;

    fn write(&self, register: u16, value: &[u8]) -> impl Future<Output = Result<(), MotorError>> + Send;

    fn read(&self, register: u16, len: u8) -> impl Future<Output = Result<Vec<u8>, MotorError>> + Send;
}

pub struct CanRegisters {
    bus: Arc<CanBus>,
    motor_id: u8,
}

impl CanRegisters {
    pub fn new(bus: Arc<CanBus>, motor_id: u8) -> Self {
        Self { bus, motor_id }
    }

    fn identifier(&self, register: u16) -> u32 {
        ((self.motor_id as u32) << 16) | register as u32
    }
}

impl RegisterAccess for CanRegisters {
    const POLLED: bool = false;

    async fn write(&self, register: u16, value: &[u8]) -> Result<(), MotorError> {
        Ok(self.bus.write(self.identifier(register), value)?)
    }

    async fn read(&self, register: u16, len: u8) -> Result<Vec<u8>, MotorError> {
        let frame = self.bus.read(self.identifier(register), len).await?;
        if frame.len() != len as usize {
            return Err(MotorError::ResponseLength {
                register,
                expected: len as usize,
                actual: frame.len(),
            });
        }
        Ok(frame.payload().to_vec())
    }
}

pub struct ModbusRegisters {
    master: ModbusMaster,
    slave_id: u8,
}

impl ModbusRegisters {
    pub fn new(master: ModbusMaster, slave_id: u8) -> Self {
        Self { master, slave_id }
    }
}

/// Zero-based Modbus address of a register
fn modbus_address(register: u16) -> Result<u16, MotorError> {
    register.checked_sub(1).ok_or(MotorError::NoModbusAddress(register))
}

impl RegisterAccess for ModbusRegisters {
    const POLLED: bool = true;

    async fn write(&self, register: u16, value: &[u8]) -> Result<(), MotorError> {
        let words: Vec<u16> = value
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect();
        Ok(self.master.write_registers(self.slave_id, modbus_address(register)?, &words).await?)
    }

    async fn read(&self, register: u16, len: u8) -> Result<Vec<u8>, MotorError> {
        let count = (len as u16).div_ceil(2);
        let words = self.master.read_registers(self.slave_id, modbus_address(register)?, count).await?;
        let mut bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
        bytes.truncate(len as usize);
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimplexConfig {
    /// +1 or -1, maps motor rotation to wheel rotation
    pub direction: f32,
    /// Nm
    pub torque_limit: f32,
}

pub struct SimplexMotion<R> {
    registers: R,
    config: SimplexConfig,
    mode: Mode,
}

impl<R: RegisterAccess> SimplexMotion<R> {
    pub fn new(registers: R, config: SimplexConfig) -> Self {
        Self {
            registers,
            config,
            mode: Mode::Off,
        }
    }

    /// Last mode confirmed by read-back
    pub fn mode(&self) -> Mode {
        self.mode
    }

    async fn read_u16(&self, register: u16) -> Result<u16, MotorError> {
        let raw = self.registers.read(register, 2).await?;
        match raw[..] {
            [high, low] => Ok(u16::from_be_bytes([high, low])),
            _ => Err(MotorError::ResponseLength {
                register,
                expected: 2,
                actual: raw.len(),
            }),
        }
    }

    pub async fn read_mode(&self) -> Result<Mode, MotorError> {
        let raw = self.read_u16(register::MODE).await?;
        Mode::try_from(raw).map_err(|_| MotorError::UnknownMode(raw))
    }

    /// Write the mode and confirm it by reading it back
    pub async fn set_mode(&mut self, mode: Mode) -> Result<(), MotorError> {
        self.registers
            .write(register::MODE, &u16::from(mode).to_be_bytes())
            .await?;
        let actual = self.read_mode().await?;
        if actual != mode {
            return Err(MotorError::ModeMismatch { expected: mode, actual });
        }
        debug!("Motor mode set to {:?}", mode);
        self.mode = mode;
        Ok(())
    }

    pub async fn set_target(&self, target: i32) -> Result<(), MotorError> {
        self.registers
            .write(register::TARGET_INPUT, &target.to_be_bytes())
            .await
    }

    pub async fn read_software_revision(&self) -> Result<u16, MotorError> {
        self.read_u16(register::SW_REV).await
    }

    /// Write the torque limit and confirm it by reading it back
    pub async fn set_torque_limit(&self, limit: f32) -> Result<(), MotorError> {
        let raw = (limit * 1000.0) as u16;
        self.registers
            .write(register::TORQUE_LIMIT, &raw.to_be_bytes())
            .await?;
        let actual = self.read_u16(register::TORQUE_LIMIT).await?;
        if actual != raw {
            return Err(MotorError::ReadBack {
                register: register::TORQUE_LIMIT,
                written: raw as u32,
                read: actual as u32,
            });
        }
        Ok(())
    }

    pub async fn beep(&mut self, amplitude: i32) -> Result<(), MotorError> {
        self.set_mode(Mode::Beep).await?;
        self.set_target(amplitude).await
    }
}

/// Target value for a torque in Nm, scaled to the configured limit
pub fn torque_to_raw(torque: f32, config: &SimplexConfig) -> i16 {
    (config.direction * torque / config.torque_limit * 32767.0) as i16
}

/// Wheel speed in rad/s from the raw speed register
pub fn raw_to_speed(raw: i16, config: &SimplexConfig) -> f32 {
    config.direction * 2.0 * PI * raw as f32 / 256.0
}

impl<R: RegisterAccess> DriveMotor for SimplexMotion<R> {
    const ALTERNATE_CYCLES: bool = R::POLLED;

    async fn init(&mut self) -> Result<(), MotorError> {
        self.read_mode().await?;
        let revision = self.read_software_revision().await?;
        info!("SimplexMotion software revision {}", revision);
        self.set_mode(Mode::Reset).await?;
        self.set_torque_limit(self.config.torque_limit).await
    }

    async fn start(&mut self) -> Result<(), MotorError> {
        self.set_target(0).await?;
        self.set_mode(Mode::Torque).await
    }

    async fn stop(&mut self) -> Result<(), MotorError> {
        self.set_target(0).await
    }

    async fn set_torque(&mut self, torque: f32) -> Result<(), MotorError> {
        if self.mode != Mode::Torque {
            return Err(MotorError::ModeMismatch {
                expected: Mode::Torque,
                actual: self.mode,
            });
        }
        self.set_target(torque_to_raw(torque, &self.config) as i32).await
    }

    async fn read_speed(&mut self) -> Result<f32, MotorError> {
        let raw = self.read_u16(register::SPEED).await? as i16;
        Ok(raw_to_speed(raw, &self.config))
    }

    async fn check_motor(&mut self) -> Result<(), MotorError> {
        self.read_mode().await?;
        self.beep(BEEP_AMPLITUDE).await?;
        tokio::time::sleep(BEEP_DURATION).await;
        self.stop().await
    }

    async fn voltage(&mut self) -> Result<f32, MotorError> {
        Ok(self.read_u16(register::VOLTAGE).await? as f32 * 0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    /// In-memory register file; optionally refuses to store a register
    #[derive(Default)]
    struct FakeRegisters {
        values: Mutex<HashMap<u16, Vec<u8>>>,
        frozen: Vec<u16>,
    }

    impl RegisterAccess for FakeRegisters {
        const POLLED: bool = false;

        async fn write(&self, register: u16, value: &[u8]) -> Result<(), MotorError> {
            if !self.frozen.contains(&register) {
                self.values.lock().insert(register, value.to_vec());
            }
            Ok(())
        }

        async fn read(&self, register: u16, len: u8) -> Result<Vec<u8>, MotorError> {
            let values = self.values.lock();
            Ok(values
                .get(&register)
                .cloned()
                .unwrap_or_else(|| vec![0; len as usize]))
        }
    }

    const CONFIG: SimplexConfig = SimplexConfig {
        direction: -1.0,
        torque_limit: 0.4,
    };

    #[test]
    fn test_scaling() {
        assert_eq!(torque_to_raw(0.4, &CONFIG), -32767);
        assert_eq!(torque_to_raw(0.0, &CONFIG), 0);
        assert_eq!(torque_to_raw(-0.2, &CONFIG), 16383);
        assert!((raw_to_speed(256, &CONFIG) + 2.0 * PI).abs() < 1e-6);
    }

    #[test]
    fn test_modbus_addresses_are_zero_based() {
        assert_eq!(modbus_address(register::TARGET_INPUT), Ok(449));
        assert_eq!(modbus_address(register::SW_REV), Ok(1));
        assert_eq!(modbus_address(0), Err(MotorError::NoModbusAddress(0)));
    }

    #[tokio::test]
    async fn test_start_enables_torque_mode() {
        let mut motor = SimplexMotion::new(FakeRegisters::default(), CONFIG);
        assert!(matches!(motor.set_torque(0.1).await, Err(MotorError::ModeMismatch { .. })));

        motor.init().await.unwrap();
        assert_eq!(motor.mode(), Mode::Reset);
        motor.start().await.unwrap();
        assert_eq!(motor.mode(), Mode::Torque);

        motor.set_torque(0.2).await.unwrap();
        let target = motor.registers.values.lock()[&register::TARGET_INPUT].clone();
        assert_eq!(target, (-16383i32).to_be_bytes());
    }

    #[tokio::test]
    async fn test_mode_must_read_back() {
        let registers = FakeRegisters {
            frozen: vec![register::MODE],
            ..Default::default()
        };
        let mut motor = SimplexMotion::new(registers, CONFIG);
        assert_eq!(
            motor.set_mode(Mode::Torque).await,
            Err(MotorError::ModeMismatch {
                expected: Mode::Torque,
                actual: Mode::Off
            })
        );
        assert_eq!(motor.mode(), Mode::Off);
    }

    #[tokio::test]
    async fn test_torque_limit_must_read_back() {
        let registers = FakeRegisters {
            frozen: vec![register::TORQUE_LIMIT],
            ..Default::default()
        };
        let motor = SimplexMotion::new(registers, CONFIG);
        assert!(matches!(
            motor.set_torque_limit(0.4).await,
            Err(MotorError::ReadBack { written: 400, read: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_speed_and_voltage() {
        let registers = FakeRegisters::default();
        registers.values.lock().insert(register::SPEED, (-128i16).to_be_bytes().to_vec());
        registers.values.lock().insert(register::VOLTAGE, 1520u16.to_be_bytes().to_vec());
        let mut motor = SimplexMotion::new(registers, CONFIG);

        assert!((motor.read_speed().await.unwrap() - PI).abs() < 1e-6);
        assert!((motor.voltage().await.unwrap() - 15.2).abs() < 1e-4);
    }
}
