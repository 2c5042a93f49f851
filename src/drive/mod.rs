// Wheel drive
//
// Provides:
// - `DriveMotor`, the capability set every motor backend implements
// - `Drive`, which owns both motors and runs the periodic exchange task
// - `DriveHandle`, the cloneable view Control and the Supervisor use
//
// Each shared value has its own lock, held only for the copy.

pub mod simplex;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::bus::{BusError, QueryError};
use crate::config::DRIVE_VOLTAGE_PERIOD;
use crate::errors::{ErrorCode, ErrorHandler, Severity};
use crate::registers::{Wire, WireReader};
use simplex::Mode;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MotorError {
    #[error("CAN error: {0}")]
    Can(#[from] BusError),

    #[error("Modbus error: {0}")]
    Modbus(#[from] QueryError),

    #[error("Register {register} answered {actual} bytes, expected {expected}")]
    ResponseLength {
        register: u16,
        expected: usize,
        actual: usize,
    },

    #[error("Register {register} reads back {read}, wrote {written}")]
    ReadBack { register: u16, written: u32, read: u32 },

    #[error("Motor in mode {actual:?}, expected {expected:?}")]
    ModeMismatch { expected: Mode, actual: Mode },

    #[error("Unknown motor mode {0}")]
    UnknownMode(u16),

    #[error("Register {0} has no Modbus address")]
    NoModbusAddress(u16),
}

/// One wheel motor
pub trait DriveMotor: Send + 'static {
    /// Speed refresh and torque output take turns instead of sharing a cycle
    const ALTERNATE_CYCLES: bool = false;

    fn init(&mut self) -> impl Future<Output = Result<(), MotorError>> + Send;

    fn start(&mut self) -> impl Future<Output = Result<(), MotorError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), MotorError>> + Send;

    /// Nm
    fn set_torque(&mut self, torque: f32) -> impl Future<Output = Result<(), MotorError>> + Send;

    /// rad/s
    fn read_speed(&mut self) -> impl Future<Output = Result<f32, MotorError>> + Send;

    fn check_motor(&mut self) -> impl Future<Output = Result<(), MotorError>> + Send;

    /// Supply voltage in V
    fn voltage(&mut self) -> impl Future<Output = Result<f32, MotorError>> + Send;
}

/// A value per wheel
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WheelPair {
    pub left: f32,
    pub right: f32,
}

impl WheelPair {
    pub const ZERO: Self = Self { left: 0.0, right: 0.0 };

    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn max_abs(&self) -> f32 {
        self.left.abs().max(self.right.abs())
    }
}

impl Wire for WheelPair {
    const SIZE: usize = 8;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.left.write_to(out);
        self.right.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            left: reader.take(),
            right: reader.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    Idle,
    Ok,
    Error,
}

#[derive(Debug)]
struct DriveShared {
    speed: Mutex<WheelPair>,
    voltage: Mutex<f32>,
    torque: Mutex<WheelPair>,
    status: Mutex<DriveStatus>,
    tick: AtomicU32,
    shutdown: AtomicBool,
}

/// Shared view of the drive state
#[derive(Debug, Clone)]
pub struct DriveHandle {
    shared: Arc<DriveShared>,
}

impl Default for DriveHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DriveShared {
                speed: Mutex::new(WheelPair::ZERO),
                voltage: Mutex::new(0.0),
                torque: Mutex::new(WheelPair::ZERO),
                status: Mutex::new(DriveStatus::Idle),
                tick: AtomicU32::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn speed(&self) -> WheelPair {
        *self.shared.speed.lock()
    }

    pub fn voltage(&self) -> f32 {
        *self.shared.voltage.lock()
    }

    /// Torque applied on the next output cycle
    pub fn set_torque(&self, torque: WheelPair) {
        *self.shared.torque.lock() = torque;
    }

    pub fn torque(&self) -> WheelPair {
        *self.shared.torque.lock()
    }

    pub fn status(&self) -> DriveStatus {
        *self.shared.status.lock()
    }

    /// Completed drive cycles
    pub fn tick(&self) -> u32 {
        self.shared.tick.load(Ordering::Relaxed)
    }

    /// Zero the torque and let the task stop the motors and exit
    pub fn shutdown(&self) {
        self.set_torque(WheelPair::ZERO);
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    /// Resume exchanges after an error
    pub fn clear_error(&self) {
        let mut status = self.shared.status.lock();
        if *status == DriveStatus::Error {
            info!("Drive error cleared");
            *status = DriveStatus::Ok;
        }
    }

    fn set_status(&self, status: DriveStatus) {
        let mut current = self.shared.status.lock();
        if *current != status {
            info!("Drive status {:?} -> {:?}", *current, status);
            *current = status;
        }
    }

    fn set_speed(&self, speed: WheelPair) {
        *self.shared.speed.lock() = speed;
    }

    fn set_voltage(&self, voltage: f32) {
        *self.shared.voltage.lock() = voltage;
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_speed_for_test(&self, speed: WheelPair) {
        self.set_speed(speed);
    }

    #[cfg(test)]
    pub(crate) fn set_status_for_test(&self, status: DriveStatus) {
        self.set_status(status);
    }
}

pub struct Drive<M> {
    left: M,
    right: M,
    period: Duration,
    handle: DriveHandle,
}

impl<M: DriveMotor> Drive<M> {
    pub fn new(left: M, right: M, period: Duration) -> Self {
        Self {
            left,
            right,
            period,
            handle: DriveHandle::new(),
        }
    }

    pub fn handle(&self) -> DriveHandle {
        self.handle.clone()
    }

    pub async fn init(&mut self) -> Result<(), MotorError> {
        self.left.init().await?;
        self.right.init().await?;
        info!("Drive initialized");
        Ok(())
    }

    /// Check and start both motors, then hand them to the drive task
    pub async fn start(mut self, errors: Arc<ErrorHandler>) -> Result<JoinHandle<()>, MotorError> {
        self.left.check_motor().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.right.check_motor().await?;

        self.left.start().await?;
        self.right.start().await?;

        self.handle.set_status(DriveStatus::Ok);
        Ok(tokio::spawn(self.run(errors)))
    }

    async fn run(mut self, errors: Arc<ErrorHandler>) {
        info!("Drive task running with period {:?}", self.period);
        let mut next_voltage = Instant::now() + DRIVE_VOLTAGE_PERIOD;
        let mut speed_cycle = true;

        while !self.handle.is_shutdown() {
            let cycle_start = Instant::now();

            if self.handle.status() == DriveStatus::Ok {
                let result = if cycle_start >= next_voltage {
                    next_voltage = cycle_start + DRIVE_VOLTAGE_PERIOD;
                    self.refresh_voltage().await
                } else if M::ALTERNATE_CYCLES {
                    speed_cycle = !speed_cycle;
                    if speed_cycle {
                        self.apply_torque().await
                    } else {
                        self.refresh_speed().await
                    }
                } else {
                    match self.refresh_speed().await {
                        Ok(()) => self.apply_torque().await,
                        Err(e) => Err(e),
                    }
                };

                if let Err(e) = result {
                    warn!("Motor exchange failed: {}", e);
                    self.handle.set_status(DriveStatus::Error);
                    errors.report(Severity::Major, ErrorCode::MotorComm);
                    self.zero_torque().await;
                }
            } else if self.handle.status() == DriveStatus::Error {
                // the last commanded torque must not stay applied
                self.zero_torque().await;
            }

            if cycle_start.elapsed() > self.period {
                errors.report(Severity::Warning, ErrorCode::MotorRaceConditions);
            }

            self.handle.shared.tick.fetch_add(1, Ordering::Relaxed);
            sleep_until(cycle_start + self.period).await;
        }

        self.stop_motors().await;
    }

    async fn refresh_speed(&mut self) -> Result<(), MotorError> {
        let left = self.left.read_speed().await?;
        let right = self.right.read_speed().await?;
        self.handle.set_speed(WheelPair { left, right });
        Ok(())
    }

    async fn apply_torque(&mut self) -> Result<(), MotorError> {
        let torque = self.handle.torque();
        self.left.set_torque(torque.left).await?;
        self.right.set_torque(torque.right).await
    }

    async fn refresh_voltage(&mut self) -> Result<(), MotorError> {
        let voltage = self.left.voltage().await?;
        debug!("Supply voltage {:.2} V", voltage);
        self.handle.set_voltage(voltage);
        Ok(())
    }

    /// Best effort, each motor on its own
    async fn zero_torque(&mut self) {
        for motor in [&mut self.left, &mut self.right] {
            if let Err(e) = motor.set_torque(0.0).await {
                debug!("Failed to zero motor torque: {}", e);
            }
        }
    }

    async fn stop_motors(&mut self) {
        info!("Stopping drive");
        for motor in [&mut self.left, &mut self.right] {
            if let Err(e) = motor.set_torque(0.0).await {
                warn!("Failed to zero motor torque: {}", e);
            }
            if let Err(e) = motor.stop().await {
                warn!("Failed to stop motor: {}", e);
            }
        }
        self.handle.set_status(DriveStatus::Idle);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Motor with a scripted speed and optional failure
    #[derive(Clone, Default)]
    pub(crate) struct MockMotor {
        pub(crate) speed: Arc<Mutex<f32>>,
        pub(crate) torque: Arc<Mutex<f32>>,
        pub(crate) fail: Arc<AtomicBool>,
        pub(crate) started: Arc<AtomicBool>,
    }

    impl MockMotor {
        fn check(&self) -> Result<(), MotorError> {
            if self.fail.load(Ordering::Relaxed) {
                Err(MotorError::Can(BusError::Timeout { id: 1 }))
            } else {
                Ok(())
            }
        }
    }

    impl DriveMotor for MockMotor {
        async fn init(&mut self) -> Result<(), MotorError> {
            self.check()
        }

        async fn start(&mut self) -> Result<(), MotorError> {
            self.check()?;
            self.started.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), MotorError> {
            *self.torque.lock() = 0.0;
            Ok(())
        }

        async fn set_torque(&mut self, torque: f32) -> Result<(), MotorError> {
            self.check()?;
            *self.torque.lock() = torque;
            Ok(())
        }

        async fn read_speed(&mut self) -> Result<f32, MotorError> {
            self.check()?;
            Ok(*self.speed.lock())
        }

        async fn check_motor(&mut self) -> Result<(), MotorError> {
            self.check()
        }

        async fn voltage(&mut self) -> Result<f32, MotorError> {
            self.check()?;
            Ok(15.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_exchanges_speed_and_torque() {
        let (left, right) = (MockMotor::default(), MockMotor::default());
        *left.speed.lock() = 2.0;
        *right.speed.lock() = -1.0;
        let drive = Drive::new(left.clone(), right.clone(), Duration::from_millis(10));
        let handle = drive.handle();
        let task = drive.start(Arc::new(ErrorHandler::new(None))).await.unwrap();
        assert!(left.started.load(Ordering::Relaxed));

        handle.set_torque(WheelPair::new(0.1, -0.1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.speed(), WheelPair::new(2.0, -1.0));
        assert_eq!(*left.torque.lock(), 0.1);
        assert_eq!(*right.torque.lock(), -0.1);
        assert!(handle.tick() >= 4);
        assert_eq!(handle.status(), DriveStatus::Ok);

        tokio::time::sleep(DRIVE_VOLTAGE_PERIOD).await;
        assert_eq!(handle.voltage(), 15.0);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(*left.torque.lock(), 0.0);
        assert_eq!(handle.status(), DriveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_failure_flags_error() {
        let (left, right) = (MockMotor::default(), MockMotor::default());
        let drive = Drive::new(left.clone(), right, Duration::from_millis(10));
        let handle = drive.handle();
        let errors = Arc::new(ErrorHandler::new(None));
        let _task = drive.start(Arc::clone(&errors)).await.unwrap();

        left.fail.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.status(), DriveStatus::Error);
        assert_eq!(errors.state(), Severity::Major);
        assert_eq!(errors.last().unwrap().code, ErrorCode::MotorComm);

        // no retries while in error, only one report
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(errors.entries().len(), 1);

        left.fail.store(false, Ordering::Relaxed);
        handle.clear_error();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.status(), DriveStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_error_zeroes_motor_torque() {
        let (left, right) = (MockMotor::default(), MockMotor::default());
        let drive = Drive::new(left.clone(), right.clone(), Duration::from_millis(10));
        let handle = drive.handle();
        let _task = drive.start(Arc::new(ErrorHandler::new(None))).await.unwrap();

        handle.set_torque(WheelPair::new(0.3, 0.3));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*left.torque.lock(), 0.3);

        left.fail.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.status(), DriveStatus::Error);
        // the healthy motor is released right away
        assert_eq!(*right.torque.lock(), 0.0);

        // the failing one as soon as it answers again
        left.fail.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*left.torque.lock(), 0.0);
        assert_eq!(handle.status(), DriveStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_check_prevents_start() {
        let left = MockMotor::default();
        left.fail.store(true, Ordering::Relaxed);
        let drive = Drive::new(left, MockMotor::default(), Duration::from_millis(10));
        let handle = drive.handle();
        assert!(drive.start(Arc::new(ErrorHandler::new(None))).await.is_err());
        assert_eq!(handle.status(), DriveStatus::Idle);
    }
}
