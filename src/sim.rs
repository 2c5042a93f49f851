// Host simulation
//
// Emulates the register file of SimplexMotion motors on the CAN bus so the
// firmware runs on a workstation. Remote frames are answered with the
// register contents, data frames store them. A first-order wheel model turns
// the torque target into speed.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use crate::bus::{BusError, CanFrame, CanTransmit};
use crate::drive::DriveHandle;
use crate::drive::simplex::{Mode, register};
use crate::estimation::{Estimator, EstimatorState};

const SOFTWARE_REVISION: u16 = 0x0102;
const SUPPLY_VOLTAGE_RAW: u16 = 1500;

// Wheel model
const INERTIA: f32 = 0.01;
const DAMPING: f32 = 2.0;

pub const WHEEL_RADIUS: f32 = 0.055;
pub const TRACK_WIDTH: f32 = 0.2;

#[derive(Debug)]
struct MotorModel {
    registers: HashMap<u16, Vec<u8>>,
    /// Rotor speed in rad/s
    speed: f32,
}

impl MotorModel {
    fn new() -> Self {
        let mut registers = HashMap::new();
        registers.insert(register::SW_REV, SOFTWARE_REVISION.to_be_bytes().to_vec());
        registers.insert(register::VOLTAGE, SUPPLY_VOLTAGE_RAW.to_be_bytes().to_vec());
        registers.insert(register::MODE, u16::from(Mode::Off).to_be_bytes().to_vec());
        registers.insert(register::TORQUE_LIMIT, 0u16.to_be_bytes().to_vec());
        registers.insert(register::TARGET_INPUT, 0i32.to_be_bytes().to_vec());
        Self { registers, speed: 0.0 }
    }

    fn read_u16(&self, register: u16) -> u16 {
        match self.registers.get(&register) {
            Some(raw) if raw.len() >= 2 => u16::from_be_bytes([raw[0], raw[1]]),
            _ => 0,
        }
    }

    fn target(&self) -> i32 {
        match self.registers.get(&register::TARGET_INPUT) {
            Some(raw) if raw.len() == 4 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            _ => 0,
        }
    }

    fn read(&self, register: u16, len: usize) -> Vec<u8> {
        let mut value = if register == register::SPEED {
            let raw = (self.speed * 256.0 / (2.0 * PI)) as i16;
            raw.to_be_bytes().to_vec()
        } else {
            self.registers.get(&register).cloned().unwrap_or_default()
        };
        value.resize(len, 0);
        value
    }

    fn torque(&self) -> f32 {
        if self.read_u16(register::MODE) != u16::from(Mode::Torque) {
            return 0.0;
        }
        let limit = self.read_u16(register::TORQUE_LIMIT) as f32 / 1000.0;
        self.target() as f32 / 32767.0 * limit
    }

    fn advance(&mut self, dt: f32) {
        let acceleration = self.torque() / INERTIA - DAMPING * self.speed;
        self.speed += acceleration * dt;
    }
}

/// Simulated motors answering on the CAN bus
#[derive(Clone)]
pub struct SimulatedMotors {
    motors: Arc<Mutex<HashMap<u8, MotorModel>>>,
    replies: mpsc::UnboundedSender<CanFrame>,
}

impl SimulatedMotors {
    /// Motors with the given ids; replies come out of the returned receiver
    pub fn new(ids: &[u8]) -> (Self, mpsc::UnboundedReceiver<CanFrame>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let motors = ids.iter().map(|&id| (id, MotorModel::new())).collect();
        (
            Self {
                motors: Arc::new(Mutex::new(motors)),
                replies,
            },
            rx,
        )
    }

    /// Force the rotor speed of one motor, rad/s
    pub fn set_speed(&self, id: u8, speed: f32) {
        if let Some(motor) = self.motors.lock().get_mut(&id) {
            motor.speed = speed;
        }
    }

    pub fn speed(&self, id: u8) -> Option<f32> {
        self.motors.lock().get(&id).map(|motor| motor.speed)
    }

    /// Torque currently produced by one motor, Nm
    pub fn torque(&self, id: u8) -> Option<f32> {
        self.motors.lock().get(&id).map(MotorModel::torque)
    }

    pub fn mode(&self, id: u8) -> Option<u16> {
        self.motors.lock().get(&id).map(|motor| motor.read_u16(register::MODE))
    }

    /// Advance the wheel model of every motor
    pub fn advance(&self, dt: Duration) {
        let dt = dt.as_secs_f32();
        for motor in self.motors.lock().values_mut() {
            motor.advance(dt);
        }
    }

    pub fn spawn_dynamics(&self, period: Duration) -> JoinHandle<()> {
        let sim = self.clone();
        tokio::spawn(async move {
            debug!("Motor simulation running with period {:?}", period);
            let mut next = Instant::now();
            loop {
                sim.advance(period);
                next += period;
                sleep_until(next).await;
            }
        })
    }
}

impl CanTransmit for SimulatedMotors {
    fn transmit(&self, frame: &CanFrame) -> Result<(), BusError> {
        let motor_id = (frame.id >> 16) as u8;
        let register = frame.id as u16;

        let reply = {
            let mut motors = self.motors.lock();
            let Some(motor) = motors.get_mut(&motor_id) else {
                // nobody on the bus answers
                trace!("No simulated motor {} for 0x{:08X}", motor_id, frame.id);
                return Ok(());
            };
            if frame.remote {
                Some(CanFrame::data(frame.id, &motor.read(register, frame.len())))
            } else {
                motor.registers.insert(register, frame.payload().to_vec());
                None
            }
        };

        if let Some(reply) = reply {
            self.replies.send(reply).map_err(|_| BusError::Transmit {
                id: frame.id,
                reason: "receive queue closed".into(),
            })?;
        }
        Ok(())
    }
}

struct Heading {
    psi: f32,
    last: Option<Instant>,
}

/// Velocity and heading from the measured wheel speeds; pitch is not
/// observable and stays zero
pub struct WheelOdometry {
    drive: DriveHandle,
    wheel_radius: f32,
    track_width: f32,
    heading: Mutex<Heading>,
}

impl WheelOdometry {
    pub fn new(drive: DriveHandle) -> Self {
        Self {
            drive,
            wheel_radius: WHEEL_RADIUS,
            track_width: TRACK_WIDTH,
            heading: Mutex::new(Heading { psi: 0.0, last: None }),
        }
    }
}

impl Estimator for WheelOdometry {
    fn state(&self) -> EstimatorState {
        let speed = self.drive.speed();
        let v = self.wheel_radius * (speed.left + speed.right) / 2.0;
        let psi_dot = self.wheel_radius * (speed.right - speed.left) / self.track_width;

        let now = Instant::now();
        let mut heading = self.heading.lock();
        if let Some(last) = heading.last {
            heading.psi += psi_dot * now.duration_since(last).as_secs_f32();
        }
        heading.last = Some(now);

        EstimatorState {
            v,
            theta: 0.0,
            theta_dot: 0.0,
            psi: heading.psi,
            psi_dot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CanBus, spawn_receive_task};
    use crate::drive::DriveMotor;
    use crate::drive::simplex::{CanRegisters, SimplexConfig, SimplexMotion};

    fn motor(bus: &Arc<CanBus>, id: u8, direction: f32) -> SimplexMotion<CanRegisters> {
        SimplexMotion::new(
            CanRegisters::new(Arc::clone(bus), id),
            SimplexConfig {
                direction,
                torque_limit: 0.4,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_simplex_motion_against_simulation() {
        let (sim, frames) = SimulatedMotors::new(&[1, 2]);
        let bus = Arc::new(CanBus::new(sim.clone()));
        let _rx = spawn_receive_task(Arc::clone(&bus), frames);

        let mut left = motor(&bus, 1, -1.0);
        left.init().await.unwrap();
        left.check_motor().await.unwrap();
        left.start().await.unwrap();
        assert_eq!(sim.mode(1), Some(u16::from(Mode::Torque)));
        assert!((left.voltage().await.unwrap() - 15.0).abs() < 1e-3);

        left.set_torque(0.2).await.unwrap();
        // direction -1 flips the motor torque
        assert!((sim.torque(1).unwrap() + 0.2).abs() < 1e-3);

        sim.set_speed(1, 10.0);
        let speed = left.read_speed().await.unwrap();
        assert!((speed + 10.0).abs() < 0.05, "speed {}", speed);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_motor_times_out() {
        let (sim, frames) = SimulatedMotors::new(&[1]);
        let bus = Arc::new(CanBus::new(sim));
        let _rx = spawn_receive_task(Arc::clone(&bus), frames);

        let mut right = motor(&bus, 2, 1.0);
        assert!(right.init().await.is_err());
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_wheel_model_follows_torque() {
        let (sim, _frames) = SimulatedMotors::new(&[1]);
        {
            let mut motors = sim.motors.lock();
            let motor = motors.get_mut(&1).unwrap();
            motor.registers.insert(register::MODE, u16::from(Mode::Torque).to_be_bytes().to_vec());
            motor.registers.insert(register::TORQUE_LIMIT, 400u16.to_be_bytes().to_vec());
            motor.registers.insert(register::TARGET_INPUT, 32767i32.to_be_bytes().to_vec());
        }
        for _ in 0..500 {
            sim.advance(Duration::from_millis(10));
        }
        // steady state torque / (inertia * damping)
        let speed = sim.speed(1).unwrap();
        assert!((speed - 20.0).abs() < 0.1, "speed {}", speed);
    }

    #[test]
    fn test_odometry_turn_rate() {
        let drive = DriveHandle::new();
        drive.set_speed_for_test(crate::drive::WheelPair::new(-2.0, 2.0));
        let odometry = WheelOdometry::new(drive);
        let state = odometry.state();
        assert_eq!(state.v, 0.0);
        assert!((state.psi_dot - 2.0 * WHEEL_RADIUS * 2.0 / TRACK_WIDTH).abs() < 1e-6);
    }
}
