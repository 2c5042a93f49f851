// Control manager
//
// Status machine Idle -> Running -> {Idle, Error}. While Running the mode
// selects the law computing the wheel torques:
// - Off: zero output, external input cleared
// - Direct: external direct input passed through
// - Balancing: state feedback plus external balancing input and velocity trim
// - Velocity: forward/turn PID output fed into the balancing law
//
// Core state and external input have separate locks. Callbacks are invoked
// after every lock is released.

pub mod balancing;
pub mod pid;
pub mod velocity;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::drive::{DriveHandle, WheelPair};
use crate::estimation::{Estimator, EstimatorState};
use crate::registers::{Wire, WireReader};
pub use balancing::{BalancingControl, DEFAULT_GAIN};
pub use velocity::{VelocityControl, VelocityInput, VelocityIntegral, VicConfig};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Off = 0,
    Direct = 1,
    Balancing = 2,
    Velocity = 3,
}

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Error = -1,
    Idle = 0,
    Running = 1,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Control cannot start from {0:?}")]
    NotIdle(ControlStatus),

    #[error("Control is {0:?}, not running")]
    NotRunning(ControlStatus),

    #[error("Gain can only change in mode Off, current mode {0:?}")]
    ModeNotOff(ControlMode),

    #[error("External input is owned by the sequencer")]
    InputDisabled,
}

/// Gains exposed to the host and loaded from the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub k: [f32; 8],
    pub forward_pid: [f32; 3],
    pub turn_pid: [f32; 3],
    pub vic: VicConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_GAIN,
            forward_pid: [0.0; 3],
            turn_pid: [0.0; 3],
            vic: VicConfig::default(),
        }
    }
}

impl Wire for ControlConfig {
    const SIZE: usize = 32 + 12 + 12 + VicConfig::SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.k.write_to(out);
        self.forward_pid.write_to(out);
        self.turn_pid.write_to(out);
        self.vic.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            k: reader.take(),
            forward_pid: reader.take(),
            turn_pid: reader.take(),
            vic: reader.take(),
        }
    }
}

/// Inputs the host (or the sequencer) sets for each mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExternalInput {
    pub direct: WheelPair,
    pub balancing: WheelPair,
    pub velocity: VelocityInput,
}

impl Wire for ExternalInput {
    const SIZE: usize = 24;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.direct.write_to(out);
        self.balancing.write_to(out);
        self.velocity.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            direct: reader.take(),
            balancing: reader.take(),
            velocity: reader.take(),
        }
    }
}

/// Per-tick control record for telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlSample {
    pub status: ControlStatus,
    pub mode: ControlMode,
    pub input: ExternalInput,
    /// Torque before the limit
    pub demand: WheelPair,
    pub output: WheelPair,
}

impl Wire for ControlSample {
    const SIZE: usize = 2 + ExternalInput::SIZE + 16;

    fn write_to(&self, out: &mut Vec<u8>) {
        i8::from(self.status).write_to(out);
        u8::from(self.mode).write_to(out);
        self.input.write_to(out);
        self.demand.write_to(out);
        self.output.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            status: ControlStatus::try_from(reader.take::<i8>()).unwrap_or(ControlStatus::Error),
            mode: ControlMode::try_from(reader.take::<u8>()).unwrap_or_default(),
            input: reader.take(),
            demand: reader.take(),
            output: reader.take(),
        }
    }
}

struct ControlCore {
    status: ControlStatus,
    mode: ControlMode,
    balancing: BalancingControl,
    velocity: VelocityControl,
    vic: VelocityIntegral,
    demand: WheelPair,
    output: WheelPair,
    tick: u32,
}

impl ControlCore {
    fn reset_controllers(&mut self) {
        self.velocity.reset();
        self.vic.reset();
    }
}

type ModeCallback = Arc<dyn Fn(ControlMode) + Send + Sync>;
type StepCallback = Arc<dyn Fn(u32) + Send + Sync>;

pub struct ControlManager {
    core: Mutex<ControlCore>,
    input: Mutex<ExternalInput>,
    input_enabled: AtomicBool,
    estimator: Arc<dyn Estimator>,
    drive: DriveHandle,
    max_torque: f32,
    ts: f32,
    mode_callbacks: Mutex<Vec<ModeCallback>>,
    step_callbacks: Mutex<Vec<StepCallback>>,
}

impl ControlManager {
    /// `frequency` is the control rate in Hz
    pub fn new(
        config: &ControlConfig,
        estimator: Arc<dyn Estimator>,
        drive: DriveHandle,
        max_torque: f32,
        frequency: f32,
    ) -> Self {
        let ts = 1.0 / frequency;
        Self {
            core: Mutex::new(ControlCore {
                status: ControlStatus::Idle,
                mode: ControlMode::Off,
                balancing: BalancingControl::new(config.k),
                velocity: VelocityControl::new(config.forward_pid, config.turn_pid, ts),
                vic: VelocityIntegral::new(config.vic),
                demand: WheelPair::ZERO,
                output: WheelPair::ZERO,
                tick: 0,
            }),
            input: Mutex::new(ExternalInput::default()),
            input_enabled: AtomicBool::new(true),
            estimator,
            drive,
            max_torque,
            ts,
            mode_callbacks: Mutex::new(Vec::new()),
            step_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_mode_change(&self, callback: impl Fn(ControlMode) + Send + Sync + 'static) {
        self.mode_callbacks.lock().push(Arc::new(callback));
    }

    /// Called after every update with the new control tick
    pub fn on_step(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.step_callbacks.lock().push(Arc::new(callback));
    }

    pub fn start(&self) -> Result<(), ControlError> {
        let mut core = self.core.lock();
        if core.status != ControlStatus::Idle {
            return Err(ControlError::NotIdle(core.status));
        }
        core.status = ControlStatus::Running;
        info!("Control running");
        Ok(())
    }

    pub fn set_mode(&self, mode: ControlMode) -> Result<(), ControlError> {
        let previous = {
            let mut core = self.core.lock();
            if core.status != ControlStatus::Running {
                return Err(ControlError::NotRunning(core.status));
            }
            core.reset_controllers();
            std::mem::replace(&mut core.mode, mode)
        };
        *self.input.lock() = ExternalInput::default();

        if previous != mode {
            info!("Control mode {:?} -> {:?}", previous, mode);
            self.notify_mode_change(mode);
        }
        Ok(())
    }

    /// Switch to Off and zero the drive torque immediately
    pub fn stop(&self) {
        if let Err(e) = self.set_mode(ControlMode::Off) {
            debug!("Stop while not running: {}", e);
        }
        self.drive.set_torque(WheelPair::ZERO);
    }

    /// Enter Error; output stays zero until `recover` and `start`
    pub fn fail(&self) {
        let previous = {
            let mut core = self.core.lock();
            core.status = ControlStatus::Error;
            core.reset_controllers();
            core.output = WheelPair::ZERO;
            std::mem::replace(&mut core.mode, ControlMode::Off)
        };
        *self.input.lock() = ExternalInput::default();
        self.drive.set_torque(WheelPair::ZERO);
        warn!("Control failed");

        if previous != ControlMode::Off {
            self.notify_mode_change(ControlMode::Off);
        }
    }

    /// Error -> Idle
    pub fn recover(&self) {
        let mut core = self.core.lock();
        if core.status == ControlStatus::Error {
            core.status = ControlStatus::Idle;
            info!("Control recovered");
        }
    }

    /// Only accepted while running in mode Off
    pub fn set_balancing_gain(&self, k: [f32; 8]) -> Result<(), ControlError> {
        let mut core = self.core.lock();
        if core.status != ControlStatus::Running {
            return Err(ControlError::NotRunning(core.status));
        }
        if core.mode != ControlMode::Off {
            return Err(ControlError::ModeNotOff(core.mode));
        }
        core.balancing.set_gain(k);
        info!("Balancing gain set to {:?}", k);
        Ok(())
    }

    pub fn set_forward_pid(&self, gains: [f32; 3]) {
        self.core.lock().velocity.set_forward_gains(gains);
        debug!("Forward PID set to {:?}", gains);
    }

    pub fn set_turn_pid(&self, gains: [f32; 3]) {
        self.core.lock().velocity.set_turn_gains(gains);
        debug!("Turn PID set to {:?}", gains);
    }

    pub fn set_vic(&self, config: VicConfig) {
        let mut core = self.core.lock();
        core.vic = VelocityIntegral::new(config);
        debug!("Velocity integral trim set to {:?}", config);
    }

    /// Apply every gain regardless of state
    pub fn apply_configuration(&self, config: &ControlConfig) {
        let mut core = self.core.lock();
        core.balancing.set_gain(config.k);
        core.velocity.set_forward_gains(config.forward_pid);
        core.velocity.set_turn_gains(config.turn_pid);
        core.vic = VelocityIntegral::new(config.vic);
        core.reset_controllers();
    }

    pub fn configuration(&self) -> ControlConfig {
        let core = self.core.lock();
        ControlConfig {
            k: core.balancing.gain(),
            forward_pid: core.velocity.forward_gains(),
            turn_pid: core.velocity.turn_gains(),
            vic: core.vic.config,
        }
    }

    pub fn set_direct_input(&self, input: WheelPair) -> Result<(), ControlError> {
        self.update_input(|external| external.direct = input)
    }

    pub fn set_balancing_input(&self, input: WheelPair) -> Result<(), ControlError> {
        self.update_input(|external| external.balancing = input)
    }

    pub fn set_velocity_input(&self, input: VelocityInput) -> Result<(), ControlError> {
        self.update_input(|external| external.velocity = input)
    }

    /// Balancing input from a running trajectory, bypasses the input gate
    pub fn apply_sequence_input(&self, input: WheelPair) {
        self.input.lock().balancing = input;
    }

    pub fn disable_external_input(&self) {
        self.input_enabled.store(false, Ordering::Relaxed);
    }

    pub fn enable_external_input(&self) {
        self.input_enabled.store(true, Ordering::Relaxed);
    }

    pub fn external_input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> ControlMode {
        self.core.lock().mode
    }

    pub fn status(&self) -> ControlStatus {
        self.core.lock().status
    }

    pub fn tick(&self) -> u32 {
        self.core.lock().tick
    }

    pub fn output(&self) -> WheelPair {
        self.core.lock().output
    }

    /// Sum of all integrator magnitudes
    pub fn integrator_state(&self) -> f32 {
        let core = self.core.lock();
        core.velocity.integral() + core.vic.integral().abs()
    }

    pub fn max_torque(&self) -> f32 {
        self.max_torque
    }

    pub fn sample(&self) -> ControlSample {
        let input = *self.input.lock();
        let core = self.core.lock();
        ControlSample {
            status: core.status,
            mode: core.mode,
            input,
            demand: core.demand,
            output: core.output,
        }
    }

    /// One control tick: estimate, compute, limit, forward to the drive
    pub fn update(&self) -> WheelPair {
        let state = self.estimator.state();

        let (output, tick) = {
            let mut core = self.core.lock();
            let demand = match (core.status, core.mode) {
                (ControlStatus::Running, ControlMode::Direct) => self.input.lock().direct,
                (ControlStatus::Running, ControlMode::Balancing) => {
                    let input = self.input.lock().balancing;
                    self.step_balancing(&mut core, &state, input)
                }
                (ControlStatus::Running, ControlMode::Velocity) => {
                    let input = self.input.lock().velocity;
                    let balancing_input = core.velocity.update(input, state.v, state.psi_dot);
                    core.balancing.update(&state, balancing_input)
                }
                _ => {
                    *self.input.lock() = ExternalInput::default();
                    WheelPair::ZERO
                }
            };

            let output = WheelPair {
                left: demand.left.clamp(-self.max_torque, self.max_torque),
                right: demand.right.clamp(-self.max_torque, self.max_torque),
            };
            core.demand = demand;
            core.output = output;
            core.tick = core.tick.wrapping_add(1);
            (output, core.tick)
        };

        self.drive.set_torque(output);

        let callbacks = self.step_callbacks.lock().clone();
        for callback in callbacks {
            callback(tick);
        }
        output
    }

    fn step_balancing(&self, core: &mut ControlCore, state: &EstimatorState, input: WheelPair) -> WheelPair {
        let output = core.balancing.update(state, input);
        let trim = core.vic.update(state.v, 0.0, self.ts);
        WheelPair {
            left: output.left + trim,
            right: output.right + trim,
        }
    }

    fn update_input(&self, apply: impl FnOnce(&mut ExternalInput)) -> Result<(), ControlError> {
        if !self.external_input_enabled() {
            return Err(ControlError::InputDisabled);
        }
        apply(&mut self.input.lock());
        Ok(())
    }

    fn notify_mode_change(&self, mode: ControlMode) {
        let callbacks = self.mode_callbacks.lock().clone();
        for callback in callbacks {
            callback(mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::FixedEstimator;
    use proptest::prelude::*;

    fn manager(state: EstimatorState) -> (ControlManager, DriveHandle) {
        let drive = DriveHandle::new();
        let control = ControlManager::new(
            &ControlConfig::default(),
            Arc::new(FixedEstimator::new(state)),
            drive.clone(),
            0.4,
            100.0,
        );
        (control, drive)
    }

    #[test]
    fn test_start_only_from_idle() {
        let (control, _) = manager(EstimatorState::default());
        assert_eq!(
            control.set_mode(ControlMode::Balancing),
            Err(ControlError::NotRunning(ControlStatus::Idle))
        );
        control.start().unwrap();
        assert_eq!(control.start(), Err(ControlError::NotIdle(ControlStatus::Running)));

        control.fail();
        assert_eq!(control.start(), Err(ControlError::NotIdle(ControlStatus::Error)));
        control.recover();
        control.start().unwrap();
        assert_eq!(control.status(), ControlStatus::Running);
    }

    #[test]
    fn test_idle_output_is_zero() {
        let (control, drive) = manager(EstimatorState {
            theta: 0.5,
            ..Default::default()
        });
        control.set_direct_input(WheelPair::new(0.2, 0.2)).unwrap();
        assert_eq!(control.update(), WheelPair::ZERO);
        assert_eq!(drive.torque(), WheelPair::ZERO);
        assert_eq!(control.sample().input, ExternalInput::default());
        assert_eq!(control.tick(), 1);
    }

    #[test]
    fn test_direct_pass_through_is_limited() {
        let (control, drive) = manager(EstimatorState::default());
        control.start().unwrap();
        control.set_mode(ControlMode::Direct).unwrap();
        control.set_direct_input(WheelPair::new(0.1, -0.9)).unwrap();
        assert_eq!(control.update(), WheelPair::new(0.1, -0.4));
        assert_eq!(drive.torque(), WheelPair::new(0.1, -0.4));
        assert_eq!(control.sample().demand, WheelPair::new(0.1, -0.9));
    }

    #[test]
    fn test_balancing_law() {
        let state = EstimatorState {
            theta: 1.0,
            ..Default::default()
        };
        let (control, _) = manager(state);
        control.start().unwrap();
        control.set_mode(ControlMode::Balancing).unwrap();
        control.set_balancing_input(WheelPair::new(0.01, 0.0)).unwrap();
        let output = control.update();
        assert!((output.left - (DEFAULT_GAIN[1] + 0.01)).abs() < 1e-6);
        assert!((output.right - DEFAULT_GAIN[5]).abs() < 1e-6);
    }

    #[test]
    fn test_gain_only_in_mode_off() {
        let (control, _) = manager(EstimatorState::default());
        assert!(control.set_balancing_gain([0.0; 8]).is_err());
        control.start().unwrap();
        control.set_mode(ControlMode::Balancing).unwrap();
        assert_eq!(
            control.set_balancing_gain([0.0; 8]),
            Err(ControlError::ModeNotOff(ControlMode::Balancing))
        );
        control.stop();
        control.set_balancing_gain([1.0; 8]).unwrap();
        assert_eq!(control.configuration().k, [1.0; 8]);
    }

    #[test]
    fn test_stop_zeroes_drive() {
        let (control, drive) = manager(EstimatorState::default());
        control.start().unwrap();
        control.set_mode(ControlMode::Direct).unwrap();
        control.set_direct_input(WheelPair::new(0.2, 0.2)).unwrap();
        control.update();
        assert_eq!(drive.torque(), WheelPair::new(0.2, 0.2));

        control.stop();
        assert_eq!(control.mode(), ControlMode::Off);
        assert_eq!(drive.torque(), WheelPair::ZERO);
        assert_eq!(control.update(), WheelPair::ZERO);
    }

    #[test]
    fn test_input_gate() {
        let (control, _) = manager(EstimatorState::default());
        control.start().unwrap();
        control.set_mode(ControlMode::Balancing).unwrap();
        control.disable_external_input();
        assert_eq!(
            control.set_balancing_input(WheelPair::new(0.1, 0.1)),
            Err(ControlError::InputDisabled)
        );
        control.apply_sequence_input(WheelPair::new(0.1, 0.1));
        assert_eq!(control.sample().input.balancing, WheelPair::new(0.1, 0.1));
        control.enable_external_input();
        assert!(control.set_balancing_input(WheelPair::ZERO).is_ok());
    }

    #[test]
    fn test_callbacks() {
        let (control, _) = manager(EstimatorState::default());
        let modes = Arc::new(Mutex::new(Vec::new()));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&modes);
        control.on_mode_change(move |mode| sink.lock().push(mode));
        let sink = Arc::clone(&ticks);
        control.on_step(move |tick| sink.lock().push(tick));

        control.start().unwrap();
        control.set_mode(ControlMode::Velocity).unwrap();
        control.set_mode(ControlMode::Velocity).unwrap();
        control.update();
        control.update();
        control.fail();

        assert_eq!(*modes.lock(), vec![ControlMode::Velocity, ControlMode::Off]);
        assert_eq!(*ticks.lock(), vec![1, 2]);
    }

    #[test]
    fn test_configuration_wire_size() {
        let config = ControlConfig::default();
        let bytes = config.to_wire();
        assert_eq!(bytes.len(), 69);
        assert_eq!(ControlConfig::read_from(&bytes), config);
    }

    proptest! {
        #[test]
        fn mode_change_clears_integrators(
            modes in proptest::collection::vec(0u8..4, 1..8),
            v in -2.0f32..2.0,
            psi_dot in -2.0f32..2.0,
        ) {
            let (control, _) = manager(EstimatorState { v, psi_dot, ..Default::default() });
            control.apply_configuration(&ControlConfig {
                forward_pid: [0.1, 1.0, 0.0],
                turn_pid: [0.1, 1.0, 0.0],
                vic: VicConfig { enabled: true, ki: 1.0, max_error: 1.0, v_limit: 0.0 },
                ..Default::default()
            });
            control.start().unwrap();
            for mode in modes {
                control.set_velocity_input(VelocityInput { forward: 1.0, turn: -1.0 }).unwrap();
                for _ in 0..5 {
                    control.update();
                }
                control.set_mode(ControlMode::try_from(mode).unwrap()).unwrap();
                prop_assert_eq!(control.integrator_state(), 0.0);
            }
        }
    }
}
