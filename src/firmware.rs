// Firmware assembly
//
// Owns the subsystems, populates the general register map and runs the
// control task. Start-up order: comm, estimation, control, drive, supervisor,
// sequencer, telemetry. A failing drive check halts start-up in Error.
//
// Per control tick: sequencer update -> control update -> telemetry -> tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::comm::{BulkChannel, BulkHandle, MessageSender};
use crate::config::{BOARD_REVISION, FIRMWARE_REVISION, FirmwareConfig, REGISTER_MAP_GENERAL, address};
use crate::control::{ControlConfig, ControlError, ControlManager, ControlMode, ControlStatus, VelocityInput, VicConfig};
use crate::drive::{Drive, DriveHandle, DriveMotor, MotorError, WheelPair};
use crate::errors::{ErrorCode, ErrorHandler, Severity};
use crate::estimation::Estimator;
use crate::messages::{BeepInput, FirmwareRevision, LedColor};
use crate::registers::{Function, Property, RegisterError, RegisterMap, Wire};
use crate::sequencer::{SequenceDescriptor, Sequencer, SequencerMode, TrajectoryStep};
use crate::supervisor::{StopButton, Supervisor};
use crate::telemetry::{DriveSample, GeneralSample, Sample, Telemetry};

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareState {
    Error = -1,
    Idle = 0,
    Running = 1,
    Reset = 2,
}

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("Register map: {0}")]
    Register(#[from] RegisterError),

    #[error("Motor: {0}")]
    Motor(#[from] MotorError),

    #[error("Control: {0}")]
    Control(#[from] ControlError),

    #[error("Firmware is {0:?}, expected Idle")]
    NotIdle(FirmwareState),
}

/// Buzzer and status LED
pub trait Indicator: Send + Sync {
    fn beep(&self, beep: BeepInput);

    fn set_led(&self, color: LedColor);
}

/// Indicator for boards without buzzer or LED, logs the requests
#[derive(Debug, Default)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn beep(&self, beep: BeepInput) {
        info!(
            "Beep {} Hz for {} ms, {} time(s)",
            beep.frequency, beep.on_time_ms, beep.count
        );
    }

    fn set_led(&self, color: LedColor) {
        info!("External LED set to ({}, {}, {})", color.red, color.green, color.blue);
    }
}

/// Task handles of a started firmware
pub struct FirmwareTasks {
    pub control: JoinHandle<()>,
    pub drive: JoinHandle<()>,
    pub supervisor: JoinHandle<()>,
}

pub struct Firmware {
    config: FirmwareConfig,
    state: Arc<Mutex<FirmwareState>>,
    tick: AtomicU32,
    shutdown: AtomicBool,
    sender: MessageSender,
    errors: Arc<ErrorHandler>,
    estimator: Arc<dyn Estimator>,
    control: Arc<ControlManager>,
    drive: DriveHandle,
    supervisor: Arc<Supervisor>,
    sequencer: Arc<Sequencer>,
    telemetry: Telemetry,
    bulk: BulkHandle,
    indicator: Arc<dyn Indicator>,
    max_wheel_speed: Arc<Mutex<f32>>,
    debug_1: Arc<Mutex<u8>>,
}

impl Firmware {
    pub fn new(
        config: FirmwareConfig,
        estimator: Arc<dyn Estimator>,
        drive: DriveHandle,
        sender: MessageSender,
        indicator: Arc<dyn Indicator>,
        button: Option<Box<dyn StopButton>>,
    ) -> Self {
        let state = Arc::new(Mutex::new(FirmwareState::Idle));
        let errors = Arc::new(ErrorHandler::new(Some(sender.clone())));
        let bulk = BulkHandle::new();

        let control = Arc::new(ControlManager::new(
            &config.control,
            Arc::clone(&estimator),
            drive.clone(),
            config.max_torque,
            config.control_frequency(),
        ));

        let max_wheel_speed = Arc::new(Mutex::new(config.max_wheel_speed));
        let mut supervisor = Supervisor::new(
            Arc::clone(&control),
            drive.clone(),
            Arc::clone(&errors),
            Arc::clone(&max_wheel_speed),
        )
        .with_sender(sender.clone());
        if let Some(button) = button {
            supervisor = supervisor.with_boxed_button(button);
        }

        let sequencer = Arc::new(Sequencer::new(Arc::clone(&control), bulk.clone(), Some(sender.clone())));
        sequencer.attach();

        let telemetry = Telemetry::new(config.sample_buffer_len, bulk.clone());

        // Major and above stop everything until the host resets
        {
            let state = Arc::clone(&state);
            let control = Arc::clone(&control);
            errors.on_escalation(move |severity, code| {
                error!("{:?} error {:?}, firmware entering Error", severity, code);
                set_state(&state, FirmwareState::Error);
                control.fail();
            });
        }

        Self {
            config,
            state,
            tick: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            sender,
            errors,
            estimator,
            control,
            drive,
            supervisor: Arc::new(supervisor),
            sequencer,
            telemetry,
            bulk,
            indicator,
            max_wheel_speed,
            debug_1: Arc::new(Mutex::new(0)),
        }
    }

    pub fn state(&self) -> FirmwareState {
        *self.state.lock()
    }

    pub fn tick(&self) -> u32 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn control(&self) -> &Arc<ControlManager> {
        &self.control
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn drive(&self) -> &DriveHandle {
        &self.drive
    }

    /// Bulk channel feeding uploaded trajectories to the sequencer
    pub fn bulk_channel(&self) -> BulkChannel {
        let sequencer = Arc::clone(&self.sequencer);
        BulkChannel::new(self.bulk.clone(), TrajectoryStep::SIZE, move |bytes| {
            sequencer.on_trajectory_received(bytes)
        })
    }

    /// Initialize and start the drive, then the periodic tasks
    pub async fn start<M: DriveMotor>(self: &Arc<Self>, mut drive: Drive<M>) -> Result<FirmwareTasks, FirmwareError> {
        let state = self.state();
        if state != FirmwareState::Idle {
            return Err(FirmwareError::NotIdle(state));
        }
        info!("Starting firmware {}.{}", FIRMWARE_REVISION[0], FIRMWARE_REVISION[1]);

        if let Err(e) = drive.init().await {
            self.halt(ErrorCode::Init, &format!("Drive init failed: {}", e));
            return Err(e.into());
        }

        self.control.start()?;

        let drive = match drive.start(Arc::clone(&self.errors)).await {
            Ok(task) => task,
            Err(e) => {
                self.halt(ErrorCode::Start, &format!("Drive start failed: {}", e));
                return Err(e.into());
            }
        };

        let supervisor = Arc::clone(&self.supervisor).spawn(self.config.supervisor_period());
        let control = tokio::spawn(Arc::clone(self).control_task());

        set_state(&self.state, FirmwareState::Running);
        self.sender.info("BILBO firmware running");
        self.indicator.beep(BeepInput {
            frequency: 800,
            on_time_ms: 250,
            count: 1,
        });

        Ok(FirmwareTasks {
            control,
            drive,
            supervisor,
        })
    }

    /// Stop the control task and the drive
    pub fn shutdown(&self) {
        info!("Firmware shutting down");
        self.shutdown.store(true, Ordering::Relaxed);
        self.control.stop();
        self.drive.shutdown();
    }

    /// Clear errors and bring control back up
    pub fn reset(&self) -> bool {
        info!("Firmware reset");
        set_state(&self.state, FirmwareState::Reset);

        if self.sequencer.mode() == SequencerMode::Running {
            self.sequencer.abort();
        }
        self.control.stop();
        self.errors.clear();
        self.drive.clear_error();
        self.control.recover();

        let ok = match self.control.status() {
            ControlStatus::Running => true,
            _ => self.control.start().is_ok(),
        };

        if ok {
            set_state(&self.state, FirmwareState::Running);
            self.sender.info("Firmware reset");
        } else {
            set_state(&self.state, FirmwareState::Error);
            self.sender.error("Firmware reset failed");
        }
        ok
    }

    /// Run one control tick
    pub fn step(&self) {
        self.sequencer.update();
        self.control.update();

        let tick = self.tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.errors.set_tick(tick);
        self.telemetry.collect(self.sample(tick));
    }

    fn sample(&self, tick: u32) -> Sample {
        Sample {
            general: GeneralSample {
                tick,
                state: self.state(),
                error: self.errors.state(),
            },
            control: self.control.sample(),
            estimation: self.estimator.state(),
            drive: DriveSample {
                speed: self.drive.speed(),
                voltage: self.drive.voltage(),
            },
            sequencer: self.sequencer.sample(),
        }
    }

    async fn control_task(self: Arc<Self>) {
        let period = self.config.control_period();
        info!("Control task running with period {:?}", period);
        let mut next = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            self.step();

            next += period;
            let now = Instant::now();
            if now > next {
                warn!("Control tick overran by {:?}", now - next);
                self.errors.report(Severity::Major, ErrorCode::FirmwareRaceCondition);
                next = now;
            }
            sleep_until(next).await;
        }
        info!("Control task stopped");
    }

    fn halt(&self, code: ErrorCode, text: &str) {
        error!("{}", text);
        self.errors.report(Severity::Critical, code);
        set_state(&self.state, FirmwareState::Error);
        self.sender.error(text);
        self.indicator.set_led(LedColor { red: 255, green: 0, blue: 0 });
        self.indicator.beep(BeepInput {
            frequency: 200,
            on_time_ms: 500,
            count: 3,
        });
    }

    /// General register map (module 0x01)
    pub fn register_map(self: &Arc<Self>) -> Result<RegisterMap, RegisterError> {
        let mut map = RegisterMap::new(REGISTER_MAP_GENERAL);

        let fw = Arc::clone(self);
        map.add(address::FIRMWARE_STATE, Property::readable(move || i8::from(fw.state())))?;
        let fw = Arc::clone(self);
        map.add(address::FIRMWARE_TICK, Property::readable(move || fw.tick()))?;
        map.add(
            address::FIRMWARE_REVISION,
            Property::readable(|| FirmwareRevision {
                major: FIRMWARE_REVISION[0],
                minor: FIRMWARE_REVISION[1],
            }),
        )?;
        map.add(address::DEBUG_FUNCTION, Function::new(|x: u8| x.wrapping_add(1)))?;
        let indicator = Arc::clone(&self.indicator);
        map.add(address::BEEP, Function::new(move |beep: BeepInput| indicator.beep(beep)))?;
        map.add(address::BOARD_REVISION, Property::readable(|| BOARD_REVISION))?;
        let indicator = Arc::clone(&self.indicator);
        map.add(address::EXTERNAL_LED, Function::new(move |color: LedColor| indicator.set_led(color)))?;
        map.add(address::DEBUG_1, Property::shared(Arc::clone(&self.debug_1)))?;
        let fw = Arc::clone(self);
        map.add(address::RESET, Function::new(move |()| u8::from(fw.reset())))?;

        self.add_control_registers(&mut map)?;
        self.add_sequencer_registers(&mut map)?;

        map.add(address::MAX_WHEEL_SPEED, Property::shared(Arc::clone(&self.max_wheel_speed)))?;
        let errors = Arc::clone(&self.errors);
        map.add(address::ERROR_STATE, Property::readable(move || u8::from(errors.state())))?;

        debug!("General register map with {} entries", map.len());
        Ok(map)
    }

    fn add_control_registers(&self, map: &mut RegisterMap) -> Result<(), RegisterError> {
        let control = Arc::clone(&self.control);
        map.add(address::CONTROL_MODE, Property::readable(move || u8::from(control.mode())))?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_SET_MODE,
            Function::new(move |raw: u8| {
                let result = ControlMode::try_from(raw)
                    .map_err(|_| format!("Unknown control mode {}", raw))
                    .and_then(|mode| control.set_mode(mode).map_err(|e| e.to_string()));
                accepted(result)
            }),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_SET_K,
            Function::new(move |k: [f32; 8]| accepted(control.set_balancing_gain(k))),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_SET_FORWARD_PID,
            Function::new(move |gains: [f32; 3]| {
                control.set_forward_pid(gains);
                1u8
            }),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_SET_TURN_PID,
            Function::new(move |gains: [f32; 3]| {
                control.set_turn_pid(gains);
                1u8
            }),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_DIRECT_INPUT,
            Property::writable(move |input: WheelPair| ignored(control.set_direct_input(input))),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_BALANCING_INPUT,
            Property::writable(move |input: WheelPair| ignored(control.set_balancing_input(input))),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_VELOCITY_INPUT,
            Property::writable(move |input: VelocityInput| ignored(control.set_velocity_input(input))),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_GET_CONFIGURATION,
            Function::new(move |()| -> ControlConfig { control.configuration() }),
        )?;

        let control = Arc::clone(&self.control);
        map.add(
            address::CONTROL_SET_VIC,
            Function::new(move |config: VicConfig| {
                control.set_vic(config);
                1u8
            }),
        )?;
        Ok(())
    }

    fn add_sequencer_registers(&self, map: &mut RegisterMap) -> Result<(), RegisterError> {
        let sequencer = Arc::clone(&self.sequencer);
        map.add(
            address::SEQUENCE_LOAD,
            Function::new(move |descriptor: SequenceDescriptor| u8::from(sequencer.load(descriptor).is_ok())),
        )?;

        let sequencer = Arc::clone(&self.sequencer);
        map.add(
            address::SEQUENCE_START,
            Function::new(move |id: u16| u8::from(sequencer.start(id).is_ok())),
        )?;

        let sequencer = Arc::clone(&self.sequencer);
        map.add(address::SEQUENCE_STOP, Function::new(move |()| sequencer.abort()))?;

        let sequencer = Arc::clone(&self.sequencer);
        map.add(address::SEQUENCE_READ, Function::new(move |()| sequencer.read()))?;
        Ok(())
    }
}

fn set_state(state: &Mutex<FirmwareState>, new: FirmwareState) {
    let mut current = state.lock();
    if *current != new {
        info!("Firmware state {:?} -> {:?}", *current, new);
        *current = new;
    }
}

fn accepted<E: std::fmt::Display>(result: Result<(), E>) -> u8 {
    match result {
        Ok(()) => 1,
        Err(e) => {
            debug!("Rejected: {}", e);
            0
        }
    }
}

fn ignored(result: Result<(), ControlError>) {
    if let Err(e) = result {
        debug!("Input ignored: {}", e);
    }
}
