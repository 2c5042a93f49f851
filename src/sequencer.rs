// Trajectory sequencer
//
// A sequence is announced with a descriptor (SEQUENCE_LOAD), its steps arrive
// over the bulk channel, and once loaded it can be started while Control is
// in the required mode. While running, each control tick feeds one step to
// the balancing input; external input is locked out until the sequence
// finishes or is aborted.
//
// The sequencer never calls into Control while holding its own lock: mode
// changes call back into `on_mode_change`.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::comm::{BulkHandle, MessageSender};
use crate::config::SEQUENCE_CAPACITY;
use crate::control::{ControlManager, ControlMode};
use crate::drive::WheelPair;
use crate::messages::{EventId, SequencerEvent, SequencerEventKind};
use crate::registers::{Wire, WireReader};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerMode {
    #[default]
    Idle = 0,
    Running = 1,
    Error = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceDescriptor {
    pub sequence_id: u16,
    /// Number of steps
    pub length: u16,
    pub require_control_mode: bool,
    pub wait_time_beginning: u16,
    pub wait_time_end: u16,
    pub control_mode: ControlMode,
    /// Mode Control switches to when the sequence finishes
    pub control_mode_end: ControlMode,
    pub loaded: bool,
}

impl Wire for SequenceDescriptor {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.sequence_id.write_to(out);
        self.length.write_to(out);
        self.require_control_mode.write_to(out);
        self.wait_time_beginning.write_to(out);
        self.wait_time_end.write_to(out);
        u8::from(self.control_mode).write_to(out);
        u8::from(self.control_mode_end).write_to(out);
        self.loaded.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            sequence_id: reader.take(),
            length: reader.take(),
            require_control_mode: reader.take(),
            wait_time_beginning: reader.take(),
            wait_time_end: reader.take(),
            control_mode: ControlMode::try_from(reader.take::<u8>()).unwrap_or_default(),
            control_mode_end: ControlMode::try_from(reader.take::<u8>()).unwrap_or_default(),
            loaded: reader.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrajectoryStep {
    pub step: u32,
    pub u_1: f32,
    pub u_2: f32,
}

impl Wire for TrajectoryStep {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.step.write_to(out);
        self.u_1.write_to(out);
        self.u_2.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            step: reader.take(),
            u_1: reader.take(),
            u_2: reader.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequencerSample {
    pub mode: SequencerMode,
    pub sequence_id: u16,
    pub sequence_tick: u32,
}

impl Wire for SequencerSample {
    const SIZE: usize = 7;

    fn write_to(&self, out: &mut Vec<u8>) {
        u8::from(self.mode).write_to(out);
        self.sequence_id.write_to(out);
        self.sequence_tick.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            mode: SequencerMode::try_from(reader.take::<u8>()).unwrap_or_default(),
            sequence_id: reader.take(),
            sequence_tick: reader.take(),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("Sequence {0} is running")]
    Busy(u16),

    #[error("Sequence needs an identifier != 0")]
    ZeroId,

    #[error("Sequence {id} too long: {length} steps ({max} max)")]
    TooLong { id: u16, length: u16, max: usize },

    #[error("Sequences in control mode {0:?} are not supported")]
    UnsupportedMode(ControlMode),

    #[error("Sequence {0} not received")]
    NotLoaded(u16),

    #[error("Cannot start sequence {requested}, sequence {loaded} is loaded")]
    WrongId { requested: u16, loaded: u16 },

    #[error("Sequence requires control mode {required:?}, current {current:?}")]
    WrongControlMode { required: ControlMode, current: ControlMode },

    #[error("No sequence waiting for an upload")]
    Unexpected,

    #[error("Received {received} steps, expected {expected}")]
    LengthMismatch { received: usize, expected: u16 },
}

#[derive(Default)]
struct SequencerState {
    mode: SequencerMode,
    descriptor: SequenceDescriptor,
    steps: Vec<TrajectoryStep>,
    sequence_tick: u32,
}

impl SequencerState {
    fn clear(&mut self) {
        self.descriptor = SequenceDescriptor::default();
        self.steps.clear();
        self.sequence_tick = 0;
    }
}

enum Step {
    Idle,
    Apply { input: Option<WheelPair>, started: Option<SequencerEvent> },
    Finish,
}

pub struct Sequencer {
    state: Mutex<SequencerState>,
    control: Arc<ControlManager>,
    bulk: BulkHandle,
    sender: Option<MessageSender>,
}

impl Sequencer {
    pub fn new(control: Arc<ControlManager>, bulk: BulkHandle, sender: Option<MessageSender>) -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            control,
            bulk,
            sender,
        }
    }

    /// Abort a running sequence whenever Control changes mode
    pub fn attach(self: &Arc<Self>) {
        let sequencer = Arc::downgrade(self);
        self.control.on_mode_change(move |mode| {
            if let Some(sequencer) = sequencer.upgrade() {
                sequencer.on_mode_change(mode);
            }
        });
    }

    pub fn mode(&self) -> SequencerMode {
        self.state.lock().mode
    }

    pub fn read(&self) -> SequenceDescriptor {
        self.state.lock().descriptor
    }

    pub fn sample(&self) -> SequencerSample {
        let state = self.state.lock();
        match state.mode {
            SequencerMode::Running => SequencerSample {
                mode: state.mode,
                sequence_id: state.descriptor.sequence_id,
                sequence_tick: state.sequence_tick,
            },
            mode => SequencerSample {
                mode,
                ..Default::default()
            },
        }
    }

    /// Accept a descriptor and arm the bulk channel for its steps
    pub fn load(&self, descriptor: SequenceDescriptor) -> Result<(), SequencerError> {
        let result = self.try_load(descriptor);
        match &result {
            Ok(()) => {
                debug!("Load sequence {} with length {}", descriptor.sequence_id, descriptor.length);
                self.bulk.expect_trajectory(descriptor.length);
            }
            Err(e) => self.report_error(e),
        }
        result
    }

    fn try_load(&self, descriptor: SequenceDescriptor) -> Result<(), SequencerError> {
        let mut state = self.state.lock();
        if state.mode == SequencerMode::Running {
            return Err(SequencerError::Busy(state.descriptor.sequence_id));
        }
        if descriptor.sequence_id == 0 {
            return Err(SequencerError::ZeroId);
        }
        if descriptor.length as usize > SEQUENCE_CAPACITY {
            return Err(SequencerError::TooLong {
                id: descriptor.sequence_id,
                length: descriptor.length,
                max: SEQUENCE_CAPACITY,
            });
        }
        if descriptor.control_mode != ControlMode::Balancing {
            return Err(SequencerError::UnsupportedMode(descriptor.control_mode));
        }

        state.clear();
        state.descriptor = SequenceDescriptor {
            loaded: false,
            ..descriptor
        };
        state.mode = SequencerMode::Idle;
        Ok(())
    }

    /// Completion of a bulk trajectory upload
    pub fn on_trajectory_received(&self, bytes: &[u8]) {
        let result = {
            let mut state = self.state.lock();
            let expected = state.descriptor.length;
            let received = bytes.len() / TrajectoryStep::SIZE;
            if state.descriptor.sequence_id == 0 {
                Err(SequencerError::Unexpected)
            } else if received != expected as usize {
                Err(SequencerError::LengthMismatch { received, expected })
            } else {
                if state.descriptor.loaded {
                    warn!("Sequence {} received again", state.descriptor.sequence_id);
                }
                state.steps = bytes
                    .chunks_exact(TrajectoryStep::SIZE)
                    .map(TrajectoryStep::read_from)
                    .collect();
                state.descriptor.loaded = true;
                Ok(state.descriptor.sequence_id)
            }
        };

        match result {
            Ok(id) => {
                info!("Sequence {} received", id);
                self.send_event(SequencerEventKind::Received, id, 0);
            }
            Err(e) => self.report_error(&e),
        }
    }

    pub fn start(&self, id: u16) -> Result<(), SequencerError> {
        let current = self.control.mode();
        let result = {
            let mut state = self.state.lock();
            let descriptor = state.descriptor;
            if state.mode == SequencerMode::Running {
                Err(SequencerError::Busy(descriptor.sequence_id))
            } else if !descriptor.loaded {
                Err(SequencerError::NotLoaded(id))
            } else if descriptor.control_mode != current {
                Err(SequencerError::WrongControlMode {
                    required: descriptor.control_mode,
                    current,
                })
            } else if descriptor.sequence_id != id {
                Err(SequencerError::WrongId {
                    requested: id,
                    loaded: descriptor.sequence_id,
                })
            } else {
                state.mode = SequencerMode::Running;
                state.sequence_tick = 0;
                Ok(descriptor)
            }
        };

        match result {
            Ok(descriptor) => {
                self.control.disable_external_input();
                info!("Start sequence {} with length {}", id, descriptor.length);
                if let Some(sender) = &self.sender {
                    sender.info(&format!("Start sequence {} with length {}", id, descriptor.length));
                }
                Ok(())
            }
            Err(e) => {
                self.report_error(&e);
                Err(e)
            }
        }
    }

    /// Advance by one control tick
    pub fn update(&self) {
        let tick = self.control.tick();
        let step = {
            let mut state = self.state.lock();
            if state.mode != SequencerMode::Running {
                Step::Idle
            } else if let Some(&current) = state
                .steps
                .get(state.sequence_tick as usize)
                .filter(|_| state.sequence_tick < state.descriptor.length as u32)
            {
                let started = (state.sequence_tick == 0).then(|| SequencerEvent {
                    event: SequencerEventKind::Started,
                    sequence_id: state.descriptor.sequence_id,
                    sequence_tick: 0,
                    tick,
                });
                let input = (state.descriptor.control_mode == ControlMode::Balancing)
                    .then(|| WheelPair::new(current.u_1, current.u_2));
                state.sequence_tick += 1;
                Step::Apply { input, started }
            } else {
                Step::Finish
            }
        };

        match step {
            Step::Idle => {}
            Step::Finish => self.finish(),
            Step::Apply { input, started } => {
                if let (Some(event), Some(sender)) = (started, &self.sender) {
                    sender.event(EventId::SequencerEvent, &event);
                }
                if let Some(input) = input {
                    self.control.apply_sequence_input(input);
                }
            }
        }
    }

    pub fn finish(&self) {
        let (descriptor, sequence_tick) = {
            let mut state = self.state.lock();
            state.mode = SequencerMode::Idle;
            let finished = (state.descriptor, state.sequence_tick);
            state.clear();
            finished
        };

        info!("Sequence {} finished", descriptor.sequence_id);
        if let Some(sender) = &self.sender {
            sender.info(&format!("Sequence {} finished", descriptor.sequence_id));
        }
        self.send_event(SequencerEventKind::Finished, descriptor.sequence_id, sequence_tick);

        if let Err(e) = self.control.set_mode(descriptor.control_mode_end) {
            warn!("Cannot switch to end mode {:?}: {}", descriptor.control_mode_end, e);
        }
        self.control.enable_external_input();
        self.control.apply_sequence_input(WheelPair::ZERO);
    }

    /// Abort any sequence and hand the inputs back to the host
    pub fn abort(&self) {
        let (descriptor, sequence_tick) = {
            let mut state = self.state.lock();
            state.mode = SequencerMode::Error;
            let aborted = (state.descriptor, state.sequence_tick);
            state.clear();
            aborted
        };
        self.bulk.cancel_trajectory();
        self.control.enable_external_input();
        self.control.apply_sequence_input(WheelPair::ZERO);

        warn!("Sequence {} aborted at step {}", descriptor.sequence_id, sequence_tick);
        if let Some(sender) = &self.sender {
            sender.warning(&format!("Sequence {} has been aborted", descriptor.sequence_id));
        }
        self.send_event(SequencerEventKind::Aborted, descriptor.sequence_id, sequence_tick);
    }

    pub fn on_mode_change(&self, mode: ControlMode) {
        if self.mode() == SequencerMode::Running {
            debug!("Control mode changed to {:?} during sequence", mode);
            self.abort();
        }
    }

    fn send_event(&self, event: SequencerEventKind, sequence_id: u16, sequence_tick: u32) {
        if let Some(sender) = &self.sender {
            let payload = SequencerEvent {
                event,
                sequence_id,
                sequence_tick,
                tick: self.control.tick(),
            };
            sender.event(EventId::SequencerEvent, &payload);
        }
    }

    fn report_error(&self, error: &SequencerError) {
        warn!("{}", error);
        if let Some(sender) = &self.sender {
            sender.error(&error.to_string());
        }
    }
}
