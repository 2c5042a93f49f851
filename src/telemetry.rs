// Per-tick telemetry samples, collected into fixed-size buffers that the
// bulk channel serves to the host

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{Level, debug, enabled, warn};

use crate::comm::BulkHandle;
use crate::control::ControlSample;
use crate::drive::WheelPair;
use crate::errors::Severity;
use crate::estimation::EstimatorState;
use crate::firmware::FirmwareState;
use crate::registers::{Wire, WireReader};
use crate::sequencer::SequencerSample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeneralSample {
    pub tick: u32,
    pub state: FirmwareState,
    pub error: Severity,
}

impl Wire for GeneralSample {
    const SIZE: usize = 6;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.tick.write_to(out);
        i8::from(self.state).write_to(out);
        u8::from(self.error).write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            tick: reader.take(),
            state: FirmwareState::try_from(reader.take::<i8>()).unwrap_or(FirmwareState::Error),
            error: Severity::from(reader.take::<u8>()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DriveSample {
    pub speed: WheelPair,
    pub voltage: f32,
}

impl Wire for DriveSample {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.speed.write_to(out);
        self.voltage.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            speed: reader.take(),
            voltage: reader.take(),
        }
    }
}

/// One control tick worth of state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub general: GeneralSample,
    pub control: ControlSample,
    pub estimation: EstimatorState,
    pub drive: DriveSample,
    pub sequencer: SequencerSample,
}

impl Wire for Sample {
    const SIZE: usize =
        GeneralSample::SIZE + ControlSample::SIZE + EstimatorState::SIZE + DriveSample::SIZE + SequencerSample::SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.general.write_to(out);
        self.control.write_to(out);
        self.estimation.write_to(out);
        self.drive.write_to(out);
        self.sequencer.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            general: reader.take(),
            control: reader.take(),
            estimation: reader.take(),
            drive: reader.take(),
            sequencer: reader.take(),
        }
    }
}

pub struct Telemetry {
    buffer: Mutex<Vec<Sample>>,
    capacity: usize,
    bulk: BulkHandle,
}

impl Telemetry {
    pub fn new(capacity: usize, bulk: BulkHandle) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize);
        Self {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            bulk,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples collected since the last publish
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Append a sample; a full buffer is handed to the bulk channel
    pub fn collect(&self, sample: Sample) {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push(sample);
            if buffer.len() < self.capacity {
                return;
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.capacity))
        };

        let mut bytes = Vec::with_capacity(full.len() * Sample::SIZE);
        for sample in &full {
            sample.write_to(&mut bytes);
        }
        self.bulk.publish_samples(full.len() as u16, bytes);

        if enabled!(Level::DEBUG) {
            match serde_json::to_string(&full) {
                Ok(json) => debug!("Telemetry buffer: {}", json),
                Err(e) => warn!("Cannot serialize telemetry buffer: {}", e),
            }
        }
    }
}
