// Estimator interface
//
// Orientation and velocity estimation run elsewhere; the control loop only
// pulls the latest state once per tick.

use serde::Serialize;

use crate::registers::{Wire, WireReader};

/// Dynamic state of the robot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EstimatorState {
    /// Forward velocity in m/s
    pub v: f32,
    /// Pitch angle in rad
    pub theta: f32,
    /// Pitch rate in rad/s
    pub theta_dot: f32,
    /// Heading in rad
    pub psi: f32,
    /// Yaw rate in rad/s
    pub psi_dot: f32,
}

impl Wire for EstimatorState {
    const SIZE: usize = 20;

    fn write_to(&self, out: &mut Vec<u8>) {
        for value in [self.v, self.theta, self.theta_dot, self.psi, self.psi_dot] {
            value.write_to(out);
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            v: reader.take(),
            theta: reader.take(),
            theta_dot: reader.take(),
            psi: reader.take(),
            psi_dot: reader.take(),
        }
    }
}

pub trait Estimator: Send + Sync {
    fn state(&self) -> EstimatorState;
}

/// Estimator returning a value set from outside, used by host runs and tests
#[derive(Debug, Default)]
pub struct FixedEstimator {
    state: parking_lot::Mutex<EstimatorState>,
}

impl FixedEstimator {
    pub fn new(state: EstimatorState) -> Self {
        Self {
            state: parking_lot::Mutex::new(state),
        }
    }

    pub fn set(&self, state: EstimatorState) {
        *self.state.lock() = state;
    }
}

impl Estimator for FixedEstimator {
    fn state(&self) -> EstimatorState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_layout() {
        let state = EstimatorState {
            v: 1.0,
            psi_dot: -0.5,
            ..Default::default()
        };
        let bytes = state.to_wire();
        assert_eq!(bytes.len(), EstimatorState::SIZE);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[16..], &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn test_fixed_estimator_returns_last_state() {
        let estimator = FixedEstimator::default();
        assert_eq!(estimator.state(), EstimatorState::default());
        estimator.set(EstimatorState {
            theta: 0.2,
            ..Default::default()
        });
        assert_eq!(estimator.state().theta, 0.2);
    }
}
