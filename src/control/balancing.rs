// State-feedback balancing law
//
// Per wheel: u_i = K_i · [v, theta, theta_dot, psi_dot] + input_i
// where K_1 = K[0..4] and K_2 = K[4..8].

use crate::drive::WheelPair;
use crate::estimation::EstimatorState;

pub const DEFAULT_GAIN: [f32; 8] = [0.035, 0.06, 0.01, 0.009, 0.035, 0.06, 0.01, -0.009];

#[derive(Debug, Clone)]
pub struct BalancingControl {
    k: [f32; 8],
}

impl BalancingControl {
    pub fn new(k: [f32; 8]) -> Self {
        Self { k }
    }

    pub fn gain(&self) -> [f32; 8] {
        self.k
    }

    pub fn set_gain(&mut self, k: [f32; 8]) {
        self.k = k;
    }

    pub fn update(&self, state: &EstimatorState, input: WheelPair) -> WheelPair {
        let x = [state.v, state.theta, state.theta_dot, state.psi_dot];
        let dot = |k: &[f32]| k.iter().zip(x).map(|(k, x)| k * x).sum::<f32>();
        WheelPair {
            left: dot(&self.k[..4]) + input.left,
            right: dot(&self.k[4..]) + input.right,
        }
    }
}

impl Default for BalancingControl {
    fn default() -> Self {
        Self::new(DEFAULT_GAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_feedback() {
        let control = BalancingControl::new([1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, -4.0]);
        let state = EstimatorState {
            v: 1.0,
            theta: 0.5,
            theta_dot: 0.0,
            psi: 9.0,
            psi_dot: 0.25,
        };
        let output = control.update(&state, WheelPair::new(0.1, -0.1));
        assert!((output.left - 3.1).abs() < 1e-6);
        assert!((output.right - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_zero_state_passes_input() {
        let control = BalancingControl::default();
        let output = control.update(&EstimatorState::default(), WheelPair::new(0.2, 0.3));
        assert_eq!(output, WheelPair::new(0.2, 0.3));
    }
}
