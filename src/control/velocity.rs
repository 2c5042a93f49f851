// Forward/turn velocity controller feeding the balancing law

use serde::{Deserialize, Serialize};

use super::pid::{Pid, PidConfig};
use crate::drive::WheelPair;
use crate::registers::{Wire, WireReader};

/// Velocity reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VelocityInput {
    /// m/s
    pub forward: f32,
    /// rad/s
    pub turn: f32,
}

impl Wire for VelocityInput {
    const SIZE: usize = 8;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.forward.write_to(out);
        self.turn.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            forward: reader.take(),
            turn: reader.take(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VelocityControl {
    forward: Pid,
    turn: Pid,
}

impl VelocityControl {
    pub fn new(forward: [f32; 3], turn: [f32; 3], ts: f32) -> Self {
        Self {
            forward: Pid::new(PidConfig::new(forward[0], forward[1], forward[2], ts)),
            turn: Pid::new(PidConfig::new(turn[0], turn[1], turn[2], ts)),
        }
    }

    pub fn set_forward_gains(&mut self, [kp, ki, kd]: [f32; 3]) {
        self.forward.set_gains(kp, ki, kd);
    }

    pub fn set_turn_gains(&mut self, [kp, ki, kd]: [f32; 3]) {
        self.turn.set_gains(kp, ki, kd);
    }

    pub fn forward_gains(&self) -> [f32; 3] {
        self.forward.gains()
    }

    pub fn turn_gains(&self) -> [f32; 3] {
        self.turn.gains()
    }

    /// Sum of the absolute PID integrators
    pub fn integral(&self) -> f32 {
        self.forward.integral().abs() + self.turn.integral().abs()
    }

    pub fn reset(&mut self) {
        self.forward.reset();
        self.turn.reset();
    }

    /// Balancing input for the measured forward speed and yaw rate
    pub fn update(&mut self, input: VelocityInput, v: f32, psi_dot: f32) -> WheelPair {
        let forward = self.forward.update(input.forward - v);
        let turn = self.turn.update(input.turn - psi_dot);
        WheelPair {
            left: forward / 2.0 + turn / 2.0,
            right: forward / 2.0 - turn / 2.0,
        }
    }
}

/// Velocity-integral trim settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VicConfig {
    pub enabled: bool,
    pub ki: f32,
    /// Clamp of the integrated velocity error
    pub max_error: f32,
    /// Above this speed the integrator is reset; 0 disables the check
    pub v_limit: f32,
}

impl Wire for VicConfig {
    const SIZE: usize = 13;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.enabled.write_to(out);
        self.ki.write_to(out);
        self.max_error.write_to(out);
        self.v_limit.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut reader = WireReader::new(bytes);
        Self {
            enabled: reader.take(),
            ki: reader.take(),
            max_error: reader.take(),
            v_limit: reader.take(),
        }
    }
}

/// Integrates the velocity error while balancing and adds the scaled
/// integral to both wheels
#[derive(Debug, Clone, Default)]
pub struct VelocityIntegral {
    pub config: VicConfig,
    integral: f32,
}

impl VelocityIntegral {
    pub fn new(config: VicConfig) -> Self {
        Self { config, integral: 0.0 }
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }

    pub fn update(&mut self, v: f32, v_ref: f32, ts: f32) -> f32 {
        let c = &self.config;
        if !c.enabled {
            return 0.0;
        }
        if c.v_limit != 0.0 && v.abs() > c.v_limit {
            self.integral = 0.0;
            return 0.0;
        }
        self.integral = (self.integral + (v - v_ref) * ts).clamp(-c.max_error, c.max_error);
        self.integral * c.ki
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_velocity_integral() {
        let mut vic = VelocityIntegral::new(VicConfig {
            enabled: true,
            ki: 2.0,
            max_error: 0.05,
            v_limit: 1.0,
        });
        assert!((vic.update(0.5, 0.0, 0.01) - 0.01).abs() < 1e-6);
        for _ in 0..100 {
            vic.update(0.5, 0.0, 0.01);
        }
        assert!((vic.integral() - 0.05).abs() < 1e-6);

        // too fast: integrator dropped
        assert_eq!(vic.update(1.5, 0.0, 0.01), 0.0);
        assert_eq!(vic.integral(), 0.0);

        vic.config.enabled = false;
        assert_eq!(vic.update(0.5, 0.0, 0.01), 0.0);
    }

    #[test]
    fn test_forward_and_turn_split() {
        let mut control = VelocityControl::new([2.0, 0.0, 0.0], [1.0, 0.0, 0.0], 0.01);
        let output = control.update(VelocityInput { forward: 1.0, turn: 0.5 }, 0.5, 0.0);
        // forward = 1.0, turn = 0.5
        assert!((output.left - 0.75).abs() < 1e-6);
        assert!((output.right - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reset_zeroes_integrators() {
        let mut control = VelocityControl::new([0.0, 1.0, 0.0], [0.0, 1.0, 0.0], 0.01);
        control.update(VelocityInput { forward: 1.0, turn: 1.0 }, 0.0, 0.0);
        assert!(control.integral() > 0.0);
        control.reset();
        assert_eq!(control.integral(), 0.0);
    }
}
