// Discrete PID controller

/// Gains and optional limits. Limits are disabled when `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Sample time in seconds
    pub ts: f32,
    pub integral_limit: Option<f32>,
    pub output_limit: Option<f32>,
    /// Maximum output change per second
    pub rate_limit: Option<f32>,
}

impl PidConfig {
    pub fn new(kp: f32, ki: f32, kd: f32, ts: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            ts,
            integral_limit: None,
            output_limit: None,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pid {
    pub config: PidConfig,
    integral: f32,
    last_error: f32,
    last_output: f32,
}

impl Pid {
    pub fn new(config: PidConfig) -> Self {
        Self {
            config,
            integral: 0.0,
            last_error: 0.0,
            last_output: 0.0,
        }
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32, kd: f32) {
        self.config.kp = kp;
        self.config.ki = ki;
        self.config.kd = kd;
    }

    pub fn gains(&self) -> [f32; 3] {
        [self.config.kp, self.config.ki, self.config.kd]
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_output = 0.0;
    }

    pub fn update(&mut self, error: f32) -> f32 {
        let c = &self.config;
        let mut output = c.kp * error + c.ki * self.integral + c.kd / c.ts * (error - self.last_error);

        self.last_error = error;
        self.integral += c.ts * error;
        if let Some(limit) = c.integral_limit {
            self.integral = self.integral.clamp(-limit, limit);
        }

        if let Some(limit) = c.output_limit {
            output = output.clamp(-limit, limit);
        }

        if let Some(rate) = c.rate_limit {
            let max_step = rate * c.ts;
            output = output.clamp(self.last_output - max_step, self.last_output + max_step);
        }

        self.last_output = output;
        output
    }
}
