// Safety supervisor
//
// Runs on its own period, independent of the control task, and checks
// wheel speed, the stop button and drive liveness. Every violation stops
// Control; it stays stopped until the host sets a mode again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::comm::MessageSender;
use crate::config::DRIVE_LIVENESS_TIMEOUT;
use crate::control::{ControlManager, ControlMode};
use crate::drive::{DriveHandle, DriveStatus};
use crate::errors::{ErrorCode, ErrorHandler, Severity};

/// Physical stop button
pub trait StopButton: Send + Sync {
    /// True when the operator has let go of the button
    fn is_released(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    WheelSpeed,
    ManualStop,
    DriveError,
    DriveTimeout,
}

struct Liveness {
    last_tick: u32,
    last_change: Instant,
    latched: bool,
}

pub struct Supervisor {
    control: Arc<ControlManager>,
    drive: DriveHandle,
    errors: Arc<ErrorHandler>,
    sender: Option<MessageSender>,
    max_wheel_speed: Arc<Mutex<f32>>,
    button: Option<Box<dyn StopButton>>,
    liveness: Mutex<Liveness>,
}

impl Supervisor {
    pub fn new(
        control: Arc<ControlManager>,
        drive: DriveHandle,
        errors: Arc<ErrorHandler>,
        max_wheel_speed: Arc<Mutex<f32>>,
    ) -> Self {
        Self {
            control,
            drive,
            errors,
            sender: None,
            max_wheel_speed,
            button: None,
            liveness: Mutex::new(Liveness {
                last_tick: 0,
                last_change: Instant::now(),
                latched: false,
            }),
        }
    }

    pub fn with_sender(mut self, sender: MessageSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_button(self, button: impl StopButton + 'static) -> Self {
        self.with_boxed_button(Box::new(button))
    }

    pub fn with_boxed_button(mut self, button: Box<dyn StopButton>) -> Self {
        self.button = Some(button);
        self
    }

    /// rad/s, shared with the register map
    pub fn max_wheel_speed(&self) -> f32 {
        *self.max_wheel_speed.lock()
    }

    /// Run all checks once
    pub fn check(&self, now: Instant) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.control.mode() != ControlMode::Off {
            let max = self.max_wheel_speed();
            let speed = self.drive.speed();
            if speed.max_abs() > max {
                warn!("Wheel speed {:?} above limit {}", speed, max);
                self.violation(Violation::WheelSpeed, Severity::Warning, ErrorCode::WheelSpeed, "Max wheel speed detected");
                violations.push(Violation::WheelSpeed);
            }
        }

        let released = self.button.as_ref().is_some_and(|button| button.is_released());
        if released && self.control.mode() != ControlMode::Off {
            self.violation(Violation::ManualStop, Severity::Warning, ErrorCode::ManualStop, "Manual stop");
            violations.push(Violation::ManualStop);
        }

        if let Some(violation) = self.check_drive(now) {
            self.violation(violation, Severity::Critical, ErrorCode::MotorComm, "Motor communication lost");
            violations.push(violation);
        }

        violations
    }

    fn check_drive(&self, now: Instant) -> Option<Violation> {
        let status = self.drive.status();
        let tick = self.drive.tick();
        let mut liveness = self.liveness.lock();

        if tick != liveness.last_tick {
            liveness.last_tick = tick;
            liveness.last_change = now;
        }

        let violation = match status {
            DriveStatus::Idle => None,
            DriveStatus::Error => Some(Violation::DriveError),
            DriveStatus::Ok if now.duration_since(liveness.last_change) > DRIVE_LIVENESS_TIMEOUT => {
                Some(Violation::DriveTimeout)
            }
            DriveStatus::Ok => None,
        };

        match violation {
            Some(_) if liveness.latched => None,
            Some(v) => {
                liveness.latched = true;
                Some(v)
            }
            None => {
                if liveness.latched {
                    info!("Drive alive again");
                }
                liveness.latched = false;
                None
            }
        }
    }

    fn violation(&self, violation: Violation, severity: Severity, code: ErrorCode, text: &str) {
        warn!("Safety violation {:?}, stopping control", violation);
        self.control.stop();
        self.errors.report(severity, code);
        if let Some(sender) = &self.sender {
            sender.warning(text);
        }
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Supervisor running with period {:?}", period);
            let start = Instant::now();
            self.liveness.lock().last_change = start;
            let mut next = start;
            loop {
                self.check(Instant::now());
                next += period;
                sleep_until(next).await;
            }
        })
    }
}
