// Error log and overall error state
//
// Every reported error is appended to a fixed-size ring, raises the overall
// severity if it is higher, and is forwarded to the host as an ERROR event.
// Severities of Major and above escalate through the registered callback so
// the firmware can stop the control loop.

use std::collections::VecDeque;

use num_enum::{FromPrimitive, IntoPrimitive};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::comm::MessageSender;
use crate::config::ERROR_LOG_LEN;
use crate::messages::{ErrorEvent, EventId};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None = 0,
    Warning = 1,
    Minor = 2,
    Major = 3,
    Critical = 4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive, IntoPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Unspecified = 0,
    WheelSpeed = 1,
    ManualStop = 2,
    Init = 3,
    Start = 4,
    ImuInit = 5,
    MotorRaceConditions = 6,
    FirmwareRaceCondition = 7,
    MotorComm = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub tick: u32,
    pub severity: Severity,
    pub code: ErrorCode,
}

type Escalation = Box<dyn Fn(Severity, ErrorCode) + Send + Sync>;

#[derive(Default)]
struct ErrorLog {
    entries: VecDeque<LogEntry>,
    state: Severity,
    tick: u32,
}

pub struct ErrorHandler {
    log: Mutex<ErrorLog>,
    sender: Option<MessageSender>,
    escalation: Mutex<Option<Escalation>>,
}

impl ErrorHandler {
    pub fn new(sender: Option<MessageSender>) -> Self {
        Self {
            log: Mutex::new(ErrorLog::default()),
            sender,
            escalation: Mutex::new(None),
        }
    }

    /// Called once per report of Major severity or worse
    pub fn on_escalation(&self, callback: impl Fn(Severity, ErrorCode) + Send + Sync + 'static) {
        *self.escalation.lock() = Some(Box::new(callback));
    }

    /// Tick stamped on subsequent log entries
    pub fn set_tick(&self, tick: u32) {
        self.log.lock().tick = tick;
    }

    pub fn report(&self, severity: Severity, code: ErrorCode) {
        let overall = {
            let mut log = self.log.lock();
            if log.entries.len() == ERROR_LOG_LEN {
                log.entries.pop_front();
            }
            let tick = log.tick;
            log.entries.push_back(LogEntry { tick, severity, code });
            log.state = log.state.max(severity);
            log.state
        };

        if severity >= Severity::Major {
            error!("Error {:?} ({:?}), overall state {:?}", code, severity, overall);
        } else {
            warn!("Error {:?} ({:?})", code, severity);
        }

        if let Some(sender) = &self.sender {
            sender.event(EventId::Error, &ErrorEvent { severity, code, overall });
        }

        if severity >= Severity::Major
            && let Some(callback) = self.escalation.lock().as_ref()
        {
            callback(severity, code);
        }
    }

    pub fn state(&self) -> Severity {
        self.log.lock().state
    }

    /// Entries oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.lock().entries.iter().copied().collect()
    }

    pub fn last(&self) -> Option<LogEntry> {
        self.log.lock().entries.back().copied()
    }

    /// Reset the overall state and empty the log
    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.entries.clear();
        log.state = Severity::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::registers::Wire;
    use std::sync::Arc;

    #[test]
    fn test_state_is_max_severity() {
        let handler = ErrorHandler::new(None);
        handler.report(Severity::Minor, ErrorCode::Unspecified);
        handler.report(Severity::Warning, ErrorCode::WheelSpeed);
        assert_eq!(handler.state(), Severity::Minor);

        handler.clear();
        assert_eq!(handler.state(), Severity::None);
        assert!(handler.entries().is_empty());
    }

    #[test]
    fn test_log_is_bounded() {
        let handler = ErrorHandler::new(None);
        for tick in 0..(ERROR_LOG_LEN as u32 + 10) {
            handler.set_tick(tick);
            handler.report(Severity::Warning, ErrorCode::ManualStop);
        }
        let entries = handler.entries();
        assert_eq!(entries.len(), ERROR_LOG_LEN);
        assert_eq!(entries[0].tick, 10);
        assert_eq!(handler.last().unwrap().tick, ERROR_LOG_LEN as u32 + 9);
    }

    #[test]
    fn test_event_sent_to_host() {
        let (sender, mut rx) = MessageSender::channel(4);
        let handler = ErrorHandler::new(Some(sender));
        handler.report(Severity::Major, ErrorCode::MotorComm);

        let message = rx.try_recv().unwrap();
        assert_eq!(message.cmd, Command::Event);
        assert_eq!(message.address, EventId::Error.address());
        assert_eq!(
            ErrorEvent::read_from(&message.data),
            ErrorEvent {
                severity: Severity::Major,
                code: ErrorCode::MotorComm,
                overall: Severity::Major
            }
        );
    }

    #[test]
    fn test_escalation_only_from_major() {
        let escalated = Arc::new(Mutex::new(Vec::new()));
        let handler = ErrorHandler::new(None);
        let sink = Arc::clone(&escalated);
        handler.on_escalation(move |severity, code| sink.lock().push((severity, code)));

        handler.report(Severity::Minor, ErrorCode::WheelSpeed);
        handler.report(Severity::Critical, ErrorCode::Init);
        assert_eq!(*escalated.lock(), vec![(Severity::Critical, ErrorCode::Init)]);
    }

    #[test]
    fn test_unknown_codes_decode_to_default() {
        assert_eq!(Severity::from(9u8), Severity::None);
        assert_eq!(ErrorCode::from(200u8), ErrorCode::Unspecified);
    }
}
