// Control and communication core of the BILBO two-wheeled balancing robot
//
// Host link: framed register-map protocol over serial, plus a bulk channel
// for trajectories and telemetry. Motors: SimplexMotion over CAN or RS-485.

pub mod bus;
pub mod comm;
pub mod config;
pub mod control;
pub mod drive;
pub mod errors;
pub mod estimation;
pub mod firmware;
pub mod messages;
pub mod protocol;
pub mod registers;
pub mod runtime;
pub mod sequencer;
pub mod sim;
pub mod supervisor;
pub mod telemetry;
