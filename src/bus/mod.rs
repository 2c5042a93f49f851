// Motor buses
//
// Provides:
// - CAN-style bus with correlated request/response (pending-request table)
// - RS-485 Modbus master with a single in-flight query

pub mod can;
pub mod rs485;

pub use can::{spawn_receive_task, BusError, CanBus, CanFrame, CanTransmit};
pub use rs485::{ModbusMaster, QueryError, SerialLine, SerialPortLine};
