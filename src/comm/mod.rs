// Host communication
//
// Provides:
// - Frame transports (serial port, in-memory)
// - Serial command channel with register map dispatch
// - Bulk channel for trajectory upload and telemetry buffers

pub mod bulk;
pub mod channel;
pub mod transport;

pub use bulk::{BulkChannel, BulkHandle};
pub use channel::{CommandChannel, MessageSender, ProtocolError};
pub use transport::{memory_pair, MemoryTransport, SerialTransport, Transport, TransportError};
