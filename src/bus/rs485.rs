// Polled RS-485 bus (Modbus RTU master)
//
// Frame format: [slave_id, function, payload..., crc_lo, crc_hi]
//
// Only one query is on the wire at a time. Callers enqueue a query and park
// on a oneshot; the poll task sends it, waits for the reply frame with a
// timeout, validates it and completes the caller with the result.

use std::future::Future;
use std::io::{Read, Write};
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serialport::SerialPort;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MODBUS_QUEUE_DEPTH, MODBUS_TIMEOUT};

/// Replies shorter than this cannot be valid
pub const MIN_REPLY_LEN: usize = 6;

const EXCEPTION_BIT: u8 = 0x80;
const MAX_SLAVE_ID: u8 = 247;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum FunctionCode {
    ReadHoldingRegisters = 3,
    WriteSingleRegister = 6,
    WriteMultipleRegisters = 16,
}

/// Outcome of a failed query
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Timeout waiting for slave {id}")]
    Timeout { id: u8 },

    #[error("CRC mismatch in reply from slave {id}")]
    BadCrc { id: u8 },

    #[error("Reply from slave {id} has invalid size {len}")]
    BadSize { id: u8, len: usize },

    #[error("Slave {id} answered with exception 0x{code:02X}")]
    Exception { id: u8, code: u8 },

    #[error("Invalid slave id {0}")]
    BadSlaveId(u8),

    #[error("Unexpected function 0x{function:02X} in reply from slave {id}")]
    BadFunction { id: u8, function: u8 },

    #[error("Reply from slave {id} does not echo the request")]
    BadEcho { id: u8 },

    #[error("Line error: {0}")]
    Io(String),

    #[error("Poll task stopped")]
    Closed,
}

/// Half-duplex line delivering whole reply frames (split on inter-frame silence)
pub trait SerialLine: Send + 'static {
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;

    fn receive(&mut self) -> impl Future<Output = std::io::Result<Vec<u8>>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Read { id: u8, address: u16, count: u16 },
    Write { id: u8, address: u16, values: Vec<u16> },
}

impl Query {
    pub fn id(&self) -> u8 {
        match self {
            Query::Read { id, .. } | Query::Write { id, .. } => *id,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Query::Read { .. } => FunctionCode::ReadHoldingRegisters,
            Query::Write { values, .. } if values.len() == 1 => FunctionCode::WriteSingleRegister,
            Query::Write { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Request frame including CRC
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.id(), self.function().into()];
        match self {
            Query::Read { address, count, .. } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
            }
            Query::Write { address, values, .. } if values.len() == 1 => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&values[0].to_be_bytes());
            }
            Query::Write { address, values, .. } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
                frame.push((values.len() * 2) as u8);
                for value in values {
                    frame.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Validate a reply frame, returning the register values for reads
    pub fn parse_reply(&self, reply: &[u8]) -> Result<Vec<u16>, QueryError> {
        let id = self.id();
        if reply.len() < MIN_REPLY_LEN {
            return Err(QueryError::BadSize { id, len: reply.len() });
        }

        let (body, crc) = reply.split_at(reply.len() - 2);
        if crc16(body) != u16::from_le_bytes([crc[0], crc[1]]) {
            return Err(QueryError::BadCrc { id });
        }
        if body[0] != id {
            return Err(QueryError::BadSlaveId(body[0]));
        }

        let function = body[1];
        if function & EXCEPTION_BIT != 0 {
            return Err(QueryError::Exception { id, code: body[2] });
        }
        if function != u8::from(self.function()) {
            return Err(QueryError::BadFunction { id, function });
        }

        match self {
            Query::Read { count, .. } => {
                let byte_count = body[2] as usize;
                if byte_count != *count as usize * 2 || body.len() != 3 + byte_count {
                    return Err(QueryError::BadSize { id, len: reply.len() });
                }
                Ok(body[3..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect())
            }
            Query::Write { address, values, .. } => {
                if body.len() != 6 {
                    return Err(QueryError::BadSize { id, len: reply.len() });
                }
                // single writes echo the value, multiple writes the count
                let second = match values[..] {
                    [value] => value,
                    _ => values.len() as u16,
                };
                if body[2..4] != address.to_be_bytes() || body[4..6] != second.to_be_bytes() {
                    return Err(QueryError::BadEcho { id });
                }
                Ok(Vec::new())
            }
        }
    }
}

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF), sent low byte first
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

type QueryReply = oneshot::Sender<Result<Vec<u16>, QueryError>>;

/// Cloneable handle used by motors to talk through the poll task
#[derive(Debug, Clone)]
pub struct ModbusMaster {
    queue: mpsc::Sender<(Query, QueryReply)>,
}

impl ModbusMaster {
    /// Start the poll task on `line`
    pub fn spawn(line: impl SerialLine, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(MODBUS_QUEUE_DEPTH);
        let task = tokio::spawn(poll_task(line, rx, timeout));
        (Self { queue }, task)
    }

    pub fn spawn_default(line: impl SerialLine) -> (Self, JoinHandle<()>) {
        Self::spawn(line, MODBUS_TIMEOUT)
    }

    /// Enqueue a query and wait for its result
    pub async fn query(&self, query: Query) -> Result<Vec<u16>, QueryError> {
        let id = query.id();
        if id == 0 || id > MAX_SLAVE_ID {
            return Err(QueryError::BadSlaveId(id));
        }
        let (reply, rx) = oneshot::channel();
        self.queue.send((query, reply)).await.map_err(|_| QueryError::Closed)?;
        rx.await.map_err(|_| QueryError::Closed)?
    }

    pub async fn read_registers(&self, id: u8, address: u16, count: u16) -> Result<Vec<u16>, QueryError> {
        self.query(Query::Read { id, address, count }).await
    }

    pub async fn write_registers(&self, id: u8, address: u16, values: &[u16]) -> Result<(), QueryError> {
        self.query(Query::Write {
            id,
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }
}

async fn poll_task<L: SerialLine>(
    mut line: L,
    mut queue: mpsc::Receiver<(Query, QueryReply)>,
    timeout: Duration,
) {
    info!("Modbus poll task running, timeout {:?}", timeout);
    let mut errors: u32 = 0;

    while let Some((query, reply)) = queue.recv().await {
        let result = exchange(&mut line, &query, timeout).await;
        if let Err(e) = &result {
            errors = errors.wrapping_add(1);
            debug!("Modbus query failed ({} errors so far): {}", errors, e);
        }
        // the caller may have given up waiting
        let _ = reply.send(result);
    }
    debug!("Modbus query queue closed");
}

async fn exchange<L: SerialLine>(line: &mut L, query: &Query, timeout: Duration) -> Result<Vec<u16>, QueryError> {
    let id = query.id();
    line.send(&query.encode())
        .await
        .map_err(|e| QueryError::Io(e.to_string()))?;

    let frame = match tokio::time::timeout(timeout, line.receive()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => return Err(QueryError::Timeout { id }),
        Ok(Err(e)) => return Err(QueryError::Io(e.to_string())),
        Err(_) => return Err(QueryError::Timeout { id }),
    };

    query.parse_reply(&frame)
}

/// Longest Modbus RTU frame
pub const MAX_RTU_FRAME_LEN: usize = 256;

/// Blocking port underneath a [`SerialPortLine`]
pub trait LinePort: Read + Write + Send + 'static {
    /// Drop stale input before a new request goes out
    fn clear_input(&mut self) -> std::io::Result<()>;
}

impl LinePort for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(self.clear(serialport::ClearBuffer::Input)?)
    }
}

enum LineRequest {
    Send(Vec<u8>, oneshot::Sender<std::io::Result<()>>),
    Receive(oneshot::Sender<std::io::Result<Vec<u8>>>),
}

/// RS-485 line on a serial port. Port I/O runs on its own thread; reply
/// frames are delimited by the port's read timeout, which plays the role of
/// the inter-frame silence.
pub struct SerialPortLine {
    requests: mpsc::UnboundedSender<LineRequest>,
}

impl SerialPortLine {
    pub fn open(port_name: &str, baudrate: u32, silence: Duration) -> std::io::Result<Self> {
        info!("Opening RS-485 bus on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate).timeout(silence).open()?;
        Self::with_port(port)
    }

    pub fn with_port(port: impl LinePort) -> std::io::Result<Self> {
        let (requests, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("rs485-io".to_string())
            .spawn(move || serve_line(port, rx))?;
        Ok(Self { requests })
    }

    async fn request<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<std::io::Result<T>>) -> LineRequest,
    ) -> std::io::Result<T> {
        let (done, rx) = oneshot::channel();
        self.requests
            .send(request(done))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        rx.await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?
    }
}

fn serve_line<P: LinePort>(mut port: P, mut requests: mpsc::UnboundedReceiver<LineRequest>) {
    while let Some(request) = requests.blocking_recv() {
        // a caller that timed out has dropped its receiver
        match request {
            LineRequest::Send(frame, done) => {
                let _ = done.send(write_frame(&mut port, &frame));
            }
            LineRequest::Receive(done) => {
                let _ = done.send(read_frame(&mut port));
            }
        }
    }
    debug!("RS-485 line closed");
}

fn write_frame<P: LinePort>(port: &mut P, frame: &[u8]) -> std::io::Result<()> {
    port.clear_input()?;
    port.write_all(frame)?;
    port.flush()
}

fn read_frame<P: LinePort>(port: &mut P) -> std::io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut chunk = [0u8; 64];
    while frame.len() < MAX_RTU_FRAME_LEN {
        match port.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => frame.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    if frame.is_empty() {
        warn!("No reply on RS-485 bus");
        return Err(std::io::ErrorKind::TimedOut.into());
    }
    Ok(frame)
}

impl SerialLine for SerialPortLine {
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let frame = frame.to_vec();
        self.request(|done| LineRequest::Send(frame, done)).await
    }

    async fn receive(&mut self) -> std::io::Result<Vec<u8>> {
        self.request(LineRequest::Receive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Replays scripted replies and records requests
    #[derive(Clone, Default)]
    struct ScriptedLine {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    }

    impl ScriptedLine {
        fn reply(&self, frame: Option<Vec<u8>>) {
            self.replies.lock().push_back(frame);
        }
    }

    impl SerialLine for ScriptedLine {
        async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.sent.lock().push(frame.to_vec());
            Ok(())
        }

        async fn receive(&mut self) -> std::io::Result<Vec<u8>> {
            let next = self.replies.lock().pop_front().flatten();
            match next {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }
    }

    fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    #[test]
    fn test_crc16_known_value() {
        // read 2 registers at 0 from slave 1
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_encode_requests() {
        let read = Query::Read {
            id: 1,
            address: 0x0000,
            count: 2,
        };
        assert_eq!(read.encode(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);

        let single = Query::Write {
            id: 2,
            address: 399,
            values: vec![40],
        };
        assert_eq!(&single.encode()[..6], &[0x02, 0x06, 0x01, 0x8F, 0x00, 0x28]);

        let multiple = Query::Write {
            id: 2,
            address: 449,
            values: vec![0x0000, 0x01F4],
        };
        let frame = multiple.encode();
        assert_eq!(&frame[..11], &[0x02, 0x10, 0x01, 0xC1, 0x00, 0x02, 0x04, 0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(frame.len(), 13);
    }

    #[test]
    fn test_parse_reply_statuses() {
        let read = Query::Read {
            id: 1,
            address: 201,
            count: 1,
        };
        assert_eq!(read.parse_reply(&with_crc(vec![1, 3, 2, 0xFF, 0xF6])), Ok(vec![0xFFF6]));
        assert_eq!(
            read.parse_reply(&[1, 3, 2]),
            Err(QueryError::BadSize { id: 1, len: 3 })
        );

        let mut corrupted = with_crc(vec![1, 3, 2, 0x00, 0x10]);
        corrupted[3] ^= 0x01;
        assert_eq!(read.parse_reply(&corrupted), Err(QueryError::BadCrc { id: 1 }));

        assert_eq!(
            read.parse_reply(&with_crc(vec![1, 0x83, 0x02, 0x00])),
            Err(QueryError::Exception { id: 1, code: 2 })
        );
        assert_eq!(
            read.parse_reply(&with_crc(vec![1, 3, 4, 0, 1, 0, 2])),
            Err(QueryError::BadSize { id: 1, len: 9 })
        );
    }

    #[test]
    fn test_write_reply_must_echo_request() {
        let single = Query::Write {
            id: 2,
            address: 399,
            values: vec![40],
        };
        assert_eq!(single.parse_reply(&with_crc(vec![2, 6, 0x01, 0x8F, 0x00, 0x28])), Ok(vec![]));
        assert_eq!(
            single.parse_reply(&with_crc(vec![2, 6, 0x01, 0x8F, 0x00, 0x29])),
            Err(QueryError::BadEcho { id: 2 })
        );

        let multiple = Query::Write {
            id: 2,
            address: 449,
            values: vec![0x0000, 0x01F4],
        };
        assert_eq!(multiple.parse_reply(&with_crc(vec![2, 16, 0x01, 0xC1, 0x00, 0x02])), Ok(vec![]));
        assert_eq!(
            multiple.parse_reply(&with_crc(vec![2, 16, 0x01, 0xC0, 0x00, 0x02])),
            Err(QueryError::BadEcho { id: 2 })
        );
        assert_eq!(
            multiple.parse_reply(&with_crc(vec![2, 16, 0x01, 0xC1, 0x00, 0x02, 0x00])),
            Err(QueryError::BadSize { id: 2, len: 9 })
        );
    }

    #[tokio::test]
    async fn test_queries_are_serialized() {
        let line = ScriptedLine::default();
        line.reply(Some(with_crc(vec![1, 3, 2, 0x01, 0x90])));
        line.reply(Some(with_crc(vec![2, 6, 0x01, 0x8F, 0x00, 0x28])));
        let (master, _task) = ModbusMaster::spawn_default(line.clone());

        let (speed, mode) = tokio::join!(
            master.read_registers(1, 201, 1),
            master.write_registers(2, 399, &[40]),
        );
        assert_eq!(speed, Ok(vec![400]));
        assert_eq!(mode, Ok(()));
        assert_eq!(line.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_recovery() {
        let line = ScriptedLine::default();
        line.reply(None);
        line.reply(Some(with_crc(vec![1, 3, 2, 0x00, 0x28])));
        let (master, _task) = ModbusMaster::spawn_default(line.clone());

        assert_eq!(master.read_registers(1, 399, 1).await, Err(QueryError::Timeout { id: 1 }));
        assert_eq!(master.read_registers(1, 399, 1).await, Ok(vec![40]));
    }

    /// Blocking port: each read waits `delay`, then hands out the next
    /// scripted chunk or times out
    #[derive(Clone, Default)]
    struct FakePort {
        written: Arc<Mutex<Vec<u8>>>,
        chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        delay: Duration,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.delay);
            match self.chunks.lock().pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(std::io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LinePort for FakePort {
        fn clear_input(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_port_line_assembles_reply() {
        let port = FakePort::default();
        let reply = with_crc(vec![1, 3, 2, 0x01, 0x90]);
        port.chunks.lock().extend([reply[..3].to_vec(), reply[3..].to_vec()]);
        let (master, _task) = ModbusMaster::spawn_default(SerialPortLine::with_port(port.clone()).unwrap());

        assert_eq!(master.read_registers(1, 201, 1).await, Ok(vec![400]));
        assert_eq!(
            *port.written.lock(),
            Query::Read {
                id: 1,
                address: 201,
                count: 1
            }
            .encode()
        );
    }

    #[tokio::test]
    async fn test_slow_port_does_not_block_timeout() {
        let port = FakePort {
            delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut line = SerialPortLine::with_port(port).unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(20), line.receive()).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_bad_slave_id_not_sent() {
        let line = ScriptedLine::default();
        let (master, _task) = ModbusMaster::spawn_default(line.clone());
        assert_eq!(master.read_registers(0, 1, 1).await, Err(QueryError::BadSlaveId(0)));
        assert_eq!(master.read_registers(250, 1, 1).await, Err(QueryError::BadSlaveId(250)));
        assert!(line.sent.lock().is_empty());
    }
}
