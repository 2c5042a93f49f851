// Byte-frame transports underneath the command channel
//
// A transport moves complete, already byte-stuffed frames. The serial
// implementation splits the incoming byte stream at the COBS delimiter.

use std::future::Future;
use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::cobs;

/// Longest frame accepted from the byte stream before it is discarded
pub const MAX_FRAME_LEN: usize = 512;

const SERIAL_READ_TIMEOUT_MS: u64 = 50;
const RX_QUEUE_DEPTH: usize = 32;
const TX_QUEUE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,
}

/// Frame-oriented link to the host
pub trait Transport: Send + 'static {
    /// Send one delimited frame
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next frame; `None` once the link is closed
    fn receive(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;
}

/// Splits a byte stream into delimiter-terminated frames
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    discarding: bool,
}

impl FrameAccumulator {
    /// Feed received bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == cobs::DELIMITER {
                if !self.discarding && !self.buffer.is_empty() {
                    frames.push(std::mem::take(&mut self.buffer));
                }
                self.buffer.clear();
                self.discarding = false;
            } else if !self.discarding {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_FRAME_LEN {
                    debug!("Discarding overlong frame");
                    self.buffer.clear();
                    self.discarding = true;
                }
            }
        }
        frames
    }
}

/// In-memory transport, one end of a [`memory_pair`]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Two connected in-memory transports
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

impl Transport for MemoryTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx.send(frame.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Host link over a serial port. A reader thread assembles frames, a writer
/// thread drains the outgoing queue.
pub struct SerialTransport {
    writes: mpsc::Sender<Vec<u8>>,
    frames: mpsc::Receiver<Vec<u8>>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, TransportError> {
        info!("Opening host link on {} at {} baud", port_name, baudrate);
        let writer = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
            .open()?;
        let reader = writer.try_clone()?;

        let (tx, frames) = mpsc::channel(RX_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("host-rx".to_string())
            .spawn(move || read_frames(reader, tx))?;

        let (writes, rx) = mpsc::channel(TX_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("host-tx".to_string())
            .spawn(move || write_frames(writer, rx))?;

        Ok(Self { writes, frames })
    }
}

fn write_frames<W: Write>(mut port: W, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.blocking_recv() {
        if let Err(e) = port.write_all(&frame).and_then(|()| port.flush()) {
            warn!("Host link write failed: {}", e);
            return;
        }
    }
}

fn read_frames(mut port: Box<dyn SerialPort>, frames: mpsc::Sender<Vec<u8>>) {
    let mut accumulator = FrameAccumulator::default();
    let mut chunk = [0u8; 256];
    loop {
        match port.read(&mut chunk) {
            Ok(n) => {
                for frame in accumulator.push(&chunk[..n]) {
                    if frames.blocking_send(frame).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("Host link read failed: {}", e);
                return;
            }
        }
    }
}

impl Transport for SerialTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.writes
            .send(frame.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.frames.recv().await)
    }
}
