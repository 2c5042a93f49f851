// Bulk channel
//
// Block transfers that don't fit the framed serial link. Every phase starts
// with a 4-byte command header [0x66, cmd, len_hi, len_lo]:
// - TRAJECTORY_WRITE: host sends `len` trajectory steps right after the header
// - SAMPLES_READ: device answers with a header holding the sample count,
//   followed by the most recent full telemetry buffer

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const BULK_HEADER: u8 = 0x66;
pub const BULK_HEADER_LEN: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum BulkCommand {
    SamplesRead = 0x01,
    TrajectoryWrite = 0x02,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BulkError {
    #[error("Invalid bulk header byte 0x{0:02X}")]
    BadHeader(u8),

    #[error("Unknown bulk command 0x{0:02X}")]
    UnknownCommand(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkHeader {
    pub command: BulkCommand,
    /// Item count (steps or samples), not bytes
    pub len: u16,
}

impl BulkHeader {
    pub fn encode(&self) -> [u8; BULK_HEADER_LEN] {
        let [hi, lo] = self.len.to_be_bytes();
        [BULK_HEADER, self.command.into(), hi, lo]
    }

    pub fn decode(bytes: [u8; BULK_HEADER_LEN]) -> Result<Self, BulkError> {
        if bytes[0] != BULK_HEADER {
            return Err(BulkError::BadHeader(bytes[0]));
        }
        let command = BulkCommand::try_from(bytes[1]).map_err(|_| BulkError::UnknownCommand(bytes[1]))?;
        Ok(Self {
            command,
            len: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

#[derive(Debug, Default)]
struct BulkShared {
    expected_steps: Option<u16>,
    samples: Option<(u16, Vec<u8>)>,
}

/// Producer side of the bulk channel, shared with the sequencer and the
/// telemetry collector
#[derive(Debug, Clone, Default)]
pub struct BulkHandle {
    shared: Arc<Mutex<BulkShared>>,
}

impl BulkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the channel to accept an upload of exactly `steps` trajectory steps
    pub fn expect_trajectory(&self, steps: u16) {
        self.shared.lock().expected_steps = Some(steps);
    }

    pub fn cancel_trajectory(&self) {
        self.shared.lock().expected_steps = None;
    }

    pub fn is_trajectory_armed(&self) -> bool {
        self.shared.lock().expected_steps.is_some()
    }

    /// Replace the buffer served on the next SAMPLES_READ
    pub fn publish_samples(&self, count: u16, bytes: Vec<u8>) {
        self.shared.lock().samples = Some((count, bytes));
    }

    /// Buffer waiting to be served, if any
    pub fn latest_samples(&self) -> Option<(u16, Vec<u8>)> {
        self.shared.lock().samples.clone()
    }

    fn take_expected_steps(&self) -> Option<u16> {
        self.shared.lock().expected_steps.take()
    }

    fn take_samples(&self) -> Option<(u16, Vec<u8>)> {
        self.shared.lock().samples.take()
    }
}

type TrajectorySink = Box<dyn Fn(&[u8]) + Send + Sync>;

pub struct BulkChannel {
    handle: BulkHandle,
    step_size: usize,
    on_trajectory: TrajectorySink,
}

impl BulkChannel {
    /// `step_size` is the encoded size of one trajectory step; completed
    /// uploads are passed to `on_trajectory`
    pub fn new(
        handle: BulkHandle,
        step_size: usize,
        on_trajectory: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        Self {
            handle,
            step_size,
            on_trajectory: Box::new(on_trajectory),
        }
    }

    /// Serve bulk phases until the stream closes
    pub async fn run<S>(self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!("Bulk channel running");
        loop {
            let mut raw = [0u8; BULK_HEADER_LEN];
            match stream.read_exact(&mut raw).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("Bulk stream closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            let header = match BulkHeader::decode(raw) {
                Ok(header) => header,
                Err(e) => {
                    debug!("Ignoring bulk phase: {}", e);
                    continue;
                }
            };

            match header.command {
                BulkCommand::TrajectoryWrite => {
                    let mut payload = vec![0u8; header.len as usize * self.step_size];
                    stream.read_exact(&mut payload).await?;
                    match self.handle.take_expected_steps() {
                        Some(expected) if expected == header.len => (self.on_trajectory)(&payload),
                        Some(expected) => warn!(
                            "Trajectory upload of {} steps, expected {}",
                            header.len, expected
                        ),
                        None => warn!("Unexpected trajectory upload of {} steps", header.len),
                    }
                }
                BulkCommand::SamplesRead => {
                    let (count, bytes) = self.handle.take_samples().unwrap_or_default();
                    let reply = BulkHeader {
                        command: BulkCommand::SamplesRead,
                        len: count,
                    };
                    stream.write_all(&reply.encode()).await?;
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_header_codec() {
        let header = BulkHeader {
            command: BulkCommand::TrajectoryWrite,
            len: 0x0203,
        };
        assert_eq!(header.encode(), [0x66, 0x02, 0x02, 0x03]);
        assert_eq!(BulkHeader::decode(header.encode()), Ok(header));
        assert_eq!(BulkHeader::decode([0x65, 1, 0, 0]), Err(BulkError::BadHeader(0x65)));
        assert_eq!(BulkHeader::decode([0x66, 9, 0, 0]), Err(BulkError::UnknownCommand(9)));
    }

    #[tokio::test]
    async fn test_trajectory_upload_requires_arming() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handle = BulkHandle::new();
        let channel = BulkChannel::new(handle.clone(), 2, move |bytes| sink.lock().push(bytes.to_vec()));

        let (device, mut host) = duplex(256);
        let task = tokio::spawn(channel.run(device));

        // not armed: payload is consumed and dropped
        let header = BulkHeader {
            command: BulkCommand::TrajectoryWrite,
            len: 2,
        };
        host.write_all(&header.encode()).await.unwrap();
        host.write_all(&[1, 2, 3, 4]).await.unwrap();

        // a samples round trip guarantees the upload above was processed
        let sync = BulkHeader {
            command: BulkCommand::SamplesRead,
            len: 0,
        };
        host.write_all(&sync.encode()).await.unwrap();
        let mut reply = [0u8; BULK_HEADER_LEN];
        host.read_exact(&mut reply).await.unwrap();

        handle.expect_trajectory(2);
        host.write_all(&header.encode()).await.unwrap();
        host.write_all(&[5, 6, 7, 8]).await.unwrap();

        drop(host);
        task.await.unwrap().unwrap();
        assert_eq!(*received.lock(), vec![vec![5, 6, 7, 8]]);
        assert!(!handle.is_trajectory_armed());
    }

    #[tokio::test]
    async fn test_samples_read() {
        let handle = BulkHandle::new();
        let channel = BulkChannel::new(handle.clone(), 12, |_| {});
        let (device, mut host) = duplex(256);
        let task = tokio::spawn(channel.run(device));

        let request = BulkHeader {
            command: BulkCommand::SamplesRead,
            len: 0,
        };

        // nothing published yet
        host.write_all(&request.encode()).await.unwrap();
        let mut reply = [0u8; BULK_HEADER_LEN];
        host.read_exact(&mut reply).await.unwrap();
        assert_eq!(BulkHeader::decode(reply).unwrap().len, 0);

        handle.publish_samples(2, vec![9; 6]);
        host.write_all(&request.encode()).await.unwrap();
        host.read_exact(&mut reply).await.unwrap();
        assert_eq!(BulkHeader::decode(reply).unwrap().len, 2);
        let mut data = [0u8; 6];
        host.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [9; 6]);

        drop(host);
        task.await.unwrap().unwrap();
    }
}
