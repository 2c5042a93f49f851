// CAN register bus with request/response correlation
//
// A read goes out as a remote frame and the calling task parks on a oneshot
// stored in a small fixed-size pending table. The receive path matches reply
// frames by identifier and completes the waiting request. A request leaves
// the table on reply, on timeout, on transmit failure or when the waiting
// future is dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::{CAN_PENDING_REQUESTS, CAN_REMOTE_TIMEOUT};

/// Maximum payload of a classic CAN frame
pub const MAX_DLC: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub remote: bool,
    len: u8,
    data: [u8; MAX_DLC],
}

impl CanFrame {
    /// Data frame; payloads longer than 8 bytes are truncated
    pub fn data(id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_DLC);
        let mut data = [0u8; MAX_DLC];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            remote: false,
            len: len as u8,
            data,
        }
    }

    /// Remote frame requesting `len` bytes
    pub fn remote(id: u32, len: u8) -> Self {
        Self {
            id,
            remote: true,
            len: len.min(MAX_DLC as u8),
            data: [0; MAX_DLC],
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Pending request table full")]
    RequestTableFull,

    #[error("Request for 0x{id:08X} already pending")]
    AlreadyPending { id: u32 },

    #[error("Transmit of 0x{id:08X} failed: {reason}")]
    Transmit { id: u32, reason: String },

    #[error("Timeout waiting for reply to 0x{id:08X}")]
    Timeout { id: u32 },

    #[error("Request for 0x{id:08X} cancelled")]
    Cancelled { id: u32 },

    #[error("Payload of {0} bytes does not fit a CAN frame")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Transmit side of the controller. Must not block: it models handing the
/// frame to a hardware mailbox.
pub trait CanTransmit: Send + Sync {
    fn transmit(&self, frame: &CanFrame) -> Result<()>;
}

struct PendingRequest {
    id: u32,
    generation: u64,
    reply: oneshot::Sender<CanFrame>,
}

struct PendingTable {
    slots: [Option<PendingRequest>; CAN_PENDING_REQUESTS],
    generation: u64,
}

/// Slot taken by one read; the generation tells it apart from later
/// requests reusing the same slot or identifier
#[derive(Debug, Clone, Copy)]
struct Ticket {
    slot: usize,
    generation: u64,
}

/// Removes a request from the table when the waiting read finishes or is dropped
struct PendingGuard<'a> {
    bus: &'a CanBus,
    ticket: Ticket,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.bus.remove_request(self.ticket);
    }
}

pub struct CanBus {
    transmitter: Box<dyn CanTransmit>,
    pending: Mutex<PendingTable>,
    timeout: Duration,
}

impl CanBus {
    pub fn new(transmitter: impl CanTransmit + 'static) -> Self {
        Self::with_timeout(transmitter, CAN_REMOTE_TIMEOUT)
    }

    pub fn with_timeout(transmitter: impl CanTransmit + 'static, timeout: Duration) -> Self {
        Self {
            transmitter: Box::new(transmitter),
            pending: Mutex::new(PendingTable {
                slots: std::array::from_fn(|_| None),
                generation: 0,
            }),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fire-and-forget data frame
    pub fn write(&self, id: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DLC {
            return Err(BusError::PayloadTooLarge(payload.len()));
        }
        self.transmitter.transmit(&CanFrame::data(id, payload))
    }

    /// Request `len` bytes from `id` and wait for the matching reply
    pub async fn read(&self, id: u32, len: u8) -> Result<CanFrame> {
        let (ticket, reply) = self.add_request(id)?;
        let _guard = PendingGuard { bus: self, ticket };

        self.transmitter.transmit(&CanFrame::remote(id, len))?;

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(BusError::Cancelled { id }),
            Err(_) => {
                debug!("CAN read of 0x{:08X} timed out", id);
                Err(BusError::Timeout { id })
            }
        }
    }

    /// Receive path: complete the open request matching `frame`. Returns
    /// false if nobody was waiting for it.
    pub fn on_frame(&self, frame: CanFrame) -> bool {
        if frame.remote {
            return false;
        }
        let waiter = {
            let mut pending = self.pending.lock();
            pending
                .slots
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|request| request.id == frame.id))
                .and_then(Option::take)
        };
        match waiter {
            Some(request) => request.reply.send(frame).is_ok(),
            None => {
                trace!("Unsolicited CAN frame 0x{:08X}", frame.id);
                false
            }
        }
    }

    /// Number of open requests
    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drop every open request; their readers fail with `Cancelled`
    pub fn reset(&self) {
        let mut pending = self.pending.lock();
        for slot in pending.slots.iter_mut() {
            *slot = None;
        }
    }

    fn add_request(&self, id: u32) -> Result<(Ticket, oneshot::Receiver<CanFrame>)> {
        let mut pending = self.pending.lock();
        if pending.slots.iter().flatten().any(|request| request.id == id) {
            return Err(BusError::AlreadyPending { id });
        }
        let slot = pending
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(BusError::RequestTableFull)?;
        pending.generation = pending.generation.wrapping_add(1);
        let generation = pending.generation;
        let (reply, rx) = oneshot::channel();
        pending.slots[slot] = Some(PendingRequest { id, generation, reply });
        Ok((Ticket { slot, generation }, rx))
    }

    /// Clears the slot only if it still holds the request of `ticket`
    fn remove_request(&self, ticket: Ticket) {
        let mut pending = self.pending.lock();
        let slot = &mut pending.slots[ticket.slot];
        if slot.as_ref().is_some_and(|request| request.generation == ticket.generation) {
            *slot = None;
        }
    }
}

/// Drain received frames into the bus, the task-side half of the receive
/// interrupt
pub fn spawn_receive_task(bus: Arc<CanBus>, mut frames: mpsc::UnboundedReceiver<CanFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            bus.on_frame(frame);
        }
        debug!("CAN receive queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forwards transmitted frames to the test
    struct Recorder(mpsc::UnboundedSender<CanFrame>);

    impl CanTransmit for Recorder {
        fn transmit(&self, frame: &CanFrame) -> Result<()> {
            self.0.send(*frame).map_err(|_| BusError::Transmit {
                id: frame.id,
                reason: "closed".to_string(),
            })
        }
    }

    struct Broken;

    impl CanTransmit for Broken {
        fn transmit(&self, frame: &CanFrame) -> Result<()> {
            Err(BusError::Transmit {
                id: frame.id,
                reason: "bus off".to_string(),
            })
        }
    }

    fn recording_bus() -> (Arc<CanBus>, mpsc::UnboundedReceiver<CanFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CanBus::new(Recorder(tx))), rx)
    }

    #[tokio::test]
    async fn test_replies_matched_by_id() {
        let (bus, mut sent) = recording_bus();

        let first = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.read(0x0001_00CA, 2).await }
        });
        let second = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.read(0x0002_00CA, 2).await }
        });

        let a = sent.recv().await.unwrap();
        let b = sent.recv().await.unwrap();
        assert!(a.remote && b.remote);

        // answer in reverse order
        let (later, earlier) = if a.id == 0x0001_00CA { (a, b) } else { (b, a) };
        assert!(bus.on_frame(CanFrame::data(earlier.id, &[0x00, 0x02])));
        assert!(bus.on_frame(CanFrame::data(later.id, &[0x00, 0x01])));

        assert_eq!(first.await.unwrap().unwrap().payload(), &[0x00, 0x01]);
        assert_eq!(second.await.unwrap().unwrap().payload(), &[0x00, 0x02]);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_free_slots() {
        let (bus, _sent) = recording_bus();
        for _ in 0..CAN_PENDING_REQUESTS + 4 {
            assert_eq!(bus.read(0x10, 2).await, Err(BusError::Timeout { id: 0x10 }));
        }
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_full() {
        let (bus, _sent) = recording_bus();
        let mut readers = Vec::new();
        for id in 0..CAN_PENDING_REQUESTS as u32 {
            let bus = Arc::clone(&bus);
            readers.push(tokio::spawn(async move { bus.read(id, 2).await }));
        }
        while bus.pending_count() < CAN_PENDING_REQUESTS {
            tokio::task::yield_now().await;
        }

        assert_eq!(bus.read(0x99, 2).await, Err(BusError::RequestTableFull));

        for reader in readers {
            assert!(matches!(reader.await.unwrap(), Err(BusError::Timeout { .. })));
        }
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let (bus, mut sent) = recording_bus();
        let reader = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.read(0x42, 2).await }
        });
        sent.recv().await.unwrap();

        assert_eq!(bus.read(0x42, 2).await, Err(BusError::AlreadyPending { id: 0x42 }));

        bus.on_frame(CanFrame::data(0x42, &[1, 2]));
        assert!(reader.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_transmit_failure_frees_slot() {
        let bus = CanBus::new(Broken);
        assert!(matches!(bus.read(0x20, 2).await, Err(BusError::Transmit { .. })));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_reader_frees_slot() {
        let (bus, _sent) = recording_bus();
        let read = bus.read(0x30, 2);
        let _ = tokio::time::timeout(Duration::from_micros(100), read).await;
        assert_eq!(bus.pending_count(), 0);
        assert!(!bus.on_frame(CanFrame::data(0x30, &[0])));
    }

    #[tokio::test]
    async fn test_reset_cancels_waiters() {
        let (bus, mut sent) = recording_bus();
        let reader = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.read(0x50, 2).await }
        });
        sent.recv().await.unwrap();
        bus.reset();
        assert_eq!(reader.await.unwrap(), Err(BusError::Cancelled { id: 0x50 }));
    }

    #[tokio::test]
    async fn test_receive_task_delivers() {
        let (bus, mut sent) = recording_bus();
        let (rx_tx, rx_rx) = mpsc::unbounded_channel();
        let _task = spawn_receive_task(Arc::clone(&bus), rx_rx);

        let reader = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.read(0x60, 4).await }
        });
        let request = sent.recv().await.unwrap();
        assert_eq!(request.len(), 4);
        rx_tx.send(CanFrame::data(0x60, &[1, 2, 3, 4])).unwrap();
        assert_eq!(reader.await.unwrap().unwrap().payload(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_finished_read_leaves_reused_id_alone() {
        let (bus, _sent) = recording_bus();

        let (ticket, first) = bus.add_request(0x70).unwrap();
        let first_guard = PendingGuard { bus: &bus, ticket };
        assert!(bus.on_frame(CanFrame::data(0x70, &[1, 2])));

        // a new read of the same id registers before the first one resumes
        let (_, second) = bus.add_request(0x70).unwrap();
        assert_eq!(first.await.unwrap().payload(), &[1, 2]);
        drop(first_guard);
        assert_eq!(bus.pending_count(), 1);

        assert!(bus.on_frame(CanFrame::data(0x70, &[3, 4])));
        assert_eq!(second.await.unwrap().payload(), &[3, 4]);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let (bus, _sent) = recording_bus();
        assert_eq!(bus.write(0x01, &[0; 9]), Err(BusError::PayloadTooLarge(9)));
    }
}
