// Serial command channel
//
// Decodes host frames, routes them through the register maps and sends the
// answers. Unsolicited traffic (prints, events) from other tasks is queued
// through a `MessageSender` and goes out on the same transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportError};
use crate::config::PRINT_MAX_LEN;
use crate::messages::{EventId, PrintLevel};
use crate::protocol::{Command, Message};
use crate::registers::{RegisterKind, RegisterMap, Wire};

/// One-byte error codes carried in error answers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ProtocolError {
    Unknown = 0x01,
    WrongAddress = 0x02,
    Write = 0x03,
    Read = 0x04,
    Len = 0x05,
    MsgType = 0x06,
}

/// Queue handle for outbound messages, cheap to clone into any task
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<Message>,
}

impl MessageSender {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Queue a message without waiting. Returns false if it was dropped.
    pub fn send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("Outbound queue full, dropping {:?} message", message.cmd);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn event<T: Wire>(&self, id: EventId, payload: &T) -> bool {
        self.send(Message::new(Command::Event, id.address(), 0, payload.to_wire()))
    }

    /// Text message for the host, truncated to the print buffer size
    pub fn print(&self, level: PrintLevel, text: &str) -> bool {
        let mut end = text.len().min(PRINT_MAX_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let data = text.as_bytes()[..end].to_vec();
        self.send(Message::new(Command::Event, EventId::Print.address(), level.into(), data))
    }

    pub fn debug(&self, text: &str) -> bool {
        self.print(PrintLevel::Debug, text)
    }

    pub fn info(&self, text: &str) -> bool {
        self.print(PrintLevel::Info, text)
    }

    pub fn warning(&self, text: &str) -> bool {
        self.print(PrintLevel::Warning, text)
    }

    pub fn error(&self, text: &str) -> bool {
        self.print(PrintLevel::Error, text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Running,
}

enum Activity {
    Inbound(Option<Vec<u8>>),
    Outbound(Option<Message>),
}

pub struct CommandChannel {
    maps: BTreeMap<u8, Arc<RegisterMap>>,
    ack_writes: bool,
    state: ChannelState,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        Self {
            maps: BTreeMap::new(),
            ack_writes: false,
            state: ChannelState::Init,
        }
    }

    /// Answer successful writes with an empty acknowledgement
    pub fn with_write_ack(mut self, ack: bool) -> Self {
        self.ack_writes = ack;
        self
    }

    /// Route messages for `map.module()` to `map`
    pub fn add_map(&mut self, map: Arc<RegisterMap>) {
        self.maps.insert(map.module(), map);
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Dispatch one inbound message, returning the reply if there is one
    pub fn handle(&self, message: &Message) -> Option<Message> {
        if message.cmd == Command::Echo {
            return Some(message.clone());
        }

        let Some(map) = self.maps.get(&message.address.module) else {
            return Some(error_answer(message, ProtocolError::WrongAddress));
        };
        let register = message.address.register;

        match message.cmd {
            Command::Write => {
                let Some(entry) = map.get(register) else {
                    return Some(error_answer(message, ProtocolError::WrongAddress));
                };
                if !entry.kind().is_writable() {
                    return Some(error_answer(message, ProtocolError::MsgType));
                }
                if message.data.len() != entry.input_size() {
                    warn!(
                        "Write to 0x{:04X} with {} bytes, expected {}",
                        register,
                        message.data.len(),
                        entry.input_size()
                    );
                    return Some(error_answer(message, ProtocolError::Len));
                }
                map.write(register, &message.data);
                self.ack_writes.then(|| answer(message, Vec::new()))
            }
            Command::Read => {
                let Some(entry) = map.get(register) else {
                    return Some(error_answer(message, ProtocolError::WrongAddress));
                };
                if !entry.kind().is_readable() {
                    return Some(error_answer(message, ProtocolError::MsgType));
                }
                let mut data = Vec::with_capacity(entry.output_size());
                map.read(register, &mut data);
                Some(answer(message, data))
            }
            Command::Function => {
                let Some(entry) = map.get(register) else {
                    return Some(error_answer(message, ProtocolError::WrongAddress));
                };
                if message.data.len() != entry.input_size() {
                    return Some(error_answer(message, ProtocolError::Len));
                }
                if entry.kind() != RegisterKind::Executable {
                    return Some(error_answer(message, ProtocolError::MsgType));
                }
                let mut data = Vec::with_capacity(entry.output_size());
                map.execute(register, &message.data, &mut data);
                (!data.is_empty()).then(|| answer(message, data))
            }
            other => {
                debug!("Ignoring inbound {:?} message", other);
                None
            }
        }
    }

    /// Serve the transport until it closes
    pub async fn run<T: Transport>(
        mut self,
        mut transport: T,
        mut outbox: mpsc::Receiver<Message>,
    ) -> Result<(), TransportError> {
        self.state = ChannelState::Running;
        info!("Command channel running with {} register map(s)", self.maps.len());

        let mut outbox_open = true;
        loop {
            let activity = tokio::select! {
                frame = transport.receive() => Activity::Inbound(frame?),
                message = outbox.recv(), if outbox_open => Activity::Outbound(message),
            };

            match activity {
                Activity::Inbound(None) => {
                    info!("Host link closed");
                    return Ok(());
                }
                Activity::Inbound(Some(frame)) => match Message::from_frame(&frame) {
                    Ok(message) => {
                        if let Some(reply) = self.handle(&message) {
                            send_message(&mut transport, &reply).await?;
                        }
                    }
                    Err(e) => debug!("Dropping invalid frame: {}", e),
                },
                Activity::Outbound(Some(message)) => send_message(&mut transport, &message).await?,
                Activity::Outbound(None) => outbox_open = false,
            }
        }
    }
}

async fn send_message<T: Transport>(transport: &mut T, message: &Message) -> Result<(), TransportError> {
    match message.to_frame() {
        Ok(frame) => transport.send(&frame).await,
        Err(e) => {
            warn!("Cannot encode outbound message: {}", e);
            Ok(())
        }
    }
}

fn answer(request: &Message, data: Vec<u8>) -> Message {
    Message::new(Command::Answer, request.address, 1, data)
}

fn error_answer(request: &Message, code: ProtocolError) -> Message {
    Message::new(Command::Answer, request.address, 0, vec![code.into()])
}
