// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory transport between one client and the driver. Commands and
// events travel as fixed-size plain records through two SPSC rings; the CnC
// header carries driver liveness and the correlation id sequence.

pub mod cnc;
pub mod ring;

use std::io;
use std::sync::Arc;

use crate::command::{CommandMessage, DriverCommand, DriverEvent, ToClients, ToDriver};
use crate::counters::MAX_KEY_LENGTH;
use crate::error::{Error, Result};

pub use cnc::CncFile;
pub use ring::ShmRing;

/// Longest channel, file name, label or message a record can carry.
pub const MAX_TEXT_LENGTH: usize = 384;

pub const TO_DRIVER_CAPACITY: usize = 64;
pub const TO_CLIENTS_CAPACITY: usize = 256;

pub fn to_driver_name(dir: &str) -> String {
    format!("{dir}-to-driver")
}

pub fn to_clients_name(dir: &str) -> String {
    format!("{dir}-to-clients")
}

// ---------------------------------------------------------------------------
// Type ids
// ---------------------------------------------------------------------------

mod command_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x03;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const ADD_DESTINATION: i32 = 0x07;
    pub const REMOVE_DESTINATION: i32 = 0x08;
    pub const ADD_COUNTER: i32 = 0x09;
    pub const REMOVE_COUNTER: i32 = 0x0A;
    pub const CLIENT_CLOSE: i32 = 0x0B;
    pub const ADD_RCV_DESTINATION: i32 = 0x0C;
    pub const REMOVE_RCV_DESTINATION: i32 = 0x0D;
}

mod event_type {
    pub const ERROR: i32 = 0x0F01;
    pub const AVAILABLE_IMAGE: i32 = 0x0F02;
    pub const PUBLICATION_READY: i32 = 0x0F03;
    pub const OPERATION_SUCCESS: i32 = 0x0F04;
    pub const UNAVAILABLE_IMAGE: i32 = 0x0F05;
    pub const EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F06;
    pub const SUBSCRIPTION_READY: i32 = 0x0F07;
    pub const COUNTER_READY: i32 = 0x0F08;
    pub const UNAVAILABLE_COUNTER: i32 = 0x0F09;
    pub const CLIENT_TIMEOUT: i32 = 0x0F0A;
    pub const CHANNEL_ENDPOINT_ERROR: i32 = 0x0F0B;
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

fn put_text(dst: &mut [u8; MAX_TEXT_LENGTH], s: &str) -> Result<i32> {
    if s.len() > MAX_TEXT_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "text length out of bounds: {} > {MAX_TEXT_LENGTH}",
            s.len()
        )));
    }
    dst[..s.len()].copy_from_slice(s.as_bytes());
    Ok(s.len() as i32)
}

fn get_text(src: &[u8; MAX_TEXT_LENGTH], len: i32) -> String {
    let len = (len.max(0) as usize).min(MAX_TEXT_LENGTH);
    String::from_utf8_lossy(&src[..len]).into_owned()
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandRecord {
    type_id: i32,
    /// Stream id, or counter type id for ADD_COUNTER.
    stream_id: i32,
    client_id: i64,
    correlation_id: i64,
    registration_id: i64,
    text_length: i32,
    key_length: i32,
    text: [u8; MAX_TEXT_LENGTH],
    key: [u8; MAX_KEY_LENGTH],
}

impl CommandRecord {
    fn zeroed(type_id: i32, client_id: i64, correlation_id: i64) -> Self {
        Self {
            type_id,
            stream_id: 0,
            client_id,
            correlation_id,
            registration_id: 0,
            text_length: 0,
            key_length: 0,
            text: [0; MAX_TEXT_LENGTH],
            key: [0; MAX_KEY_LENGTH],
        }
    }

    /// Fails if a channel or label does not fit its slot.
    pub fn encode(msg: &CommandMessage) -> Result<Self> {
        use command_type::*;
        let mut rec = Self::zeroed(0, msg.client_id, msg.correlation_id);
        match &msg.command {
            DriverCommand::AddPublication { channel, stream_id } => {
                rec.type_id = ADD_PUBLICATION;
                rec.stream_id = *stream_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::AddExclusivePublication { channel, stream_id } => {
                rec.type_id = ADD_EXCLUSIVE_PUBLICATION;
                rec.stream_id = *stream_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::RemovePublication { registration_id } => {
                rec.type_id = REMOVE_PUBLICATION;
                rec.registration_id = *registration_id;
            }
            DriverCommand::AddSubscription { channel, stream_id } => {
                rec.type_id = ADD_SUBSCRIPTION;
                rec.stream_id = *stream_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::RemoveSubscription { registration_id } => {
                rec.type_id = REMOVE_SUBSCRIPTION;
                rec.registration_id = *registration_id;
            }
            DriverCommand::AddDestination { registration_id, channel } => {
                rec.type_id = ADD_DESTINATION;
                rec.registration_id = *registration_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::RemoveDestination { registration_id, channel } => {
                rec.type_id = REMOVE_DESTINATION;
                rec.registration_id = *registration_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::AddRcvDestination { registration_id, channel } => {
                rec.type_id = ADD_RCV_DESTINATION;
                rec.registration_id = *registration_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::RemoveRcvDestination { registration_id, channel } => {
                rec.type_id = REMOVE_RCV_DESTINATION;
                rec.registration_id = *registration_id;
                rec.text_length = put_text(&mut rec.text, channel)?;
            }
            DriverCommand::AddCounter { type_id, key, label } => {
                rec.type_id = ADD_COUNTER;
                rec.stream_id = *type_id;
                if key.len() > MAX_KEY_LENGTH {
                    return Err(Error::InvalidArgument(format!(
                        "key length out of bounds: {}",
                        key.len()
                    )));
                }
                rec.key[..key.len()].copy_from_slice(key);
                rec.key_length = key.len() as i32;
                rec.text_length = put_text(&mut rec.text, label)?;
            }
            DriverCommand::RemoveCounter { registration_id } => {
                rec.type_id = REMOVE_COUNTER;
                rec.registration_id = *registration_id;
            }
            DriverCommand::ClientKeepalive => rec.type_id = CLIENT_KEEPALIVE,
            DriverCommand::ClientClose => rec.type_id = CLIENT_CLOSE,
        }
        Ok(rec)
    }

    /// `None` for a type id this side does not know.
    pub fn decode(&self) -> Option<CommandMessage> {
        use command_type::*;
        let text = || get_text(&self.text, self.text_length);
        let command = match self.type_id {
            ADD_PUBLICATION => DriverCommand::AddPublication {
                channel: text(),
                stream_id: self.stream_id,
            },
            ADD_EXCLUSIVE_PUBLICATION => DriverCommand::AddExclusivePublication {
                channel: text(),
                stream_id: self.stream_id,
            },
            REMOVE_PUBLICATION => DriverCommand::RemovePublication {
                registration_id: self.registration_id,
            },
            ADD_SUBSCRIPTION => DriverCommand::AddSubscription {
                channel: text(),
                stream_id: self.stream_id,
            },
            REMOVE_SUBSCRIPTION => DriverCommand::RemoveSubscription {
                registration_id: self.registration_id,
            },
            ADD_DESTINATION => DriverCommand::AddDestination {
                registration_id: self.registration_id,
                channel: text(),
            },
            REMOVE_DESTINATION => DriverCommand::RemoveDestination {
                registration_id: self.registration_id,
                channel: text(),
            },
            ADD_RCV_DESTINATION => DriverCommand::AddRcvDestination {
                registration_id: self.registration_id,
                channel: text(),
            },
            REMOVE_RCV_DESTINATION => DriverCommand::RemoveRcvDestination {
                registration_id: self.registration_id,
                channel: text(),
            },
            ADD_COUNTER => {
                let key_len = (self.key_length.max(0) as usize).min(MAX_KEY_LENGTH);
                DriverCommand::AddCounter {
                    type_id: self.stream_id,
                    key: self.key[..key_len].to_vec(),
                    label: text(),
                }
            }
            REMOVE_COUNTER => DriverCommand::RemoveCounter {
                registration_id: self.registration_id,
            },
            CLIENT_KEEPALIVE => DriverCommand::ClientKeepalive,
            CLIENT_CLOSE => DriverCommand::ClientClose,
            _ => return None,
        };
        Some(CommandMessage {
            client_id: self.client_id,
            correlation_id: self.correlation_id,
            command,
        })
    }
}

/// One driver event. Integer slots are shared between event kinds; the
/// encode/decode pair is the only place that knows which is which.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventRecord {
    type_id: i32,
    int0: i32,
    int1: i32,
    int2: i32,
    int3: i32,
    text_length: i32,
    long0: i64,
    long1: i64,
    extra_length: i32,
    _pad: i32,
    text: [u8; MAX_TEXT_LENGTH],
    extra: [u8; MAX_TEXT_LENGTH],
}

impl EventRecord {
    fn zeroed(type_id: i32) -> Self {
        Self {
            type_id,
            int0: 0,
            int1: 0,
            int2: 0,
            int3: 0,
            text_length: 0,
            long0: 0,
            long1: 0,
            extra_length: 0,
            _pad: 0,
            text: [0; MAX_TEXT_LENGTH],
            extra: [0; MAX_TEXT_LENGTH],
        }
    }

    pub fn encode(event: &DriverEvent) -> Result<Self> {
        use event_type::*;
        let rec = match event {
            DriverEvent::PublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_id,
                channel_status_id,
                log_file_name,
                exclusive,
            } => {
                let mut rec = Self::zeroed(if *exclusive {
                    EXCLUSIVE_PUBLICATION_READY
                } else {
                    PUBLICATION_READY
                });
                rec.long0 = *correlation_id;
                rec.long1 = *registration_id;
                rec.int0 = *stream_id;
                rec.int1 = *session_id;
                rec.int2 = *publication_limit_id;
                rec.int3 = *channel_status_id;
                rec.text_length = put_text(&mut rec.text, log_file_name)?;
                rec
            }
            DriverEvent::SubscriptionReady {
                correlation_id,
                channel_status_id,
            } => {
                let mut rec = Self::zeroed(SUBSCRIPTION_READY);
                rec.long0 = *correlation_id;
                rec.int3 = *channel_status_id;
                rec
            }
            DriverEvent::OperationSuccess { correlation_id } => {
                let mut rec = Self::zeroed(OPERATION_SUCCESS);
                rec.long0 = *correlation_id;
                rec
            }
            DriverEvent::AvailableImage {
                correlation_id,
                session_id,
                subscription_registration_id,
                subscriber_position_id,
                log_file_name,
                source_identity,
            } => {
                let mut rec = Self::zeroed(AVAILABLE_IMAGE);
                rec.long0 = *correlation_id;
                rec.long1 = *subscription_registration_id;
                rec.int1 = *session_id;
                rec.int2 = *subscriber_position_id;
                rec.text_length = put_text(&mut rec.text, log_file_name)?;
                rec.extra_length = put_text(&mut rec.extra, source_identity)?;
                rec
            }
            DriverEvent::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                stream_id,
            } => {
                let mut rec = Self::zeroed(UNAVAILABLE_IMAGE);
                rec.long0 = *correlation_id;
                rec.long1 = *subscription_registration_id;
                rec.int0 = *stream_id;
                rec
            }
            DriverEvent::CounterReady {
                correlation_id,
                counter_id,
            } => {
                let mut rec = Self::zeroed(COUNTER_READY);
                rec.long0 = *correlation_id;
                rec.int0 = *counter_id;
                rec
            }
            DriverEvent::UnavailableCounter {
                registration_id,
                counter_id,
            } => {
                let mut rec = Self::zeroed(UNAVAILABLE_COUNTER);
                rec.long0 = *registration_id;
                rec.int0 = *counter_id;
                rec
            }
            DriverEvent::Error {
                correlation_id,
                code,
                message,
            } => {
                let mut rec = Self::zeroed(ERROR);
                rec.long0 = *correlation_id;
                rec.int0 = *code;
                rec.text_length = put_text(&mut rec.text, message)?;
                rec
            }
            DriverEvent::ChannelEndpointError {
                status_indicator_id,
                message,
            } => {
                let mut rec = Self::zeroed(CHANNEL_ENDPOINT_ERROR);
                rec.int0 = *status_indicator_id;
                rec.text_length = put_text(&mut rec.text, message)?;
                rec
            }
            DriverEvent::ClientTimeout { client_id } => {
                let mut rec = Self::zeroed(CLIENT_TIMEOUT);
                rec.long0 = *client_id;
                rec
            }
            DriverEvent::Unknown { type_id } => Self::zeroed(*type_id),
        };
        Ok(rec)
    }

    pub fn decode(&self) -> DriverEvent {
        use event_type::*;
        let text = || get_text(&self.text, self.text_length);
        match self.type_id {
            PUBLICATION_READY | EXCLUSIVE_PUBLICATION_READY => DriverEvent::PublicationReady {
                correlation_id: self.long0,
                registration_id: self.long1,
                stream_id: self.int0,
                session_id: self.int1,
                publication_limit_id: self.int2,
                channel_status_id: self.int3,
                log_file_name: text(),
                exclusive: self.type_id == EXCLUSIVE_PUBLICATION_READY,
            },
            SUBSCRIPTION_READY => DriverEvent::SubscriptionReady {
                correlation_id: self.long0,
                channel_status_id: self.int3,
            },
            OPERATION_SUCCESS => DriverEvent::OperationSuccess {
                correlation_id: self.long0,
            },
            AVAILABLE_IMAGE => DriverEvent::AvailableImage {
                correlation_id: self.long0,
                session_id: self.int1,
                subscription_registration_id: self.long1,
                subscriber_position_id: self.int2,
                log_file_name: text(),
                source_identity: get_text(&self.extra, self.extra_length),
            },
            UNAVAILABLE_IMAGE => DriverEvent::UnavailableImage {
                correlation_id: self.long0,
                subscription_registration_id: self.long1,
                stream_id: self.int0,
            },
            COUNTER_READY => DriverEvent::CounterReady {
                correlation_id: self.long0,
                counter_id: self.int0,
            },
            UNAVAILABLE_COUNTER => DriverEvent::UnavailableCounter {
                registration_id: self.long0,
                counter_id: self.int0,
            },
            ERROR => DriverEvent::Error {
                correlation_id: self.long0,
                code: self.int0,
                message: text(),
            },
            CHANNEL_ENDPOINT_ERROR => DriverEvent::ChannelEndpointError {
                status_indicator_id: self.int0,
                message: text(),
            },
            CLIENT_TIMEOUT => DriverEvent::ClientTimeout { client_id: self.long0 },
            other => DriverEvent::Unknown { type_id: other },
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client half of the command path.
pub struct ShmToDriver {
    cnc: Arc<CncFile>,
    ring: ShmRing<CommandRecord, TO_DRIVER_CAPACITY>,
    client_id: i64,
}

impl ToDriver for ShmToDriver {
    fn client_id(&self) -> i64 {
        self.client_id
    }

    fn next_correlation_id(&mut self) -> i64 {
        self.cnc.next_correlation_id()
    }

    fn send(&mut self, message: CommandMessage) -> Result<()> {
        let record = CommandRecord::encode(&message)?;
        if self.ring.write(&record) {
            Ok(())
        } else {
            Err(Error::CommandBufferFull)
        }
    }

    fn time_of_last_driver_keepalive_ms(&self) -> i64 {
        self.cnc.driver_heartbeat_ms()
    }
}

/// Client half of the event path.
pub struct ShmToClients {
    ring: ShmRing<EventRecord, TO_CLIENTS_CAPACITY>,
}

impl ToClients for ShmToClients {
    fn receive(&mut self, sink: &mut Vec<DriverEvent>) -> Result<usize> {
        let lost = self.ring.overwritten();
        if lost > 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver overwrote {lost} unread events"),
            )));
        }
        let mut count = 0;
        while let Some(rec) = self.ring.read() {
            sink.push(rec.decode());
            count += 1;
        }
        Ok(count)
    }

    fn is_invalid(&self) -> bool {
        self.ring.overwritten() > 0
    }
}

/// Attach to a running driver under `dir`. The client id is drawn from the
/// driver's correlation id sequence.
pub fn connect(dir: &str) -> io::Result<(ShmToDriver, ShmToClients)> {
    let cnc = Arc::new(CncFile::open(dir)?);
    let to_driver = ShmRing::open_existing(&to_driver_name(dir))?;
    let to_clients = ShmRing::open_existing(&to_clients_name(dir))?;
    let client_id = cnc.next_correlation_id();
    tracing::info!(dir, client_id, driver_pid = cnc.driver_pid(), "attached to driver");
    Ok((
        ShmToDriver {
            cnc,
            ring: to_driver,
            client_id,
        },
        ShmToClients { ring: to_clients },
    ))
}

// ---------------------------------------------------------------------------
// Driver side
// ---------------------------------------------------------------------------

/// The driver's ends of the rings plus the CnC header it owns.
pub struct DriverEndpoint {
    cnc: CncFile,
    commands: ShmRing<CommandRecord, TO_DRIVER_CAPACITY>,
    events: ShmRing<EventRecord, TO_CLIENTS_CAPACITY>,
}

impl DriverEndpoint {
    pub fn create(dir: &str, client_liveness_timeout_ns: i64) -> io::Result<Self> {
        let commands = ShmRing::open_or_create(&to_driver_name(dir))?;
        let events = ShmRing::open_or_create(&to_clients_name(dir))?;
        let cnc = CncFile::create(dir, client_liveness_timeout_ns)?;
        Ok(Self { cnc, commands, events })
    }

    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    pub fn heartbeat(&self, now_ms: i64) {
        self.cnc.set_driver_heartbeat_ms(now_ms);
    }

    /// Drain pending commands into `sink`. Unknown records are skipped.
    pub fn poll_commands(&self, sink: &mut Vec<CommandMessage>) -> usize {
        let mut count = 0;
        while let Some(rec) = self.commands.read() {
            match rec.decode() {
                Some(msg) => sink.push(msg),
                None => tracing::debug!(type_id = rec.type_id, "skipping unknown command"),
            }
            count += 1;
        }
        count
    }

    /// Broadcast an event. Never blocks: a client that falls behind loses
    /// its oldest events and sees its channel as invalid. Fails only if a
    /// file name or message does not fit the record.
    pub fn send_event(&self, event: &DriverEvent) -> Result<()> {
        self.events.write_overwrite(&EventRecord::encode(event)?);
        Ok(())
    }
}
