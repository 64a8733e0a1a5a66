// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The conductor's boundary with the driver: commands going out, events
// coming back, and the transport traits that carry them.

use crate::error::Result;

pub const NULL_VALUE: i64 = -1;

/// A command for the driver. Results arrive later as [`DriverEvent`]s
/// carrying the command's correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    AddPublication { channel: String, stream_id: i32 },
    AddExclusivePublication { channel: String, stream_id: i32 },
    RemovePublication { registration_id: i64 },
    AddSubscription { channel: String, stream_id: i32 },
    RemoveSubscription { registration_id: i64 },
    AddDestination { registration_id: i64, channel: String },
    RemoveDestination { registration_id: i64, channel: String },
    AddRcvDestination { registration_id: i64, channel: String },
    RemoveRcvDestination { registration_id: i64, channel: String },
    AddCounter { type_id: i32, key: Vec<u8>, label: String },
    RemoveCounter { registration_id: i64 },
    ClientKeepalive,
    ClientClose,
}

/// A command with its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub command: DriverCommand,
}

/// An event emitted by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    PublicationReady {
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit_id: i32,
        channel_status_id: i32,
        log_file_name: String,
        exclusive: bool,
    },
    SubscriptionReady {
        correlation_id: i64,
        channel_status_id: i32,
    },
    OperationSuccess {
        correlation_id: i64,
    },
    AvailableImage {
        correlation_id: i64,
        session_id: i32,
        subscription_registration_id: i64,
        subscriber_position_id: i32,
        log_file_name: String,
        source_identity: String,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    CounterReady {
        correlation_id: i64,
        counter_id: i32,
    },
    UnavailableCounter {
        registration_id: i64,
        counter_id: i32,
    },
    Error {
        correlation_id: i64,
        code: i32,
        message: String,
    },
    ChannelEndpointError {
        status_indicator_id: i32,
        message: String,
    },
    ClientTimeout {
        client_id: i64,
    },
    /// A type id this client does not understand; ignored.
    Unknown {
        type_id: i32,
    },
}

/// Outbound half of the driver transport.
pub trait ToDriver: Send {
    /// Id the driver knows this client by.
    fn client_id(&self) -> i64;

    /// A fresh correlation id, unique across every client of the driver.
    fn next_correlation_id(&mut self) -> i64;

    /// Queue one command. Must not block.
    fn send(&mut self, message: CommandMessage) -> Result<()>;

    /// Epoch millis of the driver's last keep-alive.
    fn time_of_last_driver_keepalive_ms(&self) -> i64;
}

/// Inbound half of the driver transport. The conductor is the only reader.
pub trait ToClients: Send {
    /// Move every pending event into `sink`; returns how many were moved.
    fn receive(&mut self, sink: &mut Vec<DriverEvent>) -> Result<usize>;

    /// Whether the channel is broken beyond recovery (e.g. the driver
    /// overwrote events this client never read).
    fn is_invalid(&self) -> bool {
        false
    }
}

/// Builds and sends commands, handing back the correlation id of each.
pub struct DriverProxy {
    to_driver: Box<dyn ToDriver>,
    client_id: i64,
}

impl DriverProxy {
    pub fn new(to_driver: Box<dyn ToDriver>) -> Self {
        let client_id = to_driver.client_id();
        Self { to_driver, client_id }
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn time_of_last_driver_keepalive_ms(&self) -> i64 {
        self.to_driver.time_of_last_driver_keepalive_ms()
    }

    fn send(&mut self, command: DriverCommand) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        tracing::debug!(correlation_id, ?command, "sending driver command");
        self.to_driver.send(CommandMessage {
            client_id: self.client_id,
            correlation_id,
            command,
        })?;
        Ok(correlation_id)
    }

    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.send(DriverCommand::AddPublication {
            channel: channel.to_owned(),
            stream_id,
        })
    }

    pub fn add_exclusive_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.send(DriverCommand::AddExclusivePublication {
            channel: channel.to_owned(),
            stream_id,
        })
    }

    pub fn remove_publication(&mut self, registration_id: i64) -> Result<i64> {
        self.send(DriverCommand::RemovePublication { registration_id })
    }

    pub fn add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.send(DriverCommand::AddSubscription {
            channel: channel.to_owned(),
            stream_id,
        })
    }

    pub fn remove_subscription(&mut self, registration_id: i64) -> Result<i64> {
        self.send(DriverCommand::RemoveSubscription { registration_id })
    }

    pub fn add_destination(&mut self, registration_id: i64, channel: &str) -> Result<i64> {
        self.send(DriverCommand::AddDestination {
            registration_id,
            channel: channel.to_owned(),
        })
    }

    pub fn remove_destination(&mut self, registration_id: i64, channel: &str) -> Result<i64> {
        self.send(DriverCommand::RemoveDestination {
            registration_id,
            channel: channel.to_owned(),
        })
    }

    pub fn add_rcv_destination(&mut self, registration_id: i64, channel: &str) -> Result<i64> {
        self.send(DriverCommand::AddRcvDestination {
            registration_id,
            channel: channel.to_owned(),
        })
    }

    pub fn remove_rcv_destination(&mut self, registration_id: i64, channel: &str) -> Result<i64> {
        self.send(DriverCommand::RemoveRcvDestination {
            registration_id,
            channel: channel.to_owned(),
        })
    }

    pub fn add_counter(&mut self, type_id: i32, key: &[u8], label: &str) -> Result<i64> {
        self.send(DriverCommand::AddCounter {
            type_id,
            key: key.to_vec(),
            label: label.to_owned(),
        })
    }

    pub fn remove_counter(&mut self, registration_id: i64) -> Result<i64> {
        self.send(DriverCommand::RemoveCounter { registration_id })
    }

    pub fn client_close(&mut self) -> Result<()> {
        self.send(DriverCommand::ClientClose).map(|_| ())
    }
}

impl std::fmt::Debug for DriverProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverProxy").field("client_id", &self.client_id).finish()
    }
}

