// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the client conductor.

use std::io;

/// Error codes the driver attaches to a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GenericError,
    InvalidChannel,
    UnknownSubscription,
    UnknownPublication,
    ChannelEndpointError,
    UnknownCounter,
    UnknownCommandTypeId,
    MalformedCommand,
    NotSupported,
    UnknownHost,
    ResourceTemporarilyUnavailable,
    Unknown(i32),
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::GenericError,
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            4 => ErrorCode::ChannelEndpointError,
            5 => ErrorCode::UnknownCounter,
            6 => ErrorCode::UnknownCommandTypeId,
            7 => ErrorCode::MalformedCommand,
            8 => ErrorCode::NotSupported,
            9 => ErrorCode::UnknownHost,
            10 => ErrorCode::ResourceTemporarilyUnavailable,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ErrorCode::GenericError => 0,
            ErrorCode::InvalidChannel => 1,
            ErrorCode::UnknownSubscription => 2,
            ErrorCode::UnknownPublication => 3,
            ErrorCode::ChannelEndpointError => 4,
            ErrorCode::UnknownCounter => 5,
            ErrorCode::UnknownCommandTypeId => 6,
            ErrorCode::MalformedCommand => 7,
            ErrorCode::NotSupported => 8,
            ErrorCode::UnknownHost => 9,
            ErrorCode::ResourceTemporarilyUnavailable => 10,
            ErrorCode::Unknown(code) => code,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("client is closed")]
    ClientClosed,

    #[error("client is terminating")]
    ClientTerminating,

    #[error("reentrant calls not permitted during callbacks")]
    ReentrantCall,

    #[error("registration error: correlation_id={correlation_id} code={code} {error_code:?}: {message}")]
    Registration {
        correlation_id: i64,
        code: i32,
        error_code: ErrorCode,
        message: String,
    },

    #[error("driver timeout: {0}")]
    DriverTimeout(String),

    #[error("service interval exceeded (ns): timeout={timeout_ns}, actual={actual_ns}")]
    ServiceTimeout { timeout_ns: i64, actual_ns: i64 },

    #[error("client timeout from driver")]
    ClientTimeout,

    #[error("unexpected close of heartbeat timestamp counter: {counter_id}")]
    HeartbeatCounterClosed { counter_id: i32 },

    #[error("channel endpoint error: status_indicator_id={status_indicator_id} {message}")]
    ChannelEndpoint {
        status_indicator_id: i32,
        message: String,
    },

    #[error("callback panicked: {0}")]
    Callback(String),

    #[error("interrupted while awaiting driver response")]
    Interrupted,

    #[error("agent terminated")]
    AgentTermination,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("to-driver command buffer is full")]
    CommandBufferFull,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors that leave the conductor Terminating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ServiceTimeout { .. }
                | Error::ClientTimeout
                | Error::HeartbeatCounterClosed { .. }
                | Error::Interrupted
                | Error::AgentTermination
        )
    }

    pub(crate) fn registration(correlation_id: i64, code: i32, message: impl Into<String>) -> Self {
        Error::Registration {
            correlation_id,
            code,
            error_code: ErrorCode::from_code(code),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
