// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client-side conductor for a shared-memory messaging driver. Blocking API
// calls over an asynchronous command/event protocol, a registry of live
// publications, subscriptions, images and counters with ref-counted log
// buffer mappings, and the duty cycle that watches driver and client
// liveness.

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

pub mod error;
pub use error::{Error, ErrorCode, Result};

pub mod clock;
pub mod idle;
pub mod agent;
pub mod counters;
pub mod log_buffers;
pub mod command;
pub mod ipc;
pub mod handlers;
pub mod registry;
pub mod resource;

pub mod context;
pub use context::Context;

pub mod conductor;
pub use conductor::{ClientConductor, ConductorAgent};

mod client;
pub use client::Client;

pub use resource::{Counter, Image, Publication, Subscription};
