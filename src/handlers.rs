// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Application callbacks and the ordered lists that hold them.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::counters::CountersReader;
use crate::error::{Error, Result};
use crate::resource::Image;

pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

pub type AvailableImageHandler = Arc<dyn Fn(&Image) + Send + Sync>;

pub type UnavailableImageHandler = Arc<dyn Fn(&Image) + Send + Sync>;

/// Called with the counters reader, registration id and counter id.
pub type AvailableCounterHandler = Arc<dyn Fn(&CountersReader, i64, i32) + Send + Sync>;

pub type UnavailableCounterHandler = Arc<dyn Fn(&CountersReader, i64, i32) + Send + Sync>;

pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Logs through `tracing` at error level.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|e: &Error| tracing::error!(error = %e, "client error"))
}

/// Token returned when a handler is added; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handlers in registration order.
pub struct HandlerList<H> {
    entries: Vec<(HandlerId, H)>,
    next_id: u64,
}

impl<H: Clone> HandlerList<H> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, handler));
        id
    }

    /// Returns false if `id` was not (or no longer) registered.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Copy of the current handlers, so invoking them never holds the list.
    pub fn snapshot(&self) -> Vec<H> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Clone> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run application code, turning a panic into `Error::Callback`.
pub(crate) fn isolate<R>(f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Error::Callback(panic_message(payload)))
}
