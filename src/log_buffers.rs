// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A driver-created log buffer file mapped into this process.

use std::io;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::shm::ShmHandle;

/// A mapped log buffer shared by every resource that references it.
///
/// The reference count is client-local: it counts publications and images
/// holding the buffer, not processes. It is only changed under the client
/// lock but is atomic so handles can read it from any thread. The mapping
/// is dropped by [`LogBuffers::delete`], which the conductor calls once the
/// count has been zero for the linger duration.
pub struct LogBuffers {
    file_name: String,
    mapping: Mutex<Option<ShmHandle>>,
    ref_count: AtomicI32,
    time_of_last_state_change_ns: AtomicI64,
}

impl LogBuffers {
    /// Map the file the driver created as `file_name`.
    pub fn map(file_name: &str) -> io::Result<Self> {
        let mapping = ShmHandle::open_existing(file_name)?;
        tracing::debug!(file_name, length = mapping.user_size(), "mapped log buffer");
        Ok(Self {
            file_name: file_name.to_owned(),
            mapping: Mutex::new(Some(mapping)),
            ref_count: AtomicI32::new(0),
            time_of_last_state_change_ns: AtomicI64::new(0),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn inc_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_ref(&self) -> i32 {
        let count = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(count >= 0, "log buffer {} released more than acquired", self.file_name);
        count
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn time_of_last_state_change(&self) -> i64 {
        self.time_of_last_state_change_ns.load(Ordering::Acquire)
    }

    pub fn set_time_of_last_state_change(&self, now_ns: i64) {
        self.time_of_last_state_change_ns.store(now_ns, Ordering::Release);
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.lock().is_some()
    }

    /// Mapped length in bytes, 0 once deleted.
    pub fn length(&self) -> usize {
        self.mapping.lock().as_ref().map(|m| m.user_size()).unwrap_or(0)
    }

    pub fn pre_touch(&self) {
        if let Some(mapping) = self.mapping.lock().as_ref() {
            mapping.pre_touch();
        }
    }

    /// Run `f` over the mapped bytes, or return `None` if already unmapped.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.mapping.lock().as_ref().map(|m| f(m.as_slice()))
    }

    /// Unmap. Idempotent.
    pub fn delete(&self) {
        if let Some(mapping) = self.mapping.lock().take() {
            tracing::debug!(file_name = %self.file_name, "unmapped log buffer");
            drop(mapping);
        }
    }
}

impl std::fmt::Debug for LogBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffers")
            .field("file_name", &self.file_name)
            .field("ref_count", &self.ref_count())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
