// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Conductor bookkeeping: live resources by registration id, mapped log
// buffers by registration id, buffers waiting out their linger period, and
// correlation ids of async commands still awaiting a response. None of it
// blocks or does I/O beyond mapping and unmapping files.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use crate::clock::elapsed_before;
use crate::log_buffers::LogBuffers;
use crate::resource::Resource;

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<i64, Resource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource previously registered under `registration_id`.
    pub fn register(&mut self, registration_id: i64, resource: Resource) -> Option<Resource> {
        self.resources.insert(registration_id, resource)
    }

    pub fn lookup(&self, registration_id: i64) -> Option<&Resource> {
        self.resources.get(&registration_id)
    }

    pub fn unregister(&mut self, registration_id: i64) -> Option<Resource> {
        self.resources.remove(&registration_id)
    }

    pub fn contains(&self, registration_id: i64) -> bool {
        self.resources.contains_key(&registration_id)
    }

    /// Ids of every resource whose channel status indicator is `status_id`.
    pub fn ids_with_channel_status(&self, status_id: i32) -> Vec<i64> {
        self.resources
            .iter()
            .filter(|(_, r)| r.channel_status_id() == Some(status_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove everything, handing the resources back for closing.
    pub fn drain(&mut self) -> Vec<(i64, Resource)> {
        self.resources.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LogBufferCache
// ---------------------------------------------------------------------------

/// Channel parameter that turns off pre-touching for a stream.
const SPARSE_PARAM: &str = "sparse=true";

/// Maps each log buffer once per registration id and counts its users. A
/// buffer whose count drops to zero moves to the lingering set and stays
/// mapped until [`LogBufferCache::sweep`] finds it older than the linger
/// duration.
#[derive(Default)]
pub struct LogBufferCache {
    by_id: HashMap<i64, Arc<LogBuffers>>,
    lingering: Vec<Arc<LogBuffers>>,
}

impl LogBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map on first use, otherwise bump the count of the existing mapping.
    pub fn acquire(
        &mut self,
        registration_id: i64,
        file_name: &str,
        channel: &str,
        pre_touch: bool,
    ) -> io::Result<Arc<LogBuffers>> {
        let buffers = match self.by_id.get(&registration_id) {
            Some(existing) => Arc::clone(existing),
            None => {
                let mapped = Arc::new(LogBuffers::map(file_name)?);
                if pre_touch && !channel.contains(SPARSE_PARAM) {
                    mapped.pre_touch();
                }
                self.by_id.insert(registration_id, Arc::clone(&mapped));
                mapped
            }
        };
        buffers.inc_ref();
        Ok(buffers)
    }

    /// Drop one reference. At zero the buffer is stamped with `now_ns` and
    /// starts lingering.
    pub fn release(&mut self, buffers: &Arc<LogBuffers>, registration_id: i64, now_ns: i64) {
        if buffers.dec_ref() == 0 {
            buffers.set_time_of_last_state_change(now_ns);
            self.by_id.remove(&registration_id);
            tracing::debug!(registration_id, file_name = buffers.file_name(), "log buffer lingering");
            self.lingering.push(Arc::clone(buffers));
        }
    }

    pub fn get(&self, registration_id: i64) -> Option<&Arc<LogBuffers>> {
        self.by_id.get(&registration_id)
    }

    /// Unmap every lingering buffer older than `linger_ns`. Returns how many
    /// were deleted.
    pub fn sweep(&mut self, now_ns: i64, linger_ns: i64) -> usize {
        let mut deleted = 0;
        let mut i = self.lingering.len();
        while i > 0 {
            i -= 1;
            if !elapsed_before(self.lingering[i].time_of_last_state_change(), linger_ns, now_ns) {
                let buffers = self.lingering.swap_remove(i);
                tracing::debug!(file_name = buffers.file_name(), "deleting lingering log buffer");
                buffers.delete();
                deleted += 1;
            }
        }
        deleted
    }

    /// Unmap every lingering buffer now, linger or not.
    pub fn delete_all_lingering(&mut self) {
        for buffers in self.lingering.drain(..) {
            buffers.delete();
        }
    }

    pub fn lingering(&self) -> &[Arc<LogBuffers>] {
        &self.lingering
    }

    pub fn mapped_count(&self) -> usize {
        self.by_id.len()
    }
}

// ---------------------------------------------------------------------------
// AsyncCommandSet
// ---------------------------------------------------------------------------

/// Correlation ids of async commands whose response has not been seen yet.
#[derive(Debug, Default)]
pub struct AsyncCommandSet {
    ids: HashSet<i64>,
}

impl AsyncCommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, correlation_id: i64) {
        self.ids.insert(correlation_id);
    }

    /// True if the id was pending.
    pub fn remove(&mut self, correlation_id: i64) -> bool {
        self.ids.remove(&correlation_id)
    }

    pub fn contains(&self, correlation_id: i64) -> bool {
        self.ids.contains(&correlation_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
