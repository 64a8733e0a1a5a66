// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory counters: a metadata region describing each counter and a
// values region holding the live 64-bit values. The driver allocates
// counters; the client reads status indicators and positions, writes its own
// heartbeat, and finds counters by type id and registration id.

use std::io;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::shm::{ShmHandle, ShmOpenMode};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_KEY_LENGTH: usize = 112;
pub const MAX_LABEL_LENGTH: usize = 380;

pub const METADATA_LENGTH: usize = std::mem::size_of::<MetadataRecord>();
pub const VALUE_LENGTH: usize = std::mem::size_of::<ValueRecord>();

pub const NULL_COUNTER_ID: i32 = -1;

pub const RECORD_UNUSED: i32 = 0;
pub const RECORD_ALLOCATED: i32 = 1;
pub const RECORD_RECLAIMED: i32 = -1;

/// Type id of the per-client heartbeat timestamp counter.
pub const CLIENT_HEARTBEAT_TYPE_ID: i32 = 11;

/// Channel endpoint status values.
pub mod channel_status {
    pub const ERRORED: i64 = -1;
    pub const INITIALIZING: i64 = 0;
    pub const ACTIVE: i64 = 1;
    pub const CLOSING: i64 = 2;

    /// Status indicator id for an endpoint that has no counter.
    pub const NO_ID_ALLOCATED: i32 = -1;
}

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct MetadataRecord {
    state: AtomicI32,
    type_id: AtomicI32,
    free_for_reuse_deadline_ms: AtomicI64,
    key: [u8; MAX_KEY_LENGTH],
    label_length: AtomicI32,
    label: [u8; MAX_LABEL_LENGTH],
}

const _: () = assert!(std::mem::size_of::<MetadataRecord>() == 512);

#[repr(C)]
struct ValueRecord {
    value: AtomicI64,
    registration_id: AtomicI64,
    owner_id: AtomicI64,
    _pad: [u8; 128 - 24],
}

const _: () = assert!(std::mem::size_of::<ValueRecord>() == 128);

pub fn metadata_name(dir: &str) -> String {
    format!("{dir}-counters-metadata")
}

pub fn values_name(dir: &str) -> String {
    format!("{dir}-counters-values")
}

// ---------------------------------------------------------------------------
// CountersReader
// ---------------------------------------------------------------------------

/// Read access to the counters regions, plus writes to counter values.
pub struct CountersReader {
    metadata: ShmHandle,
    values: ShmHandle,
    max_counter_id: i32,
}

impl CountersReader {
    pub fn new(metadata: ShmHandle, values: ShmHandle) -> io::Result<Self> {
        let by_values = values.user_size() / VALUE_LENGTH;
        let by_metadata = metadata.user_size() / METADATA_LENGTH;
        let capacity = by_values.min(by_metadata);
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "counters regions too small for a single record",
            ));
        }
        Ok(Self {
            metadata,
            values,
            max_counter_id: capacity as i32 - 1,
        })
    }

    /// Map the counters the driver created under `dir`.
    pub fn open(dir: &str) -> io::Result<Self> {
        let metadata = ShmHandle::open_existing(&metadata_name(dir))?;
        let values = ShmHandle::open_existing(&values_name(dir))?;
        Self::new(metadata, values)
    }

    pub fn max_counter_id(&self) -> i32 {
        self.max_counter_id
    }

    fn in_range(&self, counter_id: i32) -> bool {
        counter_id >= 0 && counter_id <= self.max_counter_id
    }

    fn meta(&self, counter_id: i32) -> Option<&MetadataRecord> {
        if !self.in_range(counter_id) {
            return None;
        }
        let base = self.metadata.as_ptr();
        Some(unsafe { &*(base.add(counter_id as usize * METADATA_LENGTH) as *const MetadataRecord) })
    }

    fn value_record(&self, counter_id: i32) -> Option<&ValueRecord> {
        if !self.in_range(counter_id) {
            return None;
        }
        let base = self.values.as_ptr();
        Some(unsafe { &*(base.add(counter_id as usize * VALUE_LENGTH) as *const ValueRecord) })
    }

    pub fn counter_state(&self, counter_id: i32) -> i32 {
        self.meta(counter_id)
            .map(|m| m.state.load(Ordering::Acquire))
            .unwrap_or(RECORD_UNUSED)
    }

    pub fn counter_type_id(&self, counter_id: i32) -> i32 {
        self.meta(counter_id)
            .map(|m| m.type_id.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn counter_value(&self, counter_id: i32) -> i64 {
        self.value_record(counter_id)
            .map(|v| v.value.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn counter_registration_id(&self, counter_id: i32) -> i64 {
        self.value_record(counter_id)
            .map(|v| v.registration_id.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn counter_key(&self, counter_id: i32) -> &[u8] {
        self.meta(counter_id).map(|m| &m.key[..]).unwrap_or(&[])
    }

    pub fn counter_label(&self, counter_id: i32) -> String {
        match self.meta(counter_id) {
            Some(m) => {
                let len = (m.label_length.load(Ordering::Acquire).max(0) as usize).min(MAX_LABEL_LENGTH);
                String::from_utf8_lossy(&m.label[..len]).into_owned()
            }
            None => String::new(),
        }
    }

    /// Visit every allocated counter as `(counter_id, type_id, key, label)`.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(i32, i32, &[u8], &str),
    {
        for id in 0..=self.max_counter_id {
            match self.counter_state(id) {
                RECORD_ALLOCATED => {
                    let label = self.counter_label(id);
                    f(id, self.counter_type_id(id), self.counter_key(id), &label);
                }
                RECORD_UNUSED => break,
                _ => {}
            }
        }
    }

    /// The live value slot of `counter_id`.
    pub(crate) fn value_slot(&self, counter_id: i32) -> Option<&AtomicI64> {
        self.value_record(counter_id).map(|v| &v.value)
    }
}

impl std::fmt::Debug for CountersReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountersReader")
            .field("max_counter_id", &self.max_counter_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AtomicCounter
// ---------------------------------------------------------------------------

/// A single counter value, shared with the driver.
pub struct AtomicCounter {
    reader: std::sync::Arc<CountersReader>,
    counter_id: i32,
}

impl AtomicCounter {
    pub fn new(reader: std::sync::Arc<CountersReader>, counter_id: i32) -> Option<Self> {
        reader.value_slot(counter_id)?;
        Some(Self { reader, counter_id })
    }

    pub fn id(&self) -> i32 {
        self.counter_id
    }

    fn slot(&self) -> &AtomicI64 {
        // Range-checked in `new`.
        self.reader
            .value_slot(self.counter_id)
            .unwrap_or_else(|| unreachable!("counter id checked on construction"))
    }

    pub fn get(&self) -> i64 {
        self.slot().load(Ordering::Acquire)
    }

    pub fn set_ordered(&self, value: i64) {
        self.slot().store(value, Ordering::Release);
    }

    pub fn increment(&self) -> i64 {
        self.slot().fetch_add(1, Ordering::AcqRel)
    }
}

// ---------------------------------------------------------------------------
// Heartbeat lookup
// ---------------------------------------------------------------------------

fn key_registration_id(key: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[..8]);
    i64::from_le_bytes(bytes)
}

/// Find the heartbeat counter whose key holds `registration_id`.
pub fn find_heartbeat_counter_id(reader: &CountersReader, type_id: i32, registration_id: i64) -> i32 {
    for id in 0..=reader.max_counter_id() {
        match reader.counter_state(id) {
            RECORD_ALLOCATED => {
                if reader.counter_type_id(id) == type_id
                    && key_registration_id(reader.counter_key(id)) == registration_id
                {
                    return id;
                }
            }
            RECORD_UNUSED => break,
            _ => {}
        }
    }
    NULL_COUNTER_ID
}

/// Whether `counter_id` is still the heartbeat counter of `registration_id`.
pub fn is_heartbeat_active(reader: &CountersReader, counter_id: i32, type_id: i32, registration_id: i64) -> bool {
    reader.counter_state(counter_id) == RECORD_ALLOCATED
        && reader.counter_type_id(counter_id) == type_id
        && key_registration_id(reader.counter_key(counter_id)) == registration_id
}

/// Status of a channel endpoint given its status indicator id.
pub fn channel_status(reader: &CountersReader, channel_status_id: i32) -> i64 {
    match channel_status_id {
        0 => channel_status::INITIALIZING,
        channel_status::NO_ID_ALLOCATED => channel_status::ACTIVE,
        id => reader.counter_value(id),
    }
}

// ---------------------------------------------------------------------------
// CountersManager
// ---------------------------------------------------------------------------

/// Allocates and frees counters. Lives on the driver side; an embedded
/// driver or a test harness uses it to publish counters a client can see.
pub struct CountersManager {
    reader: std::sync::Arc<CountersReader>,
}

impl CountersManager {
    /// Create (or reuse) the counters regions under `dir` with room for
    /// `capacity` counters.
    pub fn create(dir: &str, capacity: usize) -> io::Result<Self> {
        let metadata = ShmHandle::acquire(
            &metadata_name(dir),
            capacity * METADATA_LENGTH,
            ShmOpenMode::CreateOrOpen,
        )?;
        let values = ShmHandle::acquire(&values_name(dir), capacity * VALUE_LENGTH, ShmOpenMode::CreateOrOpen)?;
        Ok(Self {
            reader: std::sync::Arc::new(CountersReader::new(metadata, values)?),
        })
    }

    pub fn reader(&self) -> &std::sync::Arc<CountersReader> {
        &self.reader
    }

    /// Claim the first free record. Returns the counter id.
    pub fn allocate(&self, type_id: i32, key: &[u8], label: &str) -> io::Result<i32> {
        if key.len() > MAX_KEY_LENGTH || label.len() > MAX_LABEL_LENGTH {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "key or label too long"));
        }
        for id in 0..=self.reader.max_counter_id() {
            let Some(meta) = self.reader.meta(id) else { break };
            let state = meta.state.load(Ordering::Acquire);
            if state == RECORD_ALLOCATED {
                continue;
            }
            if meta
                .state
                .compare_exchange(state, i32::MIN, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // Record claimed: fill it in, then publish with a release store.
            let rec = unsafe {
                self.reader.metadata.as_mut_ptr().add(id as usize * METADATA_LENGTH) as *mut MetadataRecord
            };
            unsafe {
                let key_ptr = std::ptr::addr_of_mut!((*rec).key) as *mut u8;
                std::ptr::write_bytes(key_ptr, 0, MAX_KEY_LENGTH);
                std::ptr::copy_nonoverlapping(key.as_ptr(), key_ptr, key.len());
                let label_ptr = std::ptr::addr_of_mut!((*rec).label) as *mut u8;
                std::ptr::write_bytes(label_ptr, 0, MAX_LABEL_LENGTH);
                std::ptr::copy_nonoverlapping(label.as_ptr(), label_ptr, label.len());
            }
            meta.label_length.store(label.len() as i32, Ordering::Relaxed);
            meta.type_id.store(type_id, Ordering::Relaxed);
            if let Some(v) = self.reader.value_record(id) {
                v.value.store(0, Ordering::Relaxed);
                v.registration_id.store(0, Ordering::Relaxed);
                v.owner_id.store(0, Ordering::Relaxed);
            }
            meta.state.store(RECORD_ALLOCATED, Ordering::Release);
            return Ok(id);
        }
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "counters regions are full"))
    }

    /// Allocate a counter whose key starts with `registration_id`.
    pub fn allocate_keyed(&self, type_id: i32, registration_id: i64, label: &str) -> io::Result<i32> {
        self.allocate(type_id, &registration_id.to_le_bytes(), label)
    }

    pub fn free(&self, counter_id: i32) {
        if let Some(meta) = self.reader.meta(counter_id) {
            meta.state.store(RECORD_RECLAIMED, Ordering::Release);
        }
    }

    pub fn set_value(&self, counter_id: i32, value: i64) {
        if let Some(slot) = self.reader.value_slot(counter_id) {
            slot.store(value, Ordering::Release);
        }
    }

    pub fn set_registration_id(&self, counter_id: i32, registration_id: i64) {
        if let Some(v) = self.reader.value_record(counter_id) {
            v.registration_id.store(registration_id, Ordering::Release);
        }
    }
}
