// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform handle to a named shared-memory file.
// Log buffers, counters and the command-and-control header are all mapped
// through this type; platform::PlatformShm does the syscalls.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::platform::{PlatformShm, ShmMode};

/// Open mode for shared memory files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively, fail if the name exists.
    Create,
    /// Open an existing file, fail if it does not exist.
    Open,
    /// Create if missing, open otherwise.
    CreateOrOpen,
}

impl From<ShmOpenMode> for ShmMode {
    fn from(mode: ShmOpenMode) -> Self {
        match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        }
    }
}

/// A mapped, named shared memory file.
///
/// The mapping is released on drop. A trailing atomic counter shared by all
/// processes tracks how many mappings of the same name are live, which is how
/// a driver (or a test) can observe that a client really unmapped a file.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Map `name` with `size` usable bytes.
    ///
    /// With [`ShmOpenMode::Open`] a `size` of 0 maps whatever length the
    /// creator gave the file; this is how log buffers are mapped by name.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size, mode.into())?;
        Ok(Self { inner })
    }

    /// Map an existing file at its full length.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        Self::acquire(name, 0, ShmOpenMode::Open)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Total mapped length, including the trailing mapping counter.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// Usable length.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Live mappings of this file across every process.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Remove the name; existing mappings stay valid.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// Usable region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.user_size()) }
    }

    /// Touch one byte per page so the first real access does not fault.
    pub fn pre_touch(&self) {
        const PAGE_SIZE: usize = 4096;
        let base = self.as_mut_ptr();
        let len = self.user_size();
        let mut offset = 0;
        while offset + 4 <= len {
            // CAS 0 -> 0 writes the page without disturbing data the driver put there.
            let word = unsafe { &*(base.add(offset) as *const AtomicI32) };
            let _ = word.compare_exchange(0, 0, Ordering::Relaxed, Ordering::Relaxed);
            offset += PAGE_SIZE;
        }
    }
}

impl std::fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmHandle")
            .field("name", &self.name())
            .field("user_size", &self.user_size())
            .finish()
    }
}
