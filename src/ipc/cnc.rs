// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Command-and-control header shared by the driver and its clients: layout
// version, driver liveness timestamp and the correlation id sequence.

use std::io;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::shm::{ShmHandle, ShmOpenMode};

pub const CNC_VERSION: i32 = 1;

#[repr(C)]
struct CncHeader {
    version: AtomicI32,
    driver_pid: AtomicI32,
    client_liveness_timeout_ns: AtomicI64,
    driver_heartbeat_ms: AtomicI64,
    next_correlation_id: AtomicI64,
}

pub fn cnc_name(dir: &str) -> String {
    format!("{dir}-cnc")
}

pub struct CncFile {
    shm: ShmHandle,
}

impl CncFile {
    /// Driver side: create the header and stamp the version last so a
    /// client never sees a half-initialised file.
    pub fn create(dir: &str, client_liveness_timeout_ns: i64) -> io::Result<Self> {
        let shm = ShmHandle::acquire(
            &cnc_name(dir),
            std::mem::size_of::<CncHeader>(),
            ShmOpenMode::CreateOrOpen,
        )?;
        let cnc = Self { shm };
        let hdr = cnc.hdr();
        hdr.driver_pid.store(std::process::id() as i32, Ordering::Relaxed);
        hdr.client_liveness_timeout_ns
            .store(client_liveness_timeout_ns, Ordering::Relaxed);
        let _ = hdr
            .next_correlation_id
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed);
        hdr.version.store(CNC_VERSION, Ordering::Release);
        Ok(cnc)
    }

    /// Client side: open an existing header and check its version.
    pub fn open(dir: &str) -> io::Result<Self> {
        let shm = ShmHandle::acquire(
            &cnc_name(dir),
            std::mem::size_of::<CncHeader>(),
            ShmOpenMode::Open,
        )?;
        let cnc = Self { shm };
        let version = cnc.hdr().version.load(Ordering::Acquire);
        if version != CNC_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CnC version mismatch: file={version} expected={CNC_VERSION}"),
            ));
        }
        Ok(cnc)
    }

    fn hdr(&self) -> &CncHeader {
        unsafe { &*(self.shm.as_ptr() as *const CncHeader) }
    }

    pub fn driver_pid(&self) -> i32 {
        self.hdr().driver_pid.load(Ordering::Acquire)
    }

    pub fn client_liveness_timeout_ns(&self) -> i64 {
        self.hdr().client_liveness_timeout_ns.load(Ordering::Acquire)
    }

    pub fn driver_heartbeat_ms(&self) -> i64 {
        self.hdr().driver_heartbeat_ms.load(Ordering::Acquire)
    }

    pub fn set_driver_heartbeat_ms(&self, now_ms: i64) {
        self.hdr().driver_heartbeat_ms.store(now_ms, Ordering::Release);
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.hdr().next_correlation_id.fetch_add(1, Ordering::AcqRel)
    }
}
