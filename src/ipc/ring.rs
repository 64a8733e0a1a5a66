// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free single-producer single-consumer ring of fixed-size records over
// a named shared memory file. Carries commands to the driver and events
// back to the client.
//
// T must be Copy (plain bytes); N must be a power of two.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::shm::{ShmHandle, ShmOpenMode};

/// Cache-line padded header at the start of the file.
#[repr(C)]
struct Header {
    write_idx: AtomicU64,
    _pad0: [u8; 64 - 8],
    read_idx: AtomicU64,
    _pad1: [u8; 64 - 8],
    overwritten: AtomicU64,
    constructed: AtomicBool,
    _pad2: [u8; 64 - 9],
}

const _: () = assert!(std::mem::size_of::<Header>() == 192);

pub struct ShmRing<T: Copy + 'static, const N: usize> {
    shm: ShmHandle,
    _marker: PhantomData<T>,
}

impl<T: Copy + 'static, const N: usize> ShmRing<T, N> {
    const MASK: u64 = (N as u64) - 1;

    fn layout_size() -> usize {
        std::mem::size_of::<Header>() + std::mem::size_of::<T>() * N
    }

    /// Create the ring (or join one already created under `name`).
    pub fn open_or_create(name: &str) -> io::Result<Self> {
        assert!(N.is_power_of_two(), "ShmRing capacity N must be a power of two");
        let shm = ShmHandle::acquire(name, Self::layout_size(), ShmOpenMode::CreateOrOpen)?;
        let hdr = unsafe { &*(shm.as_ptr() as *const Header) };
        if !hdr.constructed.load(Ordering::Acquire) {
            hdr.write_idx.store(0, Ordering::Relaxed);
            hdr.read_idx.store(0, Ordering::Relaxed);
            hdr.overwritten.store(0, Ordering::Relaxed);
            unsafe {
                let slots = shm.as_mut_ptr().add(std::mem::size_of::<Header>());
                std::ptr::write_bytes(slots, 0, std::mem::size_of::<T>() * N);
            }
            hdr.constructed.store(true, Ordering::Release);
        }
        Ok(Self { shm, _marker: PhantomData })
    }

    /// Join a ring someone else created. Fails if it is missing or not yet
    /// initialised.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        assert!(N.is_power_of_two(), "ShmRing capacity N must be a power of two");
        let shm = ShmHandle::acquire(name, Self::layout_size(), ShmOpenMode::Open)?;
        let hdr = unsafe { &*(shm.as_ptr() as *const Header) };
        if !hdr.constructed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("ring {name} not initialised")));
        }
        Ok(Self { shm, _marker: PhantomData })
    }

    fn hdr(&self) -> &Header {
        unsafe { &*(self.shm.as_ptr() as *const Header) }
    }

    fn slot_ptr(&self, idx: u64) -> *mut T {
        let base = unsafe { self.shm.as_mut_ptr().add(std::mem::size_of::<Header>()) };
        unsafe { (base as *mut T).add((idx & Self::MASK) as usize) }
    }

    // --- producer ---

    /// Append `item`. Returns `false` if the ring is full.
    pub fn write(&self, item: &T) -> bool {
        let hdr = self.hdr();
        let w = hdr.write_idx.load(Ordering::Relaxed);
        let r = hdr.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= N as u64 {
            return false;
        }
        unsafe { std::ptr::copy_nonoverlapping(item as *const T, self.slot_ptr(w), 1) };
        hdr.write_idx.fetch_add(1, Ordering::Release);
        true
    }

    /// Append `item`, dropping the oldest record if full. Dropped records
    /// are counted so the reader can tell it lost data.
    pub fn write_overwrite(&self, item: &T) {
        let hdr = self.hdr();
        let w = hdr.write_idx.load(Ordering::Relaxed);
        let r = hdr.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= N as u64 {
            hdr.read_idx.store(r.wrapping_add(1), Ordering::Release);
            hdr.overwritten.fetch_add(1, Ordering::AcqRel);
        }
        unsafe { std::ptr::copy_nonoverlapping(item as *const T, self.slot_ptr(w), 1) };
        hdr.write_idx.fetch_add(1, Ordering::Release);
    }

    // --- consumer ---

    /// Take the oldest record, if any.
    pub fn read(&self) -> Option<T> {
        let hdr = self.hdr();
        let r = hdr.read_idx.load(Ordering::Relaxed);
        let w = hdr.write_idx.load(Ordering::Acquire);
        if r >= w {
            return None;
        }
        let item = unsafe { std::ptr::read(self.slot_ptr(r)) };
        hdr.read_idx.fetch_add(1, Ordering::Release);
        Some(item)
    }

    // --- status ---

    pub fn available(&self) -> usize {
        let hdr = self.hdr();
        let w = hdr.write_idx.load(Ordering::Acquire);
        let r = hdr.read_idx.load(Ordering::Acquire);
        w.wrapping_sub(r) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available() >= N
    }

    /// Records the producer discarded because the consumer fell behind.
    pub fn overwritten(&self) -> u64 {
        self.hdr().overwritten.load(Ordering::Acquire)
    }
}
