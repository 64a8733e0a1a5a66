// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX named shared memory used for driver-created files: log buffers,
// the counters regions and the command-and-control header.
// Every mapping carries a trailing atomic<int32_t> holding the number of
// live mappings across all processes.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// FNV-1a 64-bit hash, used to shorten names past the platform limit.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// `PSHMNAMLEN` on macOS; Linux accepts up to NAME_MAX so no shortening.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce the POSIX object name (leading '/') for a logical file name.
///
/// Names over `SHM_NAME_MAX` become `/<prefix>_<16 hex digits of FNV-1a>`.
pub fn posix_name(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || full.len() <= SHM_NAME_MAX {
        return full;
    }

    // '/' + prefix + '_' + 16 hex digits
    let prefix_len = SHM_NAME_MAX.saturating_sub(1 + 1 + 16);
    let body = &full[1..];
    let mut cut = prefix_len.min(body.len());
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("/{}_{:016x}", &body[..cut], fnv1a_64(full.as_bytes()))
}

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

/// User size rounded up to the counter alignment plus the trailing counter.
pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// # Safety
/// `mem` must point to a live mapping of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
}

// The mapping is process-shared; synchronisation is the caller's business.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Map the named object. With `ShmMode::Open` a `user_size` of 0 means
    /// "whatever size the creator gave it", discovered with `fstat`.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 && mode != ShmMode::Open {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let name = posix_name(name);
        let c_name = CString::new(name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o666;

        let open = |flags: libc::c_int| -> io::Result<i32> {
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        };

        // Only the creator truncates: resizing an existing object can wipe it on macOS.
        let (fd, created) = match mode {
            ShmMode::Create => (open(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)?, true),
            ShmMode::Open => (open(libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match open(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (open(libc::O_RDWR)?, false),
                Err(e) => return Err(e),
            },
        };

        unsafe { libc::fchmod(fd, perms) };

        let (total_size, user_size) = if created {
            let total = calc_size(user_size);
            if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            (total, user_size)
        } else {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            let actual = st.st_size as usize;
            if actual < calc_size(user_size.max(1)) {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{name} is {actual} bytes, expected at least {}", calc_size(user_size.max(1))),
                ));
            }
            (actual, actual - std::mem::size_of::<AtomicI32>())
        };

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live mappings of this object across processes.
    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(posix_name(name).as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // The last mapping out removes the name as well.
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_of_empty_is_offset_basis() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn posix_name_prepends_slash() {
        let name = posix_name("buf-7");
        assert!(name.starts_with('/'));
        assert!(name.contains("buf-7"));
    }

    #[test]
    fn posix_name_keeps_existing_slash() {
        assert_eq!(&posix_name("/cnc")[..4], "/cnc");
    }

    #[test]
    fn calc_size_leaves_room_for_counter() {
        assert_eq!(calc_size(1), 8);
        assert_eq!(calc_size(4), 8);
        assert_eq!(calc_size(5), 12);
    }
}
