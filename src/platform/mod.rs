// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use posix::{PlatformShm, ShmMode};

#[cfg(windows)]
pub use windows::{PlatformShm, ShmMode};
