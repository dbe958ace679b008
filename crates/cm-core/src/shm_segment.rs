// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Provides safe wrappers around `shm_open`, `ftruncate`, and `mmap` for
//! creating and mapping the shared memory region that backs the UID/PID
//! registry. Every provider process creates exactly one segment per
//! domain; consumer processes open the same segment read/write so the
//! lock-free state machine in [`crate::registry`] can run across process
//! boundaries.
//!
//! # Segment Lifecycle
//!
//! 1. Provider creates the segment with [`ShmSegment::create`].
//! 2. Consumers open the same segment with [`ShmSegment::open`].
//! 3. The mapping is unmapped automatically on drop.
//! 4. The provider calls [`ShmSegment::unlink`] on clean shutdown.
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/cm_uidpid_d0`.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr;

/// Errors that can occur while creating, opening, or unlinking a segment.
#[derive(Debug)]
pub enum ShmError {
    /// Segment name failed POSIX naming rules.
    InvalidName(String),
    /// `shm_open`/`ftruncate` failed while creating a segment.
    SegmentCreate(io::Error),
    /// `shm_open` failed while opening an existing segment.
    SegmentOpen(io::Error),
    /// Segment does not exist.
    NotFound(String),
    /// `mmap` failed.
    Mmap(io::Error),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidName(name) => write!(f, "invalid shm segment name: {name}"),
            ShmError::SegmentCreate(e) => write!(f, "failed to create shm segment: {e}"),
            ShmError::SegmentOpen(e) => write!(f, "failed to open shm segment: {e}"),
            ShmError::NotFound(name) => write!(f, "shm segment not found: {name}"),
            ShmError::Mmap(e) => write!(f, "mmap failed: {e}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::SegmentCreate(e) | ShmError::SegmentOpen(e) | ShmError::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

type Result<T> = core::result::Result<T, ShmError>;

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment (the provider's responsibility, see [`ShmSegment::unlink`]).
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: ShmSegment points to shared memory accessed from multiple
// threads/processes. Synchronization within the mapped region is the
// responsibility of the data structures stored there (see `registry`),
// which use atomics for cross-process coordination.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment, replacing any existing segment of
    /// the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if segment creation or mapping fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink on a
        // missing segment is a harmless no-op (errors ignored). O_CREAT |
        // O_EXCL | O_RDWR either creates a fresh segment or fails; the
        // returned fd is checked below before further use.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor returned above; size is
        // caller-provided and ftruncate fails gracefully if unreasonable.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not reused on this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY: fd is valid and sized; PROT_READ|PROT_WRITE/MAP_SHARED are
        // valid flags for a cross-process read-write mapping at offset 0.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid; mmap holds its own reference to the object
        // once the mapping succeeds, so closing fd here is safe either way.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        // SAFETY: ptr is a fresh mapping of exactly `size` bytes with write
        // permission and no other references yet.
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::NotFound`] if the segment does not exist, or
    /// another variant if opening/mapping otherwise fails.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; O_RDWR opens an existing segment only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // SAFETY: fd is valid; caller guarantees `size` matches or is
        // smaller than the segment's actual size.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: see create(); closing fd after a successful mmap is safe.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a shared memory segment by name.
    ///
    /// The segment is actually removed once every process has unmapped it.
    /// Idempotent: unlinking a non-existent segment is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if unlink fails for a reason other than "not found".
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is valid; shm_unlink only touches the shm
        // filesystem namespace, never the mapped memory itself.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Raw pointer to the mapped region.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a segment with the given name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; O_RDONLY probes existence without
        // creating or mutating anything.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is a valid descriptor from the probe above.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from a successful mmap in
        // create()/open() and Drop runs at most once for this instance.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // Not unlinked here: the provider owns cleanup via an explicit unlink() call.
    }
}
