// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! POSIX shared-memory segment wrapper.
//!
//! Safe lifecycle around `shm_open`/`ftruncate`/`mmap`. The creating side
//! owns the name and unlinks it on drop; openers only unmap.
//!
//! Segment names must start with `/` and contain no other `/`, e.g.
//! `/rdds_pool1`.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{Result, TransportError};

/// A mapped POSIX shared-memory segment.
#[derive(Debug)]
pub struct ShmemSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
    owner: bool,
}

// SAFETY: the mapping is shared between processes by design; all access to
// its contents goes through atomics (ring header) or behind the ring's
// writer lock.
unsafe impl Send for ShmemSegment {}
unsafe impl Sync for ShmemSegment {}

impl ShmemSegment {
    /// Create a fresh segment, replacing any stale one with the same name.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = Self::validated_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; unlinking a
        // missing name is harmless; shm_open returns -1 on failure
        // (checked below).
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(TransportError::UnableToCreate(format!(
                "shm_open({}) failed: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is the valid descriptor from shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(TransportError::UnableToCreate(format!(
                "ftruncate({}, {}) failed: {}",
                name, size, err
            )));
        }

        let ptr = Self::map(fd, size, name)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing segment created by another process.
    ///
    /// The mapping size comes from the segment itself (`fstat`), so the
    /// opener never maps past what the creator allocated.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::validated_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; return value is
        // checked below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(TransportError::NotFound(format!(
                "shm segment {}: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is valid; stat is a plain out-parameter.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(TransportError::UnableToCreate(format!(
                    "fstat({}) failed: {}",
                    name, err
                )));
            }
            stat.st_size as usize
        };
        if size == 0 {
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(TransportError::UnableToCreate(format!(
                "shm segment {} is empty",
                name
            )));
        }

        let ptr = Self::map(fd, size, name)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: false,
        })
    }

    fn map(fd: i32, size: usize, name: &str) -> Result<*mut u8> {
        // SAFETY: fd is a valid shm descriptor sized by ftruncate (creator)
        // or assumed sized by the creator (opener); MAP_SHARED with
        // read/write protection is the intended sharing mode. MAP_FAILED is
        // checked before use, and the fd can be closed after mapping.
        let ptr = unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            ptr
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransportError::UnableToCreate(format!(
                "mmap({}, {}) failed: {}",
                name,
                size,
                io::Error::last_os_error()
            )));
        }
        Ok(ptr.cast())
    }

    fn validated_name(name: &str) -> Result<CString> {
        let valid = name.starts_with('/')
            && !name[1..].contains('/')
            && name.len() > 1
            && name.len() < 255;
        if !valid {
            return Err(TransportError::UnableToCreate(format!(
                "invalid shm segment name '{}'",
                name
            )));
        }
        CString::new(name)
            .map_err(|_| TransportError::UnableToCreate(format!("NUL in shm name '{}'", name)))
    }

    /// Base of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True for zero-sized mappings (never the case for valid segments).
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmemSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap; munmap is called
        // exactly once. Unlinking is owner-only so openers never tear the
        // name away from the creator.
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
            if self.owner {
                if let Ok(c_name) = CString::new(self.name.clone()) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/rdds_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_write_open_read() {
        let name = unique_name("seg_rw");
        let segment = ShmemSegment::create(&name, 4096).unwrap();

        // SAFETY: within the 4096-byte mapping created above.
        unsafe {
            *segment.as_ptr() = 0xAB;
            *segment.as_ptr().add(4095) = 0xCD;
        }

        let view = ShmemSegment::open(&name).unwrap();
        // SAFETY: same mapping, same bounds.
        unsafe {
            assert_eq!(*view.as_ptr(), 0xAB);
            assert_eq!(*view.as_ptr().add(4095), 0xCD);
        }
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let err = ShmemSegment::open(&unique_name("seg_missing")).unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = unique_name("seg_unlink");
        {
            let _segment = ShmemSegment::create(&name, 4096).unwrap();
        }
        assert!(ShmemSegment::open(&name).is_err());
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(ShmemSegment::create("noslash", 64).is_err());
        assert!(ShmemSegment::create("/two/slashes", 64).is_err());
        assert!(ShmemSegment::create("/", 64).is_err());
    }
}
