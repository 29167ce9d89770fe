//! Named shared-memory segment
//!
//! A zero-filled file on a tmpfs-like directory, mapped `MAP_SHARED`.
//! Forked children inherit the mapping, so every process sees the same
//! bytes. The file is unlinked when the creating process drops the segment.

use memmap2::{MmapMut, MmapOptions};
use std::io;
use std::path::Path;
use std::ptr::NonNull;
use tempfile::NamedTempFile;

/// Shared mapping backed by a named temp file
pub struct SharedSegment {
    ptr: NonNull<u8>,
    len: usize,
    _map: MmapMut,
    file: NamedTempFile,
}

// The mapping is only reached through the pointer, and all mutation goes
// through the process-shared primitives placed inside it.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create and map a zero-filled segment of `len` bytes in `dir`
    pub fn create(dir: &Path, prefix: &str, len: usize) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".shm")
            .tempfile_in(dir)?;
        file.as_file().set_len(len as u64)?;

        // Safety: the file is private to this pool and is never truncated
        // while mapped.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file.as_file())? };
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;

        Ok(Self {
            ptr,
            len,
            _map: map,
            file,
        })
    }

    /// Base address of the mapping (page aligned)
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_segment_is_zeroed_and_named() {
        let dir = tempdir().unwrap();
        let seg = SharedSegment::create(dir.path(), "test-", 8192).unwrap();
        assert_eq!(seg.len(), 8192);
        assert!(seg.path().exists());

        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), seg.len()) };
        assert!(bytes.iter().all(|&b| b == 0));

        let path = seg.path().to_path_buf();
        drop(seg);
        assert!(!path.exists());
    }
}
