//! A growable shared file mapping.
//!
//! `resize` maps a fresh view of the file instead of remapping in place, so
//! pointers handed out before the resize stay valid. Both views alias the
//! same file pages (shared mappings), which keeps writes through an old
//! pointer coherent with the new view; the old view itself is returned as a
//! cleanup token and must be kept alive (normally by pushing it onto the
//! [`crate::gc::GcQueue`]) until no reader can still hold its addresses.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::{round_to_page, AccessMode, Result, StoreError};

pub struct Mapping {
    file: std::fs::File,
    mode: AccessMode,
    map: Mutex<Option<MmapRaw>>,
    data: AtomicPtr<u8>,
    len: AtomicU64,
}

/// Keeps a superseded view mapped. Reclaimed by dropping.
pub struct MappingCleanup {
    _map: MmapRaw,
}

impl Mapping {
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        let writable = mode == AccessMode::ReadWrite;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            Some(Self::map_file(&file, mode)?)
        } else {
            None
        };
        let data = map.as_ref().map(|m| m.as_mut_ptr()).unwrap_or(std::ptr::null_mut());
        Ok(Mapping {
            file,
            mode,
            map: Mutex::new(map),
            data: AtomicPtr::new(data),
            len: AtomicU64::new(len),
        })
    }

    fn map_file(file: &std::fs::File, mode: AccessMode) -> Result<MmapRaw> {
        let map = match mode {
            AccessMode::ReadWrite => MmapOptions::new().map_raw(file)?,
            // private mapping: in-memory ref-count traffic from read-only
            // openers must never reach the file
            AccessMode::ReadOnly => MmapRaw::from(unsafe { MmapOptions::new().map_copy(file) }?),
        };
        Ok(map)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Base address of the current view. Null while the file is empty.
    pub fn data(&self) -> *mut u8 {
        self.data.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Grow the file and map a new view. Returns the old view as a cleanup
    /// token; readers holding pointers into it stay valid until the token
    /// is dropped.
    pub fn resize(&self, new_size: u64) -> Result<Option<MappingCleanup>> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }
        let mut map = self.map.lock();
        let new_size = round_to_page(new_size);
        let old_size = self.len.load(Ordering::Acquire);
        assert!(new_size >= old_size, "mappings only grow");
        if new_size == old_size {
            return Ok(None);
        }
        self.file.set_len(new_size)?;
        let new_map = Self::map_file(&self.file, self.mode)?;
        self.data.store(new_map.as_mut_ptr(), Ordering::Release);
        self.len.store(new_size, Ordering::Release);
        let old = map.replace(new_map);
        Ok(old.map(|m| MappingCleanup { _map: m }))
    }

    /// msync the current view.
    pub fn flush(&self) -> Result<()> {
        let map = self.map.lock();
        if let Some(m) = map.as_ref() {
            m.flush()?;
        }
        Ok(())
    }
}
