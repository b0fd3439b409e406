//! Shared memory regions backing the mmap operation.
//!
//! There is no portable way to pin another process's pages, so mappings work
//! the other way around: a provider exports a region it owns under a numeric
//! key on its control channel, and an MMAP reply names that key in its scalar
//! argument. The broker resolves the key and hands the client a
//! [`MappedRegion`] window into the export. Regions must be file backed;
//! anonymous memory is refused at access time because it could never be
//! shared with a real out-of-process client. A reply naming an unknown key
//! fails with `NotSupported`, which is also the right answer on a platform
//! with no shared-memory story at all.

use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex};

use log::warn;
use memmap2::{MmapMut, MmapOptions};
use userdev_proto::MapProt;

use crate::error::{Error, Result};

/// A provider-owned span of shareable memory.
pub struct SharedRegion {
    map: Mutex<MmapMut>,
    len: usize,
    anonymous: bool,
}

impl SharedRegion {
    /// Map `len` bytes of `file` as a shared, writable region.
    ///
    /// # Errors
    /// Any mapping failure is returned as the underlying `io::Error`.
    pub fn from_file(file: &File, len: usize) -> io::Result<Arc<Self>> {
        // SAFETY: the mapping is kept private to this struct and all access
        // goes through the bounds-checked accessors below. The caller keeps
        // the file from being truncated underneath the map.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Arc::new(SharedRegion {
            map: Mutex::new(map),
            len,
            anonymous: false,
        }))
    }

    /// An anonymous region. Providers can build one, but clients cannot map
    /// it; it exists so the refusal path is honest rather than untestable.
    pub fn anonymous(len: usize) -> io::Result<Arc<Self>> {
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Arc::new(SharedRegion {
            map: Mutex::new(map),
            len,
            anonymous: true,
        }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Provider-side write into the region.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        let mut map = self.map.lock().unwrap();
        map[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Provider-side read from the region.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        let map = self.map.lock().unwrap();
        dst.copy_from_slice(&map[offset..offset + dst.len()]);
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::BadAddress);
        }
        Ok(())
    }
}

/// A client's window into a provider export, produced by a successful MMAP.
///
/// Clones model additional references to the same mapped range; the
/// underlying export stays alive until the last clone is dropped.
#[derive(Clone)]
pub struct MappedRegion {
    inner: Arc<MapInner>,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("offset", &self.inner.offset)
            .field("len", &self.inner.len)
            .finish()
    }
}

struct MapInner {
    export: Arc<SharedRegion>,
    /// Offset of the mapped range within the device mapping space.
    offset: u64,
    /// Length the provider granted in its reply.
    len: u64,
    prot: MapProt,
}

impl MappedRegion {
    pub(crate) fn new(export: Arc<SharedRegion>, offset: u64, len: u64, prot: MapProt) -> Self {
        MappedRegion {
            inner: Arc::new(MapInner {
                export,
                offset,
                len,
                prot,
            }),
        }
    }

    /// Length of the mapped range.
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Number of live references to this mapping.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Read through the mapping. Fails for out-of-range accesses and for
    /// regions that cannot actually be shared.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.resolve(offset, dst.len(), MapProt::READ)?;
        self.inner
            .export
            .read_at((self.inner.offset + offset) as usize, dst)
    }

    /// Write through the mapping. Requires write protection bits.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.resolve(offset, src.len(), MapProt::WRITE)?;
        self.inner
            .export
            .write_at((self.inner.offset + offset) as usize, src)
    }

    fn resolve(&self, offset: u64, len: usize, need: MapProt) -> Result<()> {
        if self.inner.export.is_anonymous() {
            warn!("cannot resolve pages of an anonymous region; export a file-backed one");
            return Err(Error::BadAddress);
        }
        if !self.inner.prot.contains(need) {
            return Err(Error::BadAddress);
        }
        if offset
            .checked_add(len as u64)
            .is_none_or(|end| end > self.inner.len)
        {
            return Err(Error::BadAddress);
        }
        Ok(())
    }
}
