//! # Persistent Pool
//!
//! `PmemPool` is a pool file mapped into the process with `memmap2`. It plays
//! the part of a persistent-memory pool: all persistent structures live inside
//! the mapping and are addressed by offset, and durability is reached by
//! flushing written ranges back to the file.
//!
//! ## Lifecycle
//!
//! ```text
//! create(path, size) ──> fresh pool: header, empty heap, empty root
//!        │
//! open(path) ──> validate header ──> bind base ──> replay undo log
//!        │                                          (rolls back whatever
//!        │                                           transaction a crash
//!        │                                           interrupted)
//!        ▼
//!   begin() ──> Transaction ──> commit() / abort() / drop
//!        │
//! close() ──> flush, unbind base
//! ```
//!
//! ## Access Rules
//!
//! Readers get `&T` overlays straight out of the mapping through `read` and
//! `read_at`; every access is bounds- and pool-checked through
//! [`PoolBase::checked_range`]. Writers never touch the mapping directly:
//! mutation goes through a [`Transaction`], which holds `&mut PmemPool` and so
//! excludes every reader for its lifetime.
//!
//! ## Safety Considerations
//!
//! The pool never grows after creation. Growing would require a remap, and
//! the persistent format is offset-based precisely so that a remap at a new
//! address is harmless; fixing the size keeps `&T` overlays trivially valid.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::ops::Range;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::{info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::headers::{HeapMeta, PoolHeader, RootMetadata, UndoLogHeader};
use super::transaction::{rollback_undo_log, Transaction};
use super::{PmemOid, PoolBase};
use crate::config::{
    HEAP_META_OFFSET, HEAP_START, MIN_POOL_SIZE, POOL_ALIGNMENT, POOL_HEADER_SIZE, ROOT_OFFSET,
    UNDO_HEADER_OFFSET,
};
use crate::error::PmemError;

#[derive(Debug)]
pub struct PmemPool {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
    mmap: MmapMut,
    base: PoolBase,
    rolled_back: usize,
}

impl PmemPool {
    pub fn create<P: AsRef<Path>>(path: P, pool_size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            pool_size >= MIN_POOL_SIZE,
            "pool size {} is below the minimum of {} bytes",
            pool_size,
            MIN_POOL_SIZE
        );

        ensure!(
            pool_size % POOL_ALIGNMENT == 0,
            "pool size {} is not a multiple of {}",
            pool_size,
            POOL_ALIGNMENT
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create pool file '{}'", path.display()))?;

        file.set_len(pool_size)
            .wrap_err_with(|| format!("failed to set pool size to {} bytes", pool_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
        // modified externally. This is safe because:
        // 1. We just created this file with exclusive access (truncate=true)
        // 2. The file length was set to pool_size above and never changes
        // 3. The mmap lifetime is tied to PmemPool, preventing use-after-unmap
        // 4. All access goes through checked_range, which bounds-checks offsets
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let uuid = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 {
                break candidate;
            }
        };

        mmap[..POOL_HEADER_SIZE].copy_from_slice(PoolHeader::new(uuid, pool_size).as_bytes());
        write_struct(&mut mmap, HEAP_META_OFFSET, &HeapMeta::new());
        write_struct(&mut mmap, ROOT_OFFSET, &RootMetadata::default());

        mmap.flush()
            .wrap_err_with(|| format!("failed to flush new pool '{}'", path.display()))?;

        let mut base = PoolBase::unbound(uuid);
        base.bind(mmap.as_ptr(), mmap.len());

        info!(path = %path.display(), uuid, pool_size, "created pool");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            base,
            rolled_back: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open pool file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size >= MIN_POOL_SIZE,
            "pool file '{}' is too small: {} bytes",
            path.display(),
            file_size
        );

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
        // modified externally, leading to undefined behavior. This is safe because:
        // 1. The file is opened with exclusive write access (read+write mode)
        // 2. Pool files are not meant to be modified by external processes
        // 3. The mmap lifetime is tied to PmemPool, preventing use-after-unmap
        // 4. All access goes through checked_range, which bounds-checks offsets
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = PoolHeader::from_bytes(&mmap)
            .wrap_err_with(|| format!("'{}' is not a pmkv pool", path.display()))?;

        ensure!(
            header.pool_size() == file_size,
            "pool '{}' header records {} bytes but file has {}",
            path.display(),
            header.pool_size(),
            file_size
        );

        let uuid = header.uuid();
        let mut base = PoolBase::unbound(uuid);
        base.bind(mmap.as_ptr(), mmap.len());

        let mut pool = Self {
            path: path.to_path_buf(),
            file,
            mmap,
            base,
            rolled_back: 0,
        };

        pool.rolled_back = rollback_undo_log(&mut pool)
            .wrap_err_with(|| format!("failed to replay undo log of '{}'", path.display()))?;

        if pool.rolled_back > 0 {
            warn!(
                path = %path.display(),
                records = pool.rolled_back,
                "rolled back interrupted transaction"
            );
        }

        info!(path = %path.display(), uuid, "opened pool");

        Ok(pool)
    }

    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    pub fn header(&self) -> Result<&PoolHeader> {
        PoolHeader::from_bytes(&self.mmap)
    }

    pub fn heap_meta(&self) -> Result<&HeapMeta> {
        self.read_at(HEAP_META_OFFSET)
    }

    pub fn root(&self) -> Result<&RootMetadata> {
        self.read_at(ROOT_OFFSET)
    }

    pub fn root_oid(&self) -> PmemOid {
        self.oid_at(ROOT_OFFSET)
    }

    pub fn undo_header(&self) -> Result<&UndoLogHeader> {
        self.read_at(UNDO_HEADER_OFFSET)
    }

    /// Overlays `T` on the pool at `oid`.
    pub fn read<T>(&self, oid: PmemOid) -> Result<&T>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        let range = self.base.checked_range(oid, size_of::<T>())?;
        T::ref_from_bytes(&self.mmap[range]).map_err(|e| {
            eyre::eyre!(
                "failed to parse {} at {:?}: {:?}",
                std::any::type_name::<T>(),
                oid,
                e
            )
        })
    }

    pub fn read_at<T>(&self, offset: u64) -> Result<&T>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        self.read(self.oid_at(offset))
    }

    pub fn bytes(&self, oid: PmemOid, len: usize) -> Result<&[u8]> {
        let range = self.base.checked_range(oid, len)?;
        Ok(&self.mmap[range])
    }

    pub fn oid_at(&self, offset: u64) -> PmemOid {
        PmemOid::new(self.base.uuid(), offset)
    }

    pub fn resolve(&self, oid: PmemOid) -> Result<std::ptr::NonNull<u8>, PmemError> {
        self.base.resolve(oid)
    }

    pub fn reference_of(&self, addr: *const u8) -> Result<PmemOid, PmemError> {
        self.base.reference_of(addr)
    }

    pub fn base(&self) -> &PoolBase {
        &self.base
    }

    pub fn uuid(&self) -> u64 {
        self.base.uuid()
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of heap blocks currently allocated.
    pub fn heap_used(&self) -> Result<u64> {
        Ok(self.heap_meta()?.heap_used())
    }

    pub fn heap_capacity(&self) -> u64 {
        self.size() as u64 - HEAP_START
    }

    /// Undo records replayed when this pool was opened.
    pub fn rolled_back_records(&self) -> usize {
        self.rolled_back
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync pool to disk")
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.base.unbind();
        info!(path = %self.path.display(), "closed pool");
        Ok(())
    }

    pub(crate) fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let range = self.base.checked_range(self.oid_at(offset), len)?;
        Ok(&mut self.mmap[range])
    }

    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) -> Result<()> {
        let len = src.len();
        ensure!(
            src.end <= self.mmap.len() && dest + len <= self.mmap.len(),
            "copy of {} bytes from {} to {} exceeds pool size {}",
            len,
            src.start,
            dest,
            self.mmap.len()
        );
        self.mmap.copy_within(src, dest);
        Ok(())
    }

    /// Flushes `len` bytes at `offset` to the backing file.
    pub(crate) fn persist(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.mmap
            .flush_range(offset, len)
            .wrap_err_with(|| format!("failed to persist {} bytes at offset {}", len, offset))
    }

    pub(crate) fn set_undo_used(&mut self, used: u64) -> Result<()> {
        let slice = self.slice_mut(UNDO_HEADER_OFFSET, size_of::<UndoLogHeader>())?;
        let header = UndoLogHeader::mut_from_bytes(slice)
            .map_err(|e| eyre::eyre!("failed to parse UndoLogHeader: {:?}", e))?;
        header.set_used(used);
        self.persist(UNDO_HEADER_OFFSET as usize, size_of::<UndoLogHeader>())
    }
}

fn write_struct<T: IntoBytes + Immutable>(mmap: &mut MmapMut, offset: u64, value: &T) {
    let bytes = value.as_bytes();
    let start = offset as usize;
    mmap[start..start + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_POOL_SIZE, HEAP_START};
    use tempfile::tempdir;

    const SMALL_POOL: u64 = 1 << 20;

    #[test]
    fn create_new_pool() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::create(dir.path().join("pool"), SMALL_POOL).unwrap();

        assert_eq!(pool.size() as u64, SMALL_POOL);
        assert_ne!(pool.uuid(), 0);
        assert_eq!(pool.heap_meta().unwrap().heap_top(), HEAP_START);
        assert_eq!(*pool.root().unwrap(), RootMetadata::default());
        assert_eq!(pool.undo_header().unwrap().used(), 0);
    }

    #[test]
    fn create_fails_below_minimum_size() {
        let dir = tempdir().unwrap();
        let result = PmemPool::create(dir.path().join("pool"), 4096);

        assert!(result.unwrap_err().to_string().contains("below the minimum"));
    }

    #[test]
    fn create_fails_for_unaligned_size() {
        let dir = tempdir().unwrap();
        let result = PmemPool::create(dir.path().join("pool"), DEFAULT_POOL_SIZE + 1);

        assert!(result.unwrap_err().to_string().contains("not a multiple"));
    }

    #[test]
    fn open_preserves_uuid_and_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let uuid = {
            let mut pool = PmemPool::create(&path, SMALL_POOL).unwrap();
            pool.slice_mut(HEAP_START, 4).unwrap().copy_from_slice(b"abcd");
            let uuid = pool.uuid();
            pool.close().unwrap();
            uuid
        };

        let pool = PmemPool::open(&path).unwrap();
        assert_eq!(pool.uuid(), uuid);
        assert_eq!(pool.bytes(pool.oid_at(HEAP_START), 4).unwrap(), b"abcd");
        assert_eq!(pool.rolled_back_records(), 0);
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        assert!(PmemPool::open(dir.path().join("missing")).is_err());
    }

    #[test]
    fn open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, vec![0x5Au8; SMALL_POOL as usize]).unwrap();

        let err = PmemPool::open(&path).unwrap_err();
        assert!(format!("{:?}", err).contains("invalid magic"));
    }

    #[test]
    fn read_rejects_references_from_another_pool() {
        let dir = tempdir().unwrap();
        let a = PmemPool::create(dir.path().join("a"), SMALL_POOL).unwrap();
        let b = PmemPool::create(dir.path().join("b"), SMALL_POOL).unwrap();

        let foreign = b.root_oid();
        let err = a.read::<RootMetadata>(foreign).unwrap_err();
        assert!(matches!(
            PmemError::of(&err),
            Some(PmemError::InvalidReference { .. })
        ));
    }

    #[test]
    fn resolve_matches_slice_addresses() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::create(dir.path().join("pool"), SMALL_POOL).unwrap();

        let oid = pool.root_oid();
        let addr = pool.resolve(oid).unwrap();
        let slice = pool.bytes(oid, 8).unwrap();
        assert_eq!(addr.as_ptr() as *const u8, slice.as_ptr());
        assert_eq!(pool.reference_of(slice.as_ptr()).unwrap(), oid);
    }
}
