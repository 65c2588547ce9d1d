#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte-addressed [`ByteDevice`] and block-addressed
//! [`BlockDevice`] traits, a file-backed device using positional I/O, an
//! in-memory device for tests and tooling, and an I/O counting wrapper.

use o2_error::{O2Error, Result};
use o2_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| O2Error::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| O2Error::Format(format!("{what} range overflows u64")))
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Whether writes are permitted.
    fn is_writable(&self) -> bool;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using positional reads and writes.
///
/// `FileExt` does not share a seek position, so clones may be used from
/// several threads.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when the file is not
    /// writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(O2Error::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(O2Error::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(O2Error::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Growable-at-construction in-memory byte device.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    writable: bool,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            writable: true,
        }
    }

    /// Same contents, but every write fails with `ReadOnly`.
    #[must_use]
    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            writable: false,
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start =
            usize::try_from(offset).map_err(|_| O2Error::Format("offset overflow".into()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| O2Error::Format("range overflow".into()))?;
        if end > self.bytes.lock().len() {
            return Err(O2Error::Format(format!(
                "access out of bounds: offset={offset} len={len}"
            )));
        }
        Ok(start..end)
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(O2Error::ReadOnly);
        }
        let range = self.range(offset, buf.len())?;
        self.bytes.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    fn is_writable(&self) -> bool;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read consecutive blocks starting at `start` into `buf`, whose length
    /// must be a multiple of the block size.
    fn read_blocks(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let bs = usize::try_from(self.block_size())
            .map_err(|_| O2Error::Format("block_size does not fit usize".to_owned()))?;
        if bs == 0 || buf.len() % bs != 0 {
            return Err(O2Error::Format(format!(
                "read_blocks buffer of {} bytes is not block-aligned",
                buf.len()
            )));
        }
        for (i, chunk) in buf.chunks_exact_mut(bs).enumerate() {
            let block = start
                .checked_add(u64::try_from(i).unwrap_or(u64::MAX))
                .ok_or_else(|| O2Error::Format("block number overflow".to_owned()))?;
            chunk.copy_from_slice(self.read_block(block)?.as_slice());
        }
        Ok(())
    }
}

/// Block view over a [`ByteDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap `inner`. A trailing partial block is not addressable.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(O2Error::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(O2Error::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| O2Error::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                O2Error::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read_block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| O2Error::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(O2Error::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "write_block");
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn read_blocks(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let bs = u64::from(self.block_size);
        let blocks = u64::try_from(buf.len()).unwrap_or(u64::MAX) / bs;
        if u64::try_from(buf.len()).unwrap_or(u64::MAX) % bs != 0 {
            return Err(O2Error::Format(format!(
                "read_blocks buffer of {} bytes is not block-aligned",
                buf.len()
            )));
        }
        if blocks == 0 {
            return Ok(());
        }
        let last = start
            .checked_add(blocks - 1)
            .ok_or_else(|| O2Error::Format("block number overflow".to_owned()))?;
        self.offset_of(last)?;
        let offset = self.offset_of(start)?;
        self.inner.read_exact_at(offset, buf)
    }
}

/// Read/write counters observed by [`CountingDevice`].
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl IoCounters {
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Block device wrapper that counts block-level I/O.
#[derive(Debug)]
pub struct CountingDevice<D: BlockDevice> {
    inner: D,
    counters: Arc<IoCounters>,
}

impl<D: BlockDevice> CountingDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            counters: Arc::new(IoCounters::default()),
        }
    }

    /// Shared handle to the counters, still valid after the device moves.
    #[must_use]
    pub fn counters(&self) -> Arc<IoCounters> {
        Arc::clone(&self.counters)
    }
}

impl<D: BlockDevice> BlockDevice for CountingDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
