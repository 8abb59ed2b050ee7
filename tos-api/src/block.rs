//! Block I/O service consumed by the swap store
//!
//! Blocks are exactly one page long; block `n` occupies bytes
//! `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)` of the device.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use hashbrown::HashMap;

use crate::error::{Error, IoErrorKind, Result};
use crate::sync::Mutex;
use crate::types::PAGE_SIZE;

/// A raw block device with page-sized blocks
pub trait BlockDevice: Send {
    /// Number of blocks on the device
    fn block_count(&self) -> u64;

    /// Read block `block` into `buf` (exactly `PAGE_SIZE` bytes)
    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (exactly `PAGE_SIZE` bytes) to block `block`
    fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<()>;
}

/// Opens block devices by name (e.g. `"lhd0raw:"`)
pub trait BlockDeviceProvider: Send + Sync {
    /// Open the named raw device for reading and writing
    fn open(&self, name: &str) -> Result<Box<dyn BlockDevice>>;
}

impl<F> BlockDeviceProvider for F
where
    F: Fn(&str) -> Result<Box<dyn BlockDevice>> + Send + Sync,
{
    fn open(&self, name: &str) -> Result<Box<dyn BlockDevice>> {
        self(name)
    }
}

/// Sparse in-memory disk; blocks never written read back as zeros.
///
/// Clones share the same storage, so a test can keep a handle to the disk
/// it hands to the swap store.
#[derive(Clone)]
pub struct RamDisk {
    blocks: Arc<Mutex<HashMap<u64, Box<[u8]>>>>,
    block_count: u64,
}

impl RamDisk {
    /// Create a disk with `block_count` page-sized blocks
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(HashMap::new())),
            block_count,
        }
    }

    /// Number of blocks that have been written at least once
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Copy of block `block`, if it was ever written
    pub fn snapshot(&self, block: u64) -> Option<Box<[u8]>> {
        self.blocks.lock().get(&block).cloned()
    }

    fn check(&self, block: u64, len: usize) -> Result<()> {
        if len != PAGE_SIZE {
            return Err(Error::Io(IoErrorKind::BadLength(len)));
        }
        if block >= self.block_count {
            return Err(Error::Io(IoErrorKind::OutOfRange(block)));
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.check(block, buf.len())?;
        match self.blocks.lock().get(&block) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        self.check(block, buf.len())?;
        let mut blocks = self.blocks.lock();
        match blocks.get_mut(&block) {
            Some(data) => data.copy_from_slice(buf),
            None => {
                let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
                data.copy_from_slice(buf);
                blocks.insert(block, data);
            }
        }
        Ok(())
    }
}

/// Provider exposing one `RamDisk` under a fixed device name
#[derive(Clone)]
pub struct RamDiskProvider {
    name: &'static str,
    disk: RamDisk,
}

impl RamDiskProvider {
    /// Serve `disk` when `name` is opened
    pub fn new(name: &'static str, disk: RamDisk) -> Self {
        Self { name, disk }
    }

    /// Handle to the served disk
    pub fn disk(&self) -> RamDisk {
        self.disk.clone()
    }
}

impl BlockDeviceProvider for RamDiskProvider {
    fn open(&self, name: &str) -> Result<Box<dyn BlockDevice>> {
        if name != self.name {
            return Err(Error::Io(IoErrorKind::NoDevice));
        }
        Ok(Box::new(self.disk.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_block_reads_zero() {
        let mut disk = RamDisk::new(4);
        let mut buf = vec![0xffu8; PAGE_SIZE];
        disk.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(disk.written_blocks(), 0);
    }

    #[test]
    fn test_write_then_read_block() {
        let mut disk = RamDisk::new(4);
        let data = vec![0x5au8; PAGE_SIZE];
        disk.write_block(1, &data).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(disk.written_blocks(), 1);
    }

    #[test]
    fn test_out_of_range_and_bad_length() {
        let mut disk = RamDisk::new(2);
        let data = vec![0u8; PAGE_SIZE];
        assert_eq!(
            disk.write_block(2, &data),
            Err(Error::Io(IoErrorKind::OutOfRange(2)))
        );
        let mut short = vec![0u8; 16];
        assert_eq!(
            disk.read_block(0, &mut short),
            Err(Error::Io(IoErrorKind::BadLength(16)))
        );
    }

    #[test]
    fn test_provider_opens_by_name() {
        let provider = RamDiskProvider::new("lhd0raw:", RamDisk::new(8));
        assert!(provider.open("lhd0raw:").is_ok());
        assert_eq!(
            provider.open("lhd1raw:").err(),
            Some(Error::Io(IoErrorKind::NoDevice))
        );

        let mut dev = provider.open("lhd0raw:").unwrap();
        dev.write_block(0, &vec![1u8; PAGE_SIZE]).unwrap();
        assert_eq!(provider.disk().written_blocks(), 1);
    }
}
