//! Polymorphic block-device backends.
//!
//! Everything above this layer talks to a [`Block`]: byte-addressed
//! reads and writes plus a barrier. The two stock implementations are a
//! memory-backed device for tests and a unix-file device.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use positioned_io::{ReadAt, WriteAt};
use snafu::ResultExt;

use crate::{Error, IoSnafu, Result, SECTOR_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub read_write: bool,
    pub sector_size: u32,
    pub size_sectors: u64,
}

impl BlockInfo {
    pub fn size_bytes(&self) -> u64 {
        self.size_sectors * self.sector_size as u64
    }
}

pub trait Block: Send + Sync {
    fn get_info(&self) -> BlockInfo;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    /// Barrier: all preceding writes are durable when this returns.
    fn sync(&self) -> Result<()>;
}

/// A memory-backed device.
pub struct MemBlock {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
}

impl MemBlock {
    pub fn new(size_bytes: u64) -> Self {
        Self::with_sector_size(size_bytes, SECTOR_SIZE as u32)
    }

    pub fn with_sector_size(size_bytes: u64, sector_size: u32) -> Self {
        assert!(sector_size > 0 && size_bytes % sector_size as u64 == 0);
        MemBlock {
            data: Mutex::new(vec![0u8; size_bytes as usize]),
            sector_size,
        }
    }
}

impl Block for MemBlock {
    fn get_info(&self) -> BlockInfo {
        let len = self.data.lock().unwrap().len() as u64;
        BlockInfo {
            read_write: true,
            sector_size: self.sector_size,
            size_sectors: len / self.sector_size as u64,
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(Error::msg(format!("read of {end} bytes past device end")));
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(Error::msg(format!("write of {end} bytes past device end")));
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A device backed by a unix file (or a raw device node).
pub struct FileBlock {
    file: Mutex<File>,
    size: u64,
    read_write: bool,
}

impl FileBlock {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(IoSnafu)?;
        let size = file.metadata().context(IoSnafu)?.len();
        Ok(FileBlock { file: Mutex::new(file), size, read_write: true })
    }

    pub fn open_ro(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).context(IoSnafu)?;
        let size = file.metadata().context(IoSnafu)?.len();
        Ok(FileBlock { file: Mutex::new(file), size, read_write: false })
    }
}

impl Block for FileBlock {
    fn get_info(&self) -> BlockInfo {
        BlockInfo {
            read_write: self.read_write,
            sector_size: SECTOR_SIZE as u32,
            size_sectors: self.size / SECTOR_SIZE,
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file.lock().unwrap();
        file.read_exact_at(offset, buf).context(IoSnafu)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.write_all_at(offset, buf).context(IoSnafu)
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().unwrap().sync_data().context(IoSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_block_bounds() {
        let b = MemBlock::new(1024);
        let mut buf = [0u8; 512];
        b.write_at(512, &[7u8; 512]).unwrap();
        b.read_at(512, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        assert!(b.read_at(1024, &mut buf).is_err());
        assert_eq!(b.get_info().size_sectors, 2);
    }

    #[test]
    fn file_block_roundtrip() {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(4096).unwrap();
        let b = FileBlock::open(f.path()).unwrap();
        b.write_at(1000, b"hello").unwrap();
        b.sync().unwrap();
        let mut buf = [0u8; 5];
        b.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
