//! Fixed-size bit array backed by a memory-mapped file.
//!
//! Bits are laid out LSB-first within each byte. `N` (the bit count) is
//! fixed for the lifetime of a `Bitmap`; reopening a file with a mismatched
//! size is a `FormatMismatch`, not a silent truncate/extend.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{BloomdError, Result};

pub struct Bitmap {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    size_bytes: usize,
}

impl Bitmap {
    /// Creates a new, zero-filled bitmap file of `size_bytes` bytes and
    /// maps it. Truncates (or extends) any existing file at `path`.
    pub fn create(path: impl AsRef<Path>, size_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size_bytes as u64)?;
        let mmap = Self::map(&file, size_bytes)?;
        Ok(Bitmap {
            path,
            file,
            mmap,
            size_bytes,
        })
    }

    /// Opens an existing bitmap file and maps it. `expected_size_bytes`
    /// must match the file's current size on disk, or this fails with a
    /// `FormatMismatch`. Legal for `expected_size_bytes` to be smaller than
    /// one page.
    pub fn open(path: impl AsRef<Path>, expected_size_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual = file.metadata()?.len() as usize;
        if actual != expected_size_bytes {
            return Err(BloomdError::FormatMismatch {
                path: path.clone(),
                reason: format!(
                    "expected {} bytes on disk, found {}",
                    expected_size_bytes, actual
                ),
            });
        }
        let mmap = Self::map(&file, expected_size_bytes)?;
        Ok(Bitmap {
            path,
            file,
            mmap,
            size_bytes: expected_size_bytes,
        })
    }

    fn map(file: &File, size_bytes: usize) -> Result<MmapMut> {
        if size_bytes == 0 {
            // memmap2 refuses to map a zero-length region; an empty bitmap
            // never has its bits touched so an empty backing buffer works.
            return Ok(MmapOptions::new().len(0).map_anon()?);
        }
        let mmap = unsafe { MmapOptions::new().len(size_bytes).map_mut(file)? };
        Ok(mmap)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn len_bits(&self) -> u64 {
        (self.size_bytes as u64) * 8
    }

    #[inline]
    pub fn get(&self, bit_index: u64) -> bool {
        let byte = (bit_index / 8) as usize;
        let mask = 1u8 << (bit_index % 8);
        (self.mmap[byte] & mask) != 0
    }

    #[inline]
    pub fn set(&mut self, bit_index: u64) {
        let byte = (bit_index / 8) as usize;
        let mask = 1u8 << (bit_index % 8);
        self.mmap[byte] |= mask;
    }

    /// Reads a raw byte range (used for the trailing header, not for bit
    /// indices).
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.mmap[offset..offset + len]
    }

    /// Overwrites a raw byte range (used for the trailing header).
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.mmap[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Requests an asynchronous sync of dirty pages; suitable for periodic
    /// background flushing where latency matters more than an immediate
    /// durability guarantee.
    pub fn flush_async(&self) -> Result<()> {
        if self.size_bytes == 0 {
            return Ok(());
        }
        self.mmap.flush_async()?;
        Ok(())
    }

    /// Synchronous sync barrier. Always used before unmap at close, per the
    /// flush-on-close design note: `MS_ASYNC` alone is not a durability
    /// guarantee.
    pub fn flush(&self) -> Result<()> {
        if self.size_bytes == 0 {
            return Ok(());
        }
        self.mmap.flush()?;
        Ok(())
    }

    /// Flushes and drops the mapping and file handle.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        let bm = Bitmap::create(&path, 16).unwrap();
        for i in 0..128 {
            assert!(!bm.get(i));
        }
    }

    #[test]
    fn set_and_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        let mut bm = Bitmap::create(&path, 16).unwrap();
        bm.set(0);
        bm.set(9);
        bm.set(127);
        assert!(bm.get(0));
        assert!(bm.get(9));
        assert!(bm.get(127));
        assert!(!bm.get(1));
        assert!(!bm.get(126));
    }

    #[test]
    fn reopen_recovers_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        {
            let mut bm = Bitmap::create(&path, 16).unwrap();
            bm.set(42);
            bm.close().unwrap();
        }
        let bm = Bitmap::open(&path, 16).unwrap();
        assert!(bm.get(42));
        assert!(!bm.get(41));
    }

    #[test]
    fn open_with_wrong_size_is_format_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        Bitmap::create(&path, 16).unwrap();
        let err = Bitmap::open(&path, 32).unwrap_err();
        assert!(matches!(err, BloomdError::FormatMismatch { .. }));
    }

    #[test]
    fn header_byte_range_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm");
        let mut bm = Bitmap::create(&path, 16).unwrap();
        bm.write_bytes(8, &[1, 2, 3, 4]);
        assert_eq!(bm.read_bytes(8, 4), &[1, 2, 3, 4]);
    }
}
