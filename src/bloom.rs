//! Classical bloom filter over a single `Bitmap`: sizing math, k-hashing,
//! insert/test, and the persisted trailing header.

use std::f64::consts::LN_2;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::bitmap::Bitmap;
use crate::error::{BloomdError, Result};

const MAGIC: u32 = 0x424C_4D31; // "BLM1"
const VERSION: u8 = 1;

/// count(u64) + k(u32) + capacity(u64) + magic(u32) + version(u8) padded to
/// a round, 8-byte-aligned size.
pub const HEADER_BYTES: usize = 32;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_COUNT: usize = 8;
const OFF_K: usize = 16;
const OFF_CAPACITY: usize = 20;

const SEED1: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED2: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// `(Bitmap, k hash functions, item capacity)`. The bitmap's final
/// `HEADER_BYTES` bytes hold the persisted header; the hashable region is
/// everything before it.
pub struct BloomFilter {
    bitmap: Bitmap,
    k: u32,
    /// Item capacity `n` this sub-filter was sized for.
    item_capacity: u64,
    /// Hashable bit count `M`, excluding the header region.
    capacity_bits: u64,
    count: u64,
}

impl BloomFilter {
    /// Sizes and creates a brand new sub-filter for `item_capacity` items at
    /// false-positive probability `probability`.
    pub fn create(path: impl AsRef<Path>, item_capacity: usize, probability: f64) -> Result<Self> {
        assert!(item_capacity > 0, "capacity must be positive");
        assert!(
            probability > 0.0 && probability < 1.0,
            "probability must be in (0, 1)"
        );

        let capacity_bits = optimal_bits(item_capacity, probability);
        let k = optimal_k(capacity_bits, item_capacity);
        let body_bytes = (capacity_bits / 8) as usize;
        let total_bytes = body_bytes + HEADER_BYTES;

        let bitmap = Bitmap::create(path, total_bytes)?;
        let mut filter = BloomFilter {
            bitmap,
            k,
            item_capacity: item_capacity as u64,
            capacity_bits,
            count: 0,
        };
        filter.write_header()?;
        Ok(filter)
    }

    /// Reopens an existing sub-filter file, recovering `k`, item capacity
    /// and `count` from its header. The hashable bit count is derived from
    /// the file's actual size rather than trusted from the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let size_bytes = std::fs::metadata(path)?.len() as usize;
        if size_bytes < HEADER_BYTES {
            return Err(BloomdError::FormatMismatch {
                path: path.to_path_buf(),
                reason: format!("file smaller than header ({} bytes)", HEADER_BYTES),
            });
        }
        let bitmap = Bitmap::open(path, size_bytes)?;
        let header_offset = size_bytes - HEADER_BYTES;
        let header = bitmap.read_bytes(header_offset, HEADER_BYTES);

        let magic = LittleEndian::read_u32(&header[OFF_MAGIC..]);
        if magic != MAGIC {
            return Err(BloomdError::FormatMismatch {
                path: path.to_path_buf(),
                reason: "bad magic in bloom filter header".into(),
            });
        }
        let count = LittleEndian::read_u64(&header[OFF_COUNT..]);
        let k = LittleEndian::read_u32(&header[OFF_K..]);
        let item_capacity = LittleEndian::read_u64(&header[OFF_CAPACITY..]);

        let capacity_bits = ((size_bytes - HEADER_BYTES) * 8) as u64;

        Ok(BloomFilter {
            bitmap,
            k: k.max(1),
            item_capacity,
            capacity_bits,
            count,
        })
    }

    fn header_offset(&self) -> usize {
        self.bitmap.len_bytes() - HEADER_BYTES
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_BYTES];
        LittleEndian::write_u32(&mut header[OFF_MAGIC..], MAGIC);
        header[OFF_VERSION] = VERSION;
        LittleEndian::write_u64(&mut header[OFF_COUNT..], self.count);
        LittleEndian::write_u32(&mut header[OFF_K..], self.k);
        LittleEndian::write_u64(&mut header[OFF_CAPACITY..], self.item_capacity);
        let offset = self.header_offset();
        self.bitmap.write_bytes(offset, &header);
        Ok(())
    }

    #[inline]
    fn indices(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh64(key, SEED1);
        let h2 = xxh64(key, SEED2);
        (0..self.k).map(move |i| h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.capacity_bits)
    }

    /// Sets all `k` indices for `key`. Returns `true` iff at least one of
    /// them was previously zero, i.e. the key is new to this sub-filter.
    /// Never errors on a full filter; the scaling filter is responsible for
    /// checking `count == capacity` before deciding to insert here.
    pub fn insert(&mut self, key: &[u8]) -> bool {
        let idxs: Vec<u64> = self.indices(key).collect();
        let mut all_set = true;
        for idx in idxs {
            if !self.bitmap.get(idx) {
                all_set = false;
            }
            self.bitmap.set(idx);
        }
        let is_new = !all_set;
        if is_new {
            self.count += 1;
        }
        is_new
    }

    /// `false` if any of the `k` bits is zero; otherwise `true` (possibly a
    /// false positive).
    pub fn contains(&self, key: &[u8]) -> bool {
        self.indices(key).all(|idx| self.bitmap.get(idx))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn item_capacity(&self) -> u64 {
        self.item_capacity
    }

    pub fn capacity_bits(&self) -> u64 {
        self.capacity_bits
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Total bytes this sub-filter occupies on disk, header included.
    pub fn total_bytes(&self) -> u64 {
        self.bitmap.len_bytes() as u64
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.item_capacity
    }

    /// Writes the current count into the header and syncs.
    pub fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.bitmap.flush_async()
    }

    /// Flush-on-close: sync barrier before the mapping is dropped.
    pub fn close(mut self) -> Result<()> {
        self.write_header()?;
        self.bitmap.flush()
    }
}

/// `m = ceil(-n * ln(p) / (ln 2)^2)`, rounded up to a whole byte.
fn optimal_bits(n: usize, p: f64) -> u64 {
    let m = -(n as f64) * p.ln() / (LN_2 * LN_2);
    let m_bits = m.ceil() as u64;
    ((m_bits + 7) / 8) * 8
}

/// `k = ceil((m / n) * ln 2)`, at least 1.
fn optimal_k(m_bits: u64, n: usize) -> u32 {
    let k = (m_bits as f64 / n as f64) * LN_2;
    (k.ceil() as u32).max(1)
}

fn xxh64(data: &[u8], seed: u64) -> u64 {
    use std::hash::Hasher;
    let mut hasher = twox_hash::XxHash64::with_seed(seed);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_matches_expected_formula() {
        // n=5, p=0.01 -> m = ceil(-5 * ln(0.01) / ln(2)^2) = 48 bits exactly.
        assert_eq!(optimal_bits(5, 0.01), 48);
        assert_eq!(optimal_k(48, 5), 7);
    }

    #[test]
    fn insert_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let mut bf = BloomFilter::create(dir.path().join("f0.mmap"), 100, 0.01).unwrap();
        assert!(bf.insert(b"alpha"));
        assert!(!bf.insert(b"alpha"));
        assert!(bf.contains(b"alpha"));
        assert!(!bf.contains(b"never-inserted-xyz"));
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn reopen_recovers_header_and_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f0.mmap");
        {
            let mut bf = BloomFilter::create(&path, 100, 0.01).unwrap();
            bf.insert(b"one");
            bf.insert(b"two");
            bf.close().unwrap();
        }
        let bf = BloomFilter::open(&path).unwrap();
        assert_eq!(bf.count(), 2);
        assert_eq!(bf.item_capacity(), 100);
        assert!(bf.contains(b"one"));
        assert!(bf.contains(b"two"));
        assert!(!bf.contains(b"three"));
    }

    #[test]
    fn full_filter_is_detected_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let mut bf = BloomFilter::create(dir.path().join("f0.mmap"), 4, 0.1).unwrap();
        for i in 0..4 {
            bf.insert(format!("key-{i}").as_bytes());
        }
        assert!(bf.is_full());
        // insert() itself never raises CapacityExceeded; scaling decisions
        // are the ScalingFilter's responsibility.
        bf.insert(b"key-overflow");
    }

    #[test]
    fn corrupted_header_is_format_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f0.mmap");
        std::fs::write(&path, vec![0xFFu8; HEADER_BYTES + 8]).unwrap();
        let err = BloomFilter::open(&path).unwrap_err();
        assert!(matches!(err, BloomdError::FormatMismatch { .. }));
    }
}
