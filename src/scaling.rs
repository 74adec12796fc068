//! Ordered chain of `BloomFilter`s that grows by appending a new, larger,
//! tighter sub-filter whenever the current tail saturates, while keeping
//! the aggregate false-positive probability bounded.

use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::error::Result;

const FILE_PREFIX: &str = "data";
const FILE_SUFFIX: &str = "mmap";

/// `(F0, F1, ..., Ft-1)`, a target probability `p`, a scale factor `s`, and
/// a per-stage probability reduction `r`. All writes land in the tail;
/// membership tests OR-scan every stage.
pub struct ScalingFilter {
    dir: PathBuf,
    filters: Vec<BloomFilter>,
    initial_capacity: usize,
    probability: f64,
    scale: u32,
    reduction: f64,
}

impl ScalingFilter {
    /// Fresh construction: creates `F0` immediately with capacity
    /// `initial_capacity` and probability `probability`.
    pub fn fresh(
        dir: impl AsRef<Path>,
        initial_capacity: usize,
        probability: f64,
        scale: u32,
        reduction: f64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut chain = ScalingFilter {
            dir,
            filters: Vec::new(),
            initial_capacity,
            probability,
            scale,
            reduction,
        };
        let path = chain.next_path()?;
        let f0 = BloomFilter::create(path, initial_capacity, probability)?;
        chain.filters.push(f0);
        Ok(chain)
    }

    /// Adopts an already-opened, filename-ordered chain recovered from
    /// disk. The last filter is the active tail.
    pub fn from_chain(
        dir: impl AsRef<Path>,
        filters: Vec<BloomFilter>,
        initial_capacity: usize,
        probability: f64,
        scale: u32,
        reduction: f64,
    ) -> Self {
        ScalingFilter {
            dir: dir.as_ref().to_path_buf(),
            filters,
            initial_capacity,
            probability,
            scale,
            reduction,
        }
    }

    /// Next sub-filter filename: `data.NNN.mmap`, NNN = current number of
    /// `*.mmap` files in the directory, zero-padded to three digits.
    fn next_path(&self) -> Result<PathBuf> {
        let count = count_mmap_files(&self.dir)?;
        Ok(self
            .dir
            .join(format!("{FILE_PREFIX}.{count:03}.{FILE_SUFFIX}")))
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Inserts `key`. The chain is scanned first so a key already present
    /// anywhere never gets re-counted in the tail (this is what makes the
    /// return value a truthful novelty signal). Appends a new, larger,
    /// tighter tail first if the current one has saturated.
    pub fn insert(&mut self, key: &[u8]) -> Result<bool> {
        if self.contains(key) {
            return Ok(false);
        }

        if self
            .filters
            .last()
            .map(|f| f.is_full())
            .unwrap_or(true)
        {
            self.grow()?;
        }

        let tail = self.filters.last_mut().expect("chain is never empty");
        Ok(tail.insert(key))
    }

    fn grow(&mut self) -> Result<()> {
        let stage = self.filters.len() as i32;
        let capacity = self
            .filters
            .last()
            .map(|f| f.item_capacity() as usize * self.scale as usize)
            .unwrap_or(self.initial_capacity);
        let probability = self.probability * self.reduction.powi(stage);
        let path = self.next_path()?;
        let filter = BloomFilter::create(path, capacity, probability)?;
        self.filters.push(filter);
        Ok(())
    }

    /// `true` iff any sub-filter reports membership. Scanned newest-first:
    /// the tail is the most likely place to find a recently-added key.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.filters.iter().rev().any(|f| f.contains(key))
    }

    /// Sum of item capacities across the chain.
    pub fn total_capacity(&self) -> u64 {
        self.filters.iter().map(|f| f.item_capacity()).sum()
    }

    /// Sum of distinct items inserted across the chain.
    pub fn len(&self) -> u64 {
        self.filters.iter().map(|f| f.count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of on-disk bytes (bitmap + header) across the chain.
    pub fn total_byte_size(&self) -> u64 {
        self.filters.iter().map(|f| f.total_bytes()).sum()
    }

    /// Flushes each sub-filter in order, oldest first.
    pub fn flush(&mut self) -> Result<()> {
        for filter in &mut self.filters {
            filter.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes every sub-filter, consuming the chain.
    pub fn close(self) -> Result<()> {
        for filter in self.filters {
            filter.close()?;
        }
        Ok(())
    }
}

fn count_mmap_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .contains(&format!(".{FILE_SUFFIX}"))
        {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chain_has_one_filter() {
        let dir = tempfile::tempdir().unwrap();
        let chain = ScalingFilter::fresh(dir.path(), 5, 0.01, 2, 0.9).unwrap();
        assert_eq!(chain.filter_count(), 1);
        assert_eq!(chain.total_capacity(), 5);
    }

    #[test]
    fn novelty_signal_is_truthful() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = ScalingFilter::fresh(dir.path(), 5, 0.01, 2, 0.9).unwrap();
        for word in ["Vega", "Pandora", "Magnetar", "Pulsar", "Nebula"] {
            assert!(chain.insert(word.as_bytes()).unwrap());
        }
        // Re-adding an existing key must not re-count it, nor grow.
        assert!(!chain.insert(b"Vega").unwrap());
        assert_eq!(chain.len(), 5);
        for word in ["Pandora", "Magnetar", "Vega"] {
            assert!(chain.contains(word.as_bytes()));
        }
        assert!(!chain.contains(b"Blazar"));
    }

    #[test]
    fn scales_up_when_tail_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = ScalingFilter::fresh(dir.path(), 5, 0.01, 4, 0.9).unwrap();
        for i in 0..10 {
            chain.insert(format!("key-{i}").as_bytes()).unwrap();
        }
        assert!(chain.filter_count() >= 2);
        assert_eq!(chain.len(), 10);
        assert_eq!(chain.total_capacity(), 5 + 5 * 4);
    }

    #[test]
    fn flush_then_reopen_preserves_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let before_len;
        {
            let mut chain = ScalingFilter::fresh(&path, 5, 0.01, 4, 0.9).unwrap();
            for i in 0..10 {
                chain.insert(format!("key-{i}").as_bytes()).unwrap();
            }
            before_len = chain.len();
            chain.flush().unwrap();
            chain.close().unwrap();
        }

        let mut names: Vec<_> = std::fs::read_dir(&path)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "mmap").unwrap_or(false))
            .collect();
        names.sort();
        let filters: Vec<BloomFilter> = names.into_iter().map(|p| BloomFilter::open(p).unwrap()).collect();
        let chain = ScalingFilter::from_chain(&path, filters, 5, 0.01, 4, 0.9);
        assert_eq!(chain.len(), before_len);
        for i in 0..10 {
            assert!(chain.contains(format!("key-{i}").as_bytes()));
        }
    }
}
