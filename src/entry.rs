//! A single named filter as tracked by the manager: either `Active` (a live
//! `ScalingFilter` with mapped memory) or `Proxy` (paged out, only cached
//! counters and sizing numbers remain until the next access faults it back
//! in).
//!
//! Each filter's directory carries a `config` file alongside its
//! `data.NNN.mmap` sub-filters: the sizing parameters it was created with
//! (so a later change to the server-wide defaults doesn't retroactively
//! change how an existing filter grows) plus a cached `size`/`capacity`/
//! `byte_size` snapshot a `Proxy` can answer from without faulting in.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{FilterDefaults, FilterOverrides};
use crate::error::{BloomdError, Result};
use crate::scaling::ScalingFilter;

const CONFIG_FILE: &str = "config";

/// Hit/miss/page-event counters. Each field is independently atomic so a
/// reader under a shared lock can still update them without escalating.
#[derive(Default)]
pub struct Counters {
    pub set_hits: AtomicU64,
    pub set_misses: AtomicU64,
    pub check_hits: AtomicU64,
    pub check_misses: AtomicU64,
    pub page_outs: AtomicU64,
    pub page_ins: AtomicU64,
}

impl Counters {
    pub fn sets(&self) -> u64 {
        self.set_hits.load(Ordering::Relaxed) + self.set_misses.load(Ordering::Relaxed)
    }

    pub fn checks(&self) -> u64 {
        self.check_hits.load(Ordering::Relaxed) + self.check_misses.load(Ordering::Relaxed)
    }
}

/// The sizing parameters a filter was created with, persisted to
/// `<dir>/config` so they survive a restart independent of whatever the
/// server-wide defaults happen to be at the time, plus a cached
/// size/capacity/byte_size snapshot a `Proxy` can answer from directly.
#[derive(Serialize, Deserialize, Clone, Copy)]
struct PersistedConfig {
    initial_capacity: usize,
    default_probability: f64,
    scale_size: u32,
    probability_reduction: f64,
    size: u64,
    capacity: u64,
    byte_size: u64,
}

impl PersistedConfig {
    fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)?;
        std::fs::write(Self::path(dir), raw)?;
        Ok(())
    }

    /// `Ok(None)` means no config file exists yet (a fresh filter with no
    /// override history — callers fall back to the server-wide defaults).
    /// `Err` means a config file exists but could not be read as valid
    /// YAML; the caller treats this filter as unloadable.
    fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let parsed = serde_yaml::from_str(&raw).map_err(|e| BloomdError::FormatMismatch {
                    path: path.clone(),
                    reason: format!("corrupt filter config: {e}"),
                })?;
                Ok(Some(parsed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// What lives behind a name while the filter is paged out: everything a
/// `list`/`info` reply needs without touching the mmap.
struct ProxyInfo {
    capacity: u64,
    byte_size: u64,
    len: u64,
}

enum State {
    Active { chain: ScalingFilter, dirty: bool },
    Proxy(ProxyInfo),
}

/// A named filter's storage directory, its (immutable-for-its-lifetime)
/// sizing parameters, and its current paging state.
pub struct FilterEntry {
    dir: PathBuf,
    initial_capacity: usize,
    default_probability: f64,
    scale_size: u32,
    probability_reduction: f64,
    state: State,
    counters: Counters,
}

impl FilterEntry {
    /// Creates a brand new filter directory, its eager `F0`, and the
    /// persisted `config` file recording the effective sizing parameters.
    pub fn create(
        dir: impl AsRef<Path>,
        defaults: FilterDefaults,
        overrides: FilterOverrides,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let initial_capacity = overrides.initial_capacity.unwrap_or(defaults.initial_capacity);
        let default_probability = overrides.default_probability.unwrap_or(defaults.default_probability);
        let scale_size = defaults.scale_size;
        let probability_reduction = defaults.probability_reduction;

        let chain = ScalingFilter::fresh(&dir, initial_capacity, default_probability, scale_size, probability_reduction)?;

        PersistedConfig {
            initial_capacity,
            default_probability,
            scale_size,
            probability_reduction,
            size: chain.len(),
            capacity: chain.total_capacity(),
            byte_size: chain.total_byte_size(),
        }
        .write(&dir)?;

        Ok(FilterEntry {
            dir,
            initial_capacity,
            default_probability,
            scale_size,
            probability_reduction,
            state: State::Active { chain, dirty: false },
            counters: Counters::default(),
        })
    }

    /// Reopens every `*.mmap` sub-filter found under `dir`, sorted by name
    /// (and therefore by creation order, since filenames are zero-padded
    /// sequence numbers), using the sizing parameters from `<dir>/config`
    /// if present, or the server-wide defaults if the filter has no
    /// config file yet (a filter created by a process that crashed before
    /// its first flush).
    pub fn discover(dir: impl AsRef<Path>, server_defaults: FilterDefaults) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        let (initial_capacity, default_probability, scale_size, probability_reduction) =
            match PersistedConfig::read(&dir)? {
                Some(cfg) => (cfg.initial_capacity, cfg.default_probability, cfg.scale_size, cfg.probability_reduction),
                None => {
                    tracing::warn!(dir = %dir.display(), "no persisted config, using server defaults");
                    (
                        server_defaults.initial_capacity,
                        server_defaults.default_probability,
                        server_defaults.scale_size,
                        server_defaults.probability_reduction,
                    )
                }
            };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "mmap").unwrap_or(false))
            .collect();
        paths.sort();

        let filters = paths
            .into_iter()
            .map(crate::bloom::BloomFilter::open)
            .collect::<Result<Vec<_>>>()?;
        let chain = ScalingFilter::from_chain(&dir, filters, initial_capacity, default_probability, scale_size, probability_reduction);

        Ok(FilterEntry {
            dir,
            initial_capacity,
            default_probability,
            scale_size,
            probability_reduction,
            state: State::Active { chain, dirty: false },
            counters: Counters::default(),
        })
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.state, State::Proxy(_))
    }

    /// Reconstructs the live chain from disk after a cold-sweep page-out.
    /// No-op if already `Active`.
    pub fn fault_in(&mut self) -> Result<()> {
        if matches!(self.state, State::Proxy(_)) {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "mmap").unwrap_or(false))
                .collect();
            paths.sort();
            let filters = paths
                .into_iter()
                .map(crate::bloom::BloomFilter::open)
                .collect::<Result<Vec<_>>>()?;

            let chain = ScalingFilter::from_chain(
                &self.dir,
                filters,
                self.initial_capacity,
                self.default_probability,
                self.scale_size,
                self.probability_reduction,
            );

            self.counters.page_ins.fetch_add(1, Ordering::Relaxed);
            self.state = State::Active { chain, dirty: false };
        }
        Ok(())
    }

    /// Flushes (if dirty) and downgrades to `Proxy`, dropping the mmaps.
    /// Called by the cold-sweep scheduler and by an explicit `close`.
    pub fn page_out(&mut self) -> Result<()> {
        self.flush()?;
        if let State::Active { chain, .. } = &self.state {
            let info = ProxyInfo {
                capacity: chain.total_capacity(),
                byte_size: chain.total_byte_size(),
                len: chain.len(),
            };
            self.counters.page_outs.fetch_add(1, Ordering::Relaxed);
            self.state = State::Proxy(info);
        }
        Ok(())
    }

    /// Membership test. Faults in on demand; does not mark the entry dirty.
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.fault_in()?;
        let hit = match &self.state {
            State::Active { chain, .. } => chain.contains(key),
            State::Proxy(_) => unreachable!("fault_in leaves the entry Active"),
        };
        if hit {
            self.counters.check_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.check_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    /// Inserts `key`. Faults in on demand and marks the entry dirty on any
    /// state-changing insert.
    pub fn add(&mut self, key: &[u8]) -> Result<bool> {
        self.fault_in()?;
        let added = match &mut self.state {
            State::Active { chain, dirty } => {
                let added = chain.insert(key)?;
                *dirty |= added;
                added
            }
            State::Proxy(_) => unreachable!("fault_in leaves the entry Active"),
        };
        if added {
            self.counters.set_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.set_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(added)
    }

    /// If dirty, refreshes the persisted config's cached size/capacity/
    /// byte_size, flushes the chain, then clears `dirty`. Idempotent on a
    /// clean entry, and a no-op for a `Proxy` (nothing in it can be dirty).
    pub fn flush(&mut self) -> Result<()> {
        if let State::Active { chain, dirty } = &mut self.state {
            if *dirty {
                PersistedConfig {
                    initial_capacity: self.initial_capacity,
                    default_probability: self.default_probability,
                    scale_size: self.scale_size,
                    probability_reduction: self.probability_reduction,
                    size: chain.len(),
                    capacity: chain.total_capacity(),
                    byte_size: chain.total_byte_size(),
                }
                .write(&self.dir)?;
                chain.flush()?;
                *dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes, closes every mmap and removes the backing directory
    /// (which also removes its `config` file and every `*.mmap`).
    pub fn delete(mut self) -> Result<()> {
        self.flush()?;
        if let State::Active { chain, .. } = self.state {
            chain.close()?;
        }
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        match &self.state {
            State::Active { chain, .. } => chain.total_capacity(),
            State::Proxy(info) => info.capacity,
        }
    }

    pub fn byte_size(&self) -> u64 {
        match &self.state {
            State::Active { chain, .. } => chain.total_byte_size(),
            State::Proxy(info) => info.byte_size,
        }
    }

    pub fn len(&self) -> u64 {
        match &self.state {
            State::Active { chain, .. } => chain.len(),
            State::Proxy(info) => info.len,
        }
    }

    pub fn probability(&self) -> f64 {
        self.default_probability
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn scale_size(&self) -> u32 {
        self.scale_size
    }

    pub fn probability_reduction(&self) -> f64 {
        self.probability_reduction
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> FilterDefaults {
        FilterDefaults {
            initial_capacity: 10,
            default_probability: 0.01,
            scale_size: 4,
            probability_reduction: 0.9,
        }
    }

    #[test]
    fn create_then_add_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        let mut entry = FilterEntry::create(&path, defaults(), FilterOverrides::default()).unwrap();
        assert!(entry.add(b"a").unwrap());
        assert!(!entry.add(b"a").unwrap());
        assert!(entry.contains(b"a").unwrap());
        assert!(!entry.contains(b"b").unwrap());
        assert_eq!(entry.counters().sets(), 2);
        assert_eq!(entry.counters().checks(), 2);
    }

    #[test]
    fn create_persists_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        let overrides = FilterOverrides {
            initial_capacity: Some(500),
            default_probability: None,
        };
        FilterEntry::create(&path, defaults(), overrides).unwrap();
        assert!(path.join("config").exists());
    }

    #[test]
    fn page_out_then_fault_in_preserves_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        let mut entry = FilterEntry::create(&path, defaults(), FilterOverrides::default()).unwrap();
        entry.add(b"a").unwrap();
        entry.add(b"b").unwrap();

        entry.page_out().unwrap();
        assert!(entry.is_proxy());
        assert_eq!(entry.len(), 2);

        assert!(entry.contains(b"a").unwrap());
        assert!(!entry.is_proxy());
        assert_eq!(entry.counters().page_outs.load(Ordering::Relaxed), 1);
        assert_eq!(entry.counters().page_ins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn discover_recovers_existing_chain_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        let overrides = FilterOverrides {
            initial_capacity: Some(777),
            default_probability: None,
        };
        {
            let mut entry = FilterEntry::create(&path, defaults(), overrides).unwrap();
            entry.add(b"a").unwrap();
            entry.flush().unwrap();
        }
        let mut entry = FilterEntry::discover(&path, defaults()).unwrap();
        assert!(entry.contains(b"a").unwrap());
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.initial_capacity(), 777);
    }

    #[test]
    fn discover_without_config_falls_back_to_server_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        {
            let mut entry = FilterEntry::create(&path, defaults(), FilterOverrides::default()).unwrap();
            entry.add(b"a").unwrap();
            entry.flush().unwrap();
        }
        std::fs::remove_file(path.join("config")).unwrap();
        let entry = FilterEntry::discover(&path, defaults()).unwrap();
        assert_eq!(entry.initial_capacity(), defaults().initial_capacity);
    }

    #[test]
    fn discover_with_corrupt_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        FilterEntry::create(&path, defaults(), FilterOverrides::default()).unwrap();
        std::fs::write(path.join("config"), b"not_a_real_field: 1").unwrap();
        let err = FilterEntry::discover(&path, defaults()).unwrap_err();
        assert!(matches!(err, BloomdError::FormatMismatch { .. }));
    }

    #[test]
    fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1");
        let entry = FilterEntry::create(&path, defaults(), FilterOverrides::default()).unwrap();
        entry.delete().unwrap();
        assert!(!path.exists());
    }
}
