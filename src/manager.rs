//! Process-wide filter registry.
//!
//! The registry structure (name -> entry) is guarded by an async
//! `RwLock` so the network-facing tasks never block each other on a
//! lookup. Each entry's content is guarded by its own blocking `RwLock`;
//! every operation that touches an mmap runs inside `spawn_blocking` so the
//! async reactor is never stalled by a page fault or an `fsync`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock as AsyncRwLock;

use crate::config::{FilterDefaults, FilterOverrides, ServerConfig};
use crate::entry::FilterEntry;
use crate::error::{BloomdError, Result};

type SharedEntry = Arc<std::sync::RwLock<FilterEntry>>;

/// Directory prefix for every filter's storage directory under `data_dir`,
/// matching bloomd's Python `FILTER_PREFIX`. Keeps an unrelated directory
/// dropped into `data_dir` from being mistaken for a filter at discovery.
const FILTER_PREFIX: &str = "bloomd.";

/// A single `list`/`info` row.
pub struct FilterInfo {
    pub name: String,
    pub probability: f64,
    pub byte_size: u64,
    pub capacity: u64,
    pub len: u64,
}

pub struct Manager {
    data_dir: PathBuf,
    defaults: FilterDefaults,
    config: ServerConfig,
    registry: AsyncRwLock<HashMap<String, SharedEntry>>,
    hot: std::sync::Mutex<HashSet<String>>,
}

impl Manager {
    /// Discovers any filter subdirectories already present under
    /// `config.data_dir` and registers them as `Active`. A directory whose
    /// `config` file is present but unreadable is logged and skipped
    /// rather than aborting startup; one corrupt filter must not take the
    /// whole server down.
    pub async fn discover(config: &ServerConfig) -> Result<Self> {
        let manager = Manager {
            data_dir: config.data_dir.clone(),
            defaults: config.filter_defaults(),
            config: config.clone(),
            registry: AsyncRwLock::new(HashMap::new()),
            hot: std::sync::Mutex::new(HashSet::new()),
        };

        std::fs::create_dir_all(&manager.data_dir)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&manager.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(dir_name) = entry.file_name().to_str() {
                    if let Some(name) = dir_name.strip_prefix(FILTER_PREFIX) {
                        names.push(name.to_string());
                    }
                }
            }
        }

        let mut registry = manager.registry.write().await;
        for name in names {
            let dir = manager.data_dir.join(format!("{FILTER_PREFIX}{name}"));
            let defaults = manager.defaults;
            let discovered = tokio::task::spawn_blocking(move || FilterEntry::discover(dir, defaults))
                .await
                .map_err(|e| BloomdError::Internal(format!("discovery task panicked: {e}")))?;
            match discovered {
                Ok(entry) => {
                    registry.insert(name, Arc::new(std::sync::RwLock::new(entry)));
                }
                Err(e) => {
                    tracing::warn!(filter = %name, error = %e, "skipping unloadable filter at discovery");
                }
            }
        }
        drop(registry);

        Ok(manager)
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(BloomdError::ClientError(format!("invalid filter name: {name}")))
        }
    }

    fn mark_hot(&self, name: &str) {
        self.hot.lock().unwrap().insert(name.to_string());
    }

    async fn lookup(&self, name: &str) -> Result<SharedEntry> {
        let registry = self.registry.read().await;
        registry.get(name).cloned().ok_or(BloomdError::NotFound)
    }

    /// Registers and eagerly creates a new filter. Overrides come from the
    /// `create` command's optional `capacity`/`probability` arguments.
    pub async fn create(&self, name: &str, overrides: FilterOverrides) -> Result<()> {
        Self::validate_name(name)?;
        if let Some(capacity) = overrides.initial_capacity {
            crate::config::validate_capacity_override(capacity)?;
        }
        if let Some(probability) = overrides.default_probability {
            crate::config::validate_probability_override(probability)?;
        }

        let mut registry = self.registry.write().await;
        if registry.contains_key(name) {
            return Err(BloomdError::AlreadyExists);
        }

        let dir = self.data_dir.join(format!("{FILTER_PREFIX}{name}"));
        let defaults = self.defaults;
        let entry = tokio::task::spawn_blocking(move || FilterEntry::create(dir, defaults, overrides))
            .await
            .map_err(|e| BloomdError::Internal(format!("create task panicked: {e}")))??;

        registry.insert(name.to_string(), Arc::new(std::sync::RwLock::new(entry)));
        drop(registry);
        self.mark_hot(name);
        Ok(())
    }

    /// Flushes, closes and removes every backing file for `name`. Per §4.5,
    /// drop races with in-flight reads/writes are resolved by waiting for
    /// them to complete against the old entry rather than erroring out.
    pub async fn drop_filter(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let shared = registry.remove(name).ok_or(BloomdError::NotFound)?;
        drop(registry);
        self.hot.lock().unwrap().remove(name);

        tokio::task::spawn_blocking(move || {
            // The registry entry is already gone, so no new reader/writer
            // can start. Acquiring (then releasing) the writer role blocks
            // until whichever access is currently holding it finishes, the
            // same per-entry lock every other operation in this file goes
            // through.
            drop(shared.write().unwrap());

            // A lookup that ran just before the registry removal above may
            // still hold its own clone of the Arc without having acquired
            // the lock yet; spin until it finishes and drops its clone
            // rather than failing the drop outright.
            let mut shared = shared;
            let lock = loop {
                match Arc::try_unwrap(shared) {
                    Ok(lock) => break lock,
                    Err(arc) => {
                        shared = arc;
                        std::thread::yield_now();
                    }
                }
            };
            let entry = lock
                .into_inner()
                .map_err(|_| BloomdError::Internal("filter lock poisoned".into()))?;
            entry.delete()
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("drop task panicked: {e}")))??;
        Ok(())
    }

    /// Flushes and pages out `name`, leaving it registered as a `Proxy`.
    pub async fn close_filter(&self, name: &str) -> Result<()> {
        let shared = self.lookup(name).await?;
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            entry.page_out()
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("close task panicked: {e}")))??;
        self.hot.lock().unwrap().remove(name);
        Ok(())
    }

    /// Single-key membership test.
    pub async fn check_key(&self, name: &str, key: Vec<u8>) -> Result<bool> {
        let shared = self.lookup(name).await?;
        self.mark_hot(name);
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            entry.contains(&key)
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("check task panicked: {e}")))?
    }

    /// Multi-key membership test, order-preserving.
    pub async fn check_keys(&self, name: &str, keys: Vec<Vec<u8>>) -> Result<Vec<bool>> {
        let shared = self.lookup(name).await?;
        self.mark_hot(name);
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            keys.iter().map(|k| entry.contains(k)).collect()
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("multi task panicked: {e}")))?
    }

    /// Single-key insert; `true` iff the key was new.
    pub async fn set_key(&self, name: &str, key: Vec<u8>) -> Result<bool> {
        let shared = self.lookup(name).await?;
        self.mark_hot(name);
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            entry.add(&key)
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("set task panicked: {e}")))?
    }

    /// Bulk insert, order-preserving novelty flags.
    pub async fn set_keys(&self, name: &str, keys: Vec<Vec<u8>>) -> Result<Vec<bool>> {
        let shared = self.lookup(name).await?;
        self.mark_hot(name);
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            keys.iter().map(|k| entry.add(k)).collect()
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("bulk task panicked: {e}")))?
    }

    /// Forces a flush of one named filter outside the periodic scheduler.
    pub async fn flush_filter(&self, name: &str) -> Result<()> {
        let shared = self.lookup(name).await?;
        tokio::task::spawn_blocking(move || {
            let mut entry = shared.write().unwrap();
            entry.flush()
        })
        .await
        .map_err(|e| BloomdError::Internal(format!("flush task panicked: {e}")))??;
        Ok(())
    }

    /// Flushes every registered filter; used by the periodic scheduler and
    /// by a bare `flush` command with no filter name.
    pub async fn flush_all(&self) -> Result<()> {
        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.flush_filter(&name).await {
                tracing::warn!(filter = %name, error = %e, "periodic flush failed");
            }
        }
        Ok(())
    }

    pub async fn info(&self, name: &str) -> Result<FilterInfo> {
        let shared = self.lookup(name).await?;
        let entry = shared.read().unwrap();
        Ok(FilterInfo {
            name: name.to_string(),
            probability: entry.probability(),
            byte_size: entry.byte_size(),
            capacity: entry.capacity(),
            len: entry.len(),
        })
    }

    /// Counter snapshot for the `info` command; kept separate from
    /// `info()` since it needs the live entry rather than just its sizing
    /// numbers.
    pub async fn info_counters(&self, name: &str) -> Result<crate::protocol::InfoCounters> {
        let shared = self.lookup(name).await?;
        let entry = shared.read().unwrap();
        Ok(crate::protocol::InfoCounters::snapshot(entry.counters()))
    }

    /// Per-filter `conf` reply: `name` plus the sizing parameters this
    /// filter was created with (as persisted in its `config` file).
    pub async fn filter_conf(&self, name: &str) -> Result<Vec<(String, String)>> {
        let shared = self.lookup(name).await?;
        let entry = shared.read().unwrap();
        Ok(vec![
            ("name".to_string(), name.to_string()),
            ("initial_capacity".to_string(), entry.initial_capacity().to_string()),
            ("default_probability".to_string(), entry.probability().to_string()),
            ("scale_size".to_string(), entry.scale_size().to_string()),
            ("probability_reduction".to_string(), entry.probability_reduction().to_string()),
        ])
    }

    /// Bare `conf` reply: the server-wide configuration.
    pub fn server_conf(&self) -> Vec<(String, String)> {
        vec![
            ("port".to_string(), self.config.port.to_string()),
            ("udp_port".to_string(), self.config.udp_port.to_string()),
            ("data_dir".to_string(), self.config.data_dir.display().to_string()),
            ("log_level".to_string(), self.config.log_level.clone()),
            ("initial_capacity".to_string(), self.config.initial_capacity.to_string()),
            ("default_probability".to_string(), self.config.default_probability.to_string()),
            ("scale_size".to_string(), self.config.scale_size.to_string()),
            (
                "probability_reduction".to_string(),
                self.config.probability_reduction.to_string(),
            ),
            ("flush_interval".to_string(), self.config.flush_interval.to_string()),
            ("cold_interval".to_string(), self.config.cold_interval.to_string()),
        ]
    }

    pub async fn list(&self) -> Vec<FilterInfo> {
        let registry = self.registry.read().await;
        let mut rows: Vec<FilterInfo> = registry
            .iter()
            .map(|(name, shared)| {
                let entry = shared.read().unwrap();
                FilterInfo {
                    name: name.clone(),
                    probability: entry.probability(),
                    byte_size: entry.byte_size(),
                    capacity: entry.capacity(),
                    len: entry.len(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn config_defaults(&self) -> FilterDefaults {
        self.defaults
    }

    /// Periodic background flush loop, spawned once at startup.
    pub async fn run_flush_scheduler(self: Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush_all().await {
                tracing::warn!(error = %e, "flush scheduler iteration failed");
            }
        }
    }

    /// Periodic cold-sweep loop: anything not accessed since the last sweep
    /// is paged out, then the hot set is cleared for the next interval.
    pub async fn run_cold_sweep_scheduler(self: Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep_cold().await;
        }
    }

    async fn sweep_cold(&self) {
        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        let hot = self.hot.lock().unwrap().clone();
        for name in names {
            if hot.contains(&name) {
                continue;
            }
            if let Err(e) = self.close_filter(&name).await {
                tracing::warn!(filter = %name, error = %e, "cold sweep page-out failed");
            }
        }
        self.hot.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.data_dir = dir.to_path_buf();
        cfg.initial_capacity = 1000;
        cfg
    }

    #[tokio::test]
    async fn create_set_check_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        manager.create("events", FilterOverrides::default()).await.unwrap();
        assert!(manager.set_key("events", b"alpha".to_vec()).await.unwrap());
        assert!(!manager.set_key("events", b"alpha".to_vec()).await.unwrap());
        assert!(manager.check_key("events", b"alpha".to_vec()).await.unwrap());
        assert!(!manager.check_key("events", b"beta".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        manager.create("events", FilterOverrides::default()).await.unwrap();
        let err = manager.create("events", FilterOverrides::default()).await.unwrap_err();
        assert!(matches!(err, BloomdError::AlreadyExists));
    }

    #[tokio::test]
    async fn operations_on_missing_filter_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        let err = manager.check_key("nope", b"a".to_vec()).await.unwrap_err();
        assert!(matches!(err, BloomdError::NotFound));
    }

    #[tokio::test]
    async fn close_then_access_transparently_faults_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        manager.create("events", FilterOverrides::default()).await.unwrap();
        manager.set_key("events", b"alpha".to_vec()).await.unwrap();
        manager.close_filter("events").await.unwrap();
        assert!(manager.check_key("events", b"alpha".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn drop_removes_from_listing_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        manager.create("events", FilterOverrides::default()).await.unwrap();
        manager.drop_filter("events").await.unwrap();
        assert!(manager.list().await.is_empty());
        assert!(!dir.path().join("bloomd.events").exists());
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        let err = manager.create("bad name!", FilterOverrides::default()).await.unwrap_err();
        assert!(matches!(err, BloomdError::ClientError(_)));
    }

    #[tokio::test]
    async fn discover_picks_up_filters_created_by_a_prior_manager() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
            manager.create("events", FilterOverrides::default()).await.unwrap();
            manager.set_key("events", b"alpha".to_vec()).await.unwrap();
            manager.flush_all().await.unwrap();
        }
        let manager = Manager::discover(&test_config(dir.path())).await.unwrap();
        assert!(manager.check_key("events", b"alpha".to_vec()).await.unwrap());
    }
}
