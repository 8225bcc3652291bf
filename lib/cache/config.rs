//! File cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-pass eviction cap applied when `max-eviction` is unset.
pub const DEFAULT_MAX_EVICTION: u32 = 5000;
/// Disk-usage percentage above which forced eviction starts.
pub const DEFAULT_HIGH_THRESHOLD: u32 = 80;
/// Disk-usage percentage at which forced eviction stops.
pub const DEFAULT_LOW_THRESHOLD: u32 = 60;

/// User-facing options for the file cache layer.
///
/// `mount-path` and `allow-other` belong to the gateway configuration and
/// arrive through [`FileCache::new`](crate::cache::FileCache::new) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileCacheOptions {
    /// Temp-root directory holding the shadow files.
    pub path: PathBuf,

    /// Eviction policy name: `lru` or `lfu`. Unknown names fall back to
    /// LRU.
    pub policy: String,

    /// Staleness threshold in seconds. A shadow file older than this is
    /// re-downloaded on open and eligible for timeout eviction.
    pub timeout_sec: u32,

    /// Cap on entries processed by one forced-eviction pass.
    pub max_eviction: u32,

    /// Soft cap on the cache size in megabytes. Zero disables the cap and
    /// leaves only the disk-usage thresholds in force.
    pub max_size_mb: f64,

    /// Disk-usage percentage that triggers forced eviction.
    pub high_threshold: u32,

    /// Disk-usage percentage at which forced eviction stops.
    pub low_threshold: u32,

    /// Create the remote object synchronously on `create_file`, so a
    /// following `get_attr` from the kernel sees it.
    pub create_empty_file: bool,

    /// Tolerate a non-empty temp directory at startup.
    pub allow_non_empty_temp: bool,

    /// Wipe the temp directory when the layer starts.
    pub cleanup_on_start: bool,

    /// Log every eviction decision.
    pub policy_trace: bool,

    /// Mark handles as cached so reads skip re-validation.
    pub direct_read: bool,
}

impl Default for FileCacheOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            policy: String::new(),
            timeout_sec: 0,
            max_eviction: 0,
            max_size_mb: 0.0,
            high_threshold: 0,
            low_threshold: 0,
            create_empty_file: false,
            allow_non_empty_temp: false,
            cleanup_on_start: false,
            policy_trace: false,
            direct_read: false,
        }
    }
}

impl FileCacheOptions {
    /// The staleness threshold as a [`Duration`].
    #[must_use]
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_sec))
    }

    /// Derive the policy configuration, filling unset knobs with their
    /// defaults.
    #[must_use]
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            tmp_path: self.path.clone(),
            cache_timeout: self.cache_timeout(),
            max_eviction: if self.max_eviction == 0 {
                DEFAULT_MAX_EVICTION
            } else {
                self.max_eviction
            },
            max_size_mb: self.max_size_mb,
            high_threshold: f64::from(if self.high_threshold == 0 {
                DEFAULT_HIGH_THRESHOLD
            } else {
                self.high_threshold
            }),
            low_threshold: f64::from(if self.low_threshold == 0 {
                DEFAULT_LOW_THRESHOLD
            } else {
                self.low_threshold
            }),
            policy_trace: self.policy_trace,
        }
    }
}

/// Effective configuration handed to an eviction policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Temp-root directory the policy watches.
    pub tmp_path: PathBuf,
    /// Entry age beyond which the timeout sweep removes it.
    pub cache_timeout: Duration,
    /// Cap on entries processed by one forced-eviction pass.
    pub max_eviction: u32,
    /// Soft cache-size cap in megabytes; zero disables it.
    pub max_size_mb: f64,
    /// Usage percentage that triggers forced eviction.
    pub high_threshold: f64,
    /// Usage percentage at which forced eviction stops.
    pub low_threshold: f64,
    /// Log every eviction decision.
    pub policy_trace: bool,
}

/// Why the cache layer refused to come up.
#[derive(Debug, Error)]
pub enum CacheSetupError {
    /// No temp-root path was configured.
    #[error("temp cache path is not configured")]
    EmptyTempPath,

    /// The temp root and the mount point are the same directory.
    #[error("temp cache path equals the mount path: {0}")]
    TempPathIsMountPath(PathBuf),

    /// The temp root holds files from an earlier run and
    /// `allow-non-empty-temp` is off.
    #[error("temp cache path is not empty: {0}")]
    TempPathNotEmpty(PathBuf),

    /// An IO error occurred while preparing the temp root.
    #[error("io error while preparing temp cache path: {0}")]
    Io(#[from] std::io::Error),
}
