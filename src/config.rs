//! Configuration loading and management.
//!
//! Resolution order: explicit `--config` path, `./claimboard/config.yaml`,
//! `~/.claimboard/config.yaml`, then built-in defaults. Environment variables
//! override whatever was loaded:
//! - `CLAIMBOARD_DB_PATH` - Database path
//! - `CLAIMBOARD_STALE_TIMEOUT` - Session heartbeat timeout in seconds
//! - `CLAIMBOARD_MIRROR_PATH` - Backlog mirror file

use crate::types::{LockStrength, Priority};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub locks: LeaseConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Store and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Namespace prefix for generated task ids (`T` gives `T-1`, `T-2`, ...).
    #[serde(default = "default_task_prefix")]
    pub task_prefix: String,

    /// Concurrent claims allowed for a session that did not set its own limit.
    #[serde(default = "default_max_claims")]
    pub default_max_claims: i64,

    /// Sessions silent for longer than this are reaped.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_seconds: u64,

    /// How often the reaper sweeps.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_seconds: u64,

    /// Idle delay of the dispatcher between claim attempts.
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            task_prefix: default_task_prefix(),
            default_max_claims: default_max_claims(),
            stale_timeout_seconds: default_stale_timeout(),
            reap_interval_seconds: default_reap_interval(),
            dispatch_interval_ms: default_dispatch_interval(),
        }
    }
}

impl ServerConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(10))
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".claimboard/claimboard.db")
}

fn default_task_prefix() -> String {
    "T".to_string()
}

fn default_max_claims() -> i64 {
    3
}

fn default_stale_timeout() -> u64 {
    900 // 15 minutes
}

fn default_reap_interval() -> u64 {
    60
}

fn default_dispatch_interval() -> u64 {
    1_000
}

/// Lease durations per lock strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_active_lease")]
    pub active_seconds: u64,

    #[serde(default = "default_soft_lease")]
    pub soft_seconds: u64,

    #[serde(default = "default_helper_lease")]
    pub helper_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            active_seconds: default_active_lease(),
            soft_seconds: default_soft_lease(),
            helper_seconds: default_helper_lease(),
        }
    }
}

impl LeaseConfig {
    pub fn active(&self) -> Duration {
        Duration::from_secs(self.active_seconds)
    }

    pub fn soft(&self) -> Duration {
        Duration::from_secs(self.soft_seconds)
    }

    pub fn helper(&self) -> Duration {
        Duration::from_secs(self.helper_seconds)
    }

    pub fn lease_for(&self, strength: LockStrength) -> Duration {
        match strength {
            LockStrength::Active => self.active(),
            LockStrength::Soft => self.soft(),
            LockStrength::Helper => self.helper(),
        }
    }
}

fn default_active_lease() -> u64 {
    7_200 // 2 hours
}

fn default_soft_lease() -> u64 {
    1_800 // 30 minutes
}

fn default_helper_lease() -> u64 {
    3_600 // 1 hour
}

/// Priority worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_urgent_slots")]
    pub urgent_slots: usize,

    #[serde(default = "default_high_slots")]
    pub high_slots: usize,

    #[serde(default = "default_medium_slots")]
    pub medium_slots: usize,

    #[serde(default = "default_low_slots")]
    pub low_slots: usize,

    /// Pause after a lane step fails unexpectedly.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Shell command run per task by `serve`. No command, no pool.
    #[serde(default)]
    pub command: Option<String>,

    /// Session id the dispatcher claims under.
    #[serde(default = "default_pool_worker_id")]
    pub worker_id: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            urgent_slots: default_urgent_slots(),
            high_slots: default_high_slots(),
            medium_slots: default_medium_slots(),
            low_slots: default_low_slots(),
            backoff_ms: default_backoff_ms(),
            command: None,
            worker_id: default_pool_worker_id(),
        }
    }
}

impl PoolConfig {
    /// Slot count for a lane; every lane gets at least one.
    pub fn slots_for(&self, lane: Priority) -> usize {
        let slots = match lane {
            Priority::Urgent => self.urgent_slots,
            Priority::High => self.high_slots,
            Priority::Medium => self.medium_slots,
            Priority::Low => self.low_slots,
        };
        slots.max(1)
    }

    pub fn total_slots(&self) -> usize {
        Priority::ALL.iter().map(|p| self.slots_for(*p)).sum()
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_urgent_slots() -> usize {
    4
}

fn default_high_slots() -> usize {
    3
}

fn default_medium_slots() -> usize {
    2
}

fn default_low_slots() -> usize {
    1
}

fn default_backoff_ms() -> u64 {
    2_000
}

fn default_pool_worker_id() -> String {
    "claimboard-pool".to_string()
}

/// Weights for capability matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Scores below this produce no routing decision.
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Description length at which context capacity starts to matter.
    #[serde(default = "default_long_description_chars")]
    pub long_description_chars: usize,

    #[serde(default = "default_best_for_weight")]
    pub best_for_weight: f64,

    #[serde(default = "default_strength_weight")]
    pub strength_weight: f64,

    /// Subtracted per task the session already has in flight.
    #[serde(default = "default_workload_penalty")]
    pub workload_penalty: f64,

    #[serde(default = "default_large_context_bonus")]
    pub large_context_bonus: f64,

    #[serde(default = "default_medium_context_bonus")]
    pub medium_context_bonus: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            long_description_chars: default_long_description_chars(),
            best_for_weight: default_best_for_weight(),
            strength_weight: default_strength_weight(),
            workload_penalty: default_workload_penalty(),
            large_context_bonus: default_large_context_bonus(),
            medium_context_bonus: default_medium_context_bonus(),
        }
    }
}

fn default_min_score() -> f64 {
    1.0
}

fn default_long_description_chars() -> usize {
    400
}

fn default_best_for_weight() -> f64 {
    3.0
}

fn default_strength_weight() -> f64 {
    2.0
}

fn default_workload_penalty() -> f64 {
    1.5
}

fn default_large_context_bonus() -> f64 {
    2.0
}

fn default_medium_context_bonus() -> f64 {
    1.0
}

/// Write-only markdown projection of the backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_enabled")]
    pub enabled: bool,

    #[serde(default = "default_mirror_path")]
    pub path: PathBuf,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: default_mirror_enabled(),
            path: default_mirror_path(),
        }
    }
}

fn default_mirror_enabled() -> bool {
    true
}

fn default_mirror_path() -> PathBuf {
    PathBuf::from(".claimboard/BACKLOG.md")
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Candidate config files, highest precedence first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("claimboard/config.yaml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".claimboard").join("config.yaml"));
        }
        paths
    }

    /// Load the explicit file if given (errors are fatal), else the first
    /// config found on the search path, else defaults. Env overrides apply last.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.is_file())
                .map(|p| {
                    debug!(path = %p.display(), "Loading config");
                    Self::load(p)
                })
                .transpose()?
                .unwrap_or_default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CLAIMBOARD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var("CLAIMBOARD_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }

        if let Ok(timeout) = std::env::var("CLAIMBOARD_STALE_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.server.stale_timeout_seconds = timeout;
            }
        }

        if let Ok(path) = std::env::var("CLAIMBOARD_MIRROR_PATH") {
            self.mirror.path = PathBuf::from(path);
        }
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.task_prefix, "T");
        assert_eq!(config.server.stale_timeout_seconds, 900);
        assert_eq!(config.locks.active(), Duration::from_secs(7_200));
        assert_eq!(config.pool.total_slots(), 10);
        assert!(config.mirror.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "
server:
  task_prefix: OPS
pool:
  urgent_slots: 8
  command: ./run-task.sh
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.task_prefix, "OPS");
        assert_eq!(config.server.default_max_claims, 3);
        assert_eq!(config.pool.slots_for(Priority::Urgent), 8);
        assert_eq!(config.pool.slots_for(Priority::Low), 1);
        assert_eq!(config.pool.command.as_deref(), Some("./run-task.sh"));
    }

    #[test]
    fn zero_slot_lanes_still_get_one_worker() {
        let pool = PoolConfig {
            low_slots: 0,
            ..PoolConfig::default()
        };
        assert_eq!(pool.slots_for(Priority::Low), 1);
    }

    #[test]
    fn lease_for_matches_strength() {
        let leases = LeaseConfig::default();
        assert_eq!(leases.lease_for(LockStrength::Soft), Duration::from_secs(1_800));
        assert_eq!(leases.lease_for(LockStrength::Helper), Duration::from_secs(3_600));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "locks:\n  soft_seconds: 60\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.locks.soft(), Duration::from_secs(60));
    }
}
