//! Periodic expiry sweep.
//!
//! The only cache operation allowed to run in the background. Each cycle
//! calls [`CacheManager::sweep_expired`] on the blocking pool, since the
//! sweep holds an LMDB write transaction and deletes files.
//!
//! # Configuration
//!
//! ```rust
//! use memento_storage::SweepConfig;
//! use std::time::Duration;
//!
//! let config = SweepConfig {
//!     interval: Duration::from_secs(60),
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::manager::CacheManager;

/// Default time between sweeps (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the background sweep task.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often to sweep (default: 5 minutes)
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SweepConfig {
    /// Create from environment variables.
    ///
    /// - `MEMENTO_SWEEP_INTERVAL_SECS`: seconds between sweeps (default: 300)
    pub fn from_env() -> Self {
        let interval = std::env::var("MEMENTO_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);
        Self { interval }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep activity since the task started.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Sweep cycles completed (successful or not)
    pub cycles: AtomicU64,

    /// Entries reaped across all cycles
    pub entries_reaped: AtomicU64,

    /// Cycles that failed
    pub errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            entries_reaped: self.entries_reaped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub cycles: u64,
    pub entries_reaped: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Sweep expired entries every `config.interval` until shutdown.
///
/// The first sweep runs immediately. Returns the metrics collected during
/// the task's lifetime.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let cache = Arc::new(CacheManager::open(config)?);
///
/// let handle = tokio::spawn(sweep_task(Arc::clone(&cache), SweepConfig::default(), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn sweep_task(
    cache: Arc<CacheManager>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics> {
    let metrics = Arc::new(SweepMetrics::new());

    let mut sweep_interval = interval(config.interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        cache_dir = %cache.config().cache_dir.display(),
        "Cache sweep task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        entries_reaped = snapshot.entries_reaped,
        errors = snapshot.errors,
        "Cache sweep task completed"
    );

    metrics
}

/// Perform one sweep cycle.
async fn sweep_once(cache: &Arc<CacheManager>, metrics: &SweepMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let cache = Arc::clone(cache);
    match tokio::task::spawn_blocking(move || cache.sweep_expired()).await {
        Ok(Ok(reaped)) => {
            metrics.entries_reaped.fetch_add(reaped, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Cache sweep failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::error!(error = %e, "Cache sweep task panicked");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memento_core::CacheConfig;
    use tempfile::TempDir;

    #[test]
    fn test_default_interval() {
        assert_eq!(SweepConfig::default().interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn test_from_env_interval() {
        const VAR: &str = "MEMENTO_SWEEP_INTERVAL_SECS";

        std::env::set_var(VAR, "45");
        assert_eq!(SweepConfig::from_env().interval, Duration::from_secs(45));

        // Zero and garbage fall back to the default.
        for bad in ["0", "soon", "-5"] {
            std::env::set_var(VAR, bad);
            assert_eq!(SweepConfig::from_env().interval, DEFAULT_SWEEP_INTERVAL);
        }

        std::env::remove_var(VAR);
        assert_eq!(SweepConfig::from_env().interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[tokio::test]
    async fn test_sweep_task_reaps_and_stops() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::default_at(temp_dir.path().join("cache"))
            .with_metadata_map_size(10 * 1024 * 1024)
            .with_ttl(Duration::ZERO);
        let cache = Arc::new(CacheManager::open(config).expect("cache should open"));
        cache.put(&"req", &"value").expect("put should succeed");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_task(
            Arc::clone(&cache),
            SweepConfig {
                interval: Duration::from_millis(10),
            },
            shutdown_rx,
        ));

        for _ in 0..200 {
            if cache.stats().expect("stats").entry_count == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).expect("task should be listening");

        let metrics = handle.await.expect("task should not panic").snapshot();
        assert!(metrics.cycles >= 1);
        assert_eq!(metrics.entries_reaped, 1);
        assert_eq!(metrics.errors, 0);
        assert_eq!(cache.stats().expect("stats").entry_count, 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_task() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::default_at(temp_dir.path().join("cache"))
            .with_metadata_map_size(10 * 1024 * 1024);
        let cache = Arc::new(CacheManager::open(config).expect("cache should open"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_task(cache, SweepConfig::default(), shutdown_rx));
        drop(shutdown_tx);

        let metrics = handle.await.expect("task should not panic").snapshot();
        assert_eq!(metrics.errors, 0);
    }
}
