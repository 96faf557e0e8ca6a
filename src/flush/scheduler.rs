//! Background flush of closed windows.
//!
//! Recording never touches the disk. When a window closes, the registry
//! signals a [`Notify`]; this task wakes up and writes everything pending in
//! one batch. `Notify` keeps at most one permit, so any number of roll-overs
//! before the task runs coalesce into a single write.
//!
//! A ticker also rolls the live window over on its own so that quiet periods
//! still close windows and age the stored history.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

use crate::registry::HistoricalRegistry;
use log::{debug, error, info};

/// Configuration for the flush scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between roll-over checks
    pub tick_interval: Duration,
    /// Whether the scheduler runs at all
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushStats {
    /// Closed windows written
    pub windows_flushed: usize,
    /// Time spent writing
    pub duration_ms: i64,
    /// When the flush finished (registry clock)
    pub timestamp: i64,
}

/// Writes pending history off the recording path.
pub struct FlushScheduler {
    registry: Arc<HistoricalRegistry>,
    config: SchedulerConfig,
    signal: Arc<Notify>,
    /// Registry-clock time of the last successful flush
    last_flush_at: Arc<RwLock<i64>>,
}

impl FlushScheduler {
    pub fn new(registry: Arc<HistoricalRegistry>, config: SchedulerConfig) -> Self {
        let signal = registry.flush_signal();
        let now = registry.clock().now_ms();
        Self {
            registry,
            config,
            signal,
            last_flush_at: Arc::new(RwLock::new(now)),
        }
    }

    /// Time of the last successful flush, or creation time before the first.
    pub fn last_flush(&self) -> i64 {
        *self.last_flush_at.read()
    }

    /// Runs until the task is dropped. Returns immediately when disabled.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use op_history::{FlushScheduler, HistoricalRegistry, SchedulerConfig};
    /// # fn spawn(registry: Arc<HistoricalRegistry>) {
    /// let scheduler = Arc::new(FlushScheduler::new(registry, SchedulerConfig::default()));
    /// tokio::spawn(scheduler.clone().start());
    /// # }
    /// ```
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("History flush scheduler is disabled, skipping");
            return;
        }

        info!(
            "Starting history flush scheduler with {}ms tick",
            self.config.tick_interval.as_millis()
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.signal.notified() => {
                    self.do_flush().await;
                }
                _ = ticker.tick() => {
                    // A closed window notifies the signal and is flushed next turn.
                    self.registry.roll_over();
                }
            }
        }
    }

    async fn do_flush(&self) {
        match self.flush_now().await {
            Ok(stats) => {
                if stats.windows_flushed > 0 {
                    debug!(
                        "Flushed {} history windows in {}ms",
                        stats.windows_flushed, stats.duration_ms
                    );
                }
            }
            Err(e) => {
                error!("History flush failed: {}", e);
            }
        }
    }

    /// Write everything pending now and wait for it.
    pub async fn flush_now(&self) -> Result<FlushStats, String> {
        let clock = Arc::clone(self.registry.clock());
        let start = clock.now_ms();

        let registry = Arc::clone(&self.registry);
        let windows_flushed = tokio::task::spawn_blocking(move || registry.persist_pending_history())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?;

        let timestamp = clock.now_ms();
        *self.last_flush_at.write() = timestamp;
        Ok(FlushStats {
            windows_flushed,
            duration_ms: timestamp - start,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HistoricalMode, PersistenceParams, RegistryConfig};
    use crate::snapshot::OpFilter;
    use crate::types::{ManualClock, UidState};
    use tempfile::TempDir;

    fn registry(temp: &TempDir, clock: Arc<ManualClock>) -> Arc<HistoricalRegistry> {
        let config = RegistryConfig::new(
            temp.path().join("history"),
            PersistenceParams::new(HistoricalMode::EnabledActive, 1_000, 4),
        );
        Arc::new(HistoricalRegistry::open(config, clock).unwrap())
    }

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.tick_interval.as_secs(), 60);
    }

    #[tokio::test]
    async fn test_flush_now_writes_pending() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(50_000));
        let registry = registry(&temp, clock.clone());
        let scheduler = FlushScheduler::new(registry.clone(), SchedulerConfig::default());

        registry.record_access(42, 1000, "com.example", UidState::Foreground);
        clock.advance(1_000);
        assert!(registry.roll_over());

        let stats = scheduler.flush_now().await.unwrap();
        assert_eq!(stats.windows_flushed, 1);
        assert_eq!(scheduler.last_flush(), 51_000);
        assert_eq!(registry.stats().pending_writes, 0);
        assert_eq!(registry.stats().store.depth_files, 1);
    }

    #[tokio::test]
    async fn test_started_scheduler_flushes_on_signal() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(50_000));
        let registry = registry(&temp, clock.clone());
        let scheduler = Arc::new(FlushScheduler::new(
            registry.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_secs(3600),
                enabled: true,
            },
        ));
        let handle = tokio::spawn(scheduler.clone().start());

        // Two roll-overs before the task runs coalesce into one permit.
        registry.record_access(42, 1000, "com.example", UidState::Top);
        clock.advance(1_000);
        registry.record_access(42, 1000, "com.example", UidState::Top);
        clock.advance(1_000);
        registry.roll_over();

        let mut flushed = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.stats().pending_writes == 0 {
                flushed = true;
                break;
            }
        }
        handle.abort();
        assert!(flushed, "pending windows were never flushed");

        let total = registry.query(&OpFilter::all(), 0, i64::MAX);
        assert_eq!(total.totals().access_count, 2);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(FlushScheduler::new(
            registry(&temp, clock),
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
                enabled: false,
            },
        ));
        scheduler.start().await;
    }
}
