//! Periodic idle sweep.
//!
//! The pools own no threads. An application that wants idle handles closed on a
//! schedule spawns this task on its runtime and cancels it on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A pool that can close handles idle for longer than its TTL.
pub trait IdleSweep: Send + Sync {
    /// Returns whether anything was closed.
    fn release_inactive(&self) -> bool;
}

/// Sweep every pool each `config.sweep_interval` until `cancel` fires.
pub fn spawn_idle_reaper(
    pools: Vec<Arc<dyn IdleSweep>>,
    config: &PoolConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.sweep_interval.max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(pools = pools.len(), ?interval, "Idle reaper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let released = pools
                        .iter()
                        .fold(false, |acc, pool| pool.release_inactive() | acc);
                    if released {
                        tracing::debug!("Idle reaper closed inactive handles");
                    }
                }
            }
        }

        tracing::debug!("Idle reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::pool::{PoolHooks, ReaderPool, WriterPool};
    use crate::testing::{TestFactory, init_tracing};

    #[derive(Default)]
    struct CountingSweep {
        calls: AtomicUsize,
    }

    impl CountingSweep {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IdleSweep for CountingSweep {
        fn release_inactive(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn reaper_sweeps_until_cancelled() {
        init_tracing();
        let sweep = Arc::new(CountingSweep::default());
        let cancel = CancellationToken::new();

        let config = PoolConfig {
            sweep_interval: Duration::from_millis(5),
            ..PoolConfig::default()
        };

        let handle = spawn_idle_reaper(
            vec![sweep.clone() as Arc<dyn IdleSweep>],
            &config,
            cancel.clone(),
        );
        wait_until(|| sweep.calls() >= 3).await;

        cancel.cancel();
        handle.await.unwrap();

        let after = sweep.calls();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sweep.calls(), after);
    }

    #[tokio::test]
    async fn reaper_expires_idle_readers_and_writers() {
        init_tracing();
        let factory = TestFactory::new();
        let counters = Arc::clone(&factory.counters);
        let clock = Arc::new(ManualClock::new(1_000));
        let config = PoolConfig {
            inactive_reader_ttl: Duration::from_micros(100),
            inactive_writer_ttl: Duration::from_micros(100),
            sweep_interval: Duration::from_millis(5),
            ..PoolConfig::default()
        };
        let hooks = PoolHooks::new().with_clock(clock.clone());
        let readers = Arc::new(ReaderPool::with_hooks(factory.clone(), &config, hooks.clone()));
        let writers = Arc::new(WriterPool::with_hooks(factory, &config, hooks));

        readers.get("trades").unwrap().close();
        writers.get("trades").unwrap().close();
        clock.set(2_000);

        let cancel = CancellationToken::new();
        let handle = spawn_idle_reaper(
            vec![
                readers.clone() as Arc<dyn IdleSweep>,
                writers.clone() as Arc<dyn IdleSweep>,
            ],
            &config,
            cancel.clone(),
        );
        wait_until(|| counters.closes() == 2).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counters.live(), 0);
        assert_eq!(writers.size(), 0);
    }

    #[tokio::test]
    async fn zero_sweep_interval_is_clamped() {
        init_tracing();
        let sweep = Arc::new(CountingSweep::default());
        let cancel = CancellationToken::new();
        let config = PoolConfig {
            sweep_interval: Duration::ZERO,
            ..PoolConfig::default()
        };

        let handle = spawn_idle_reaper(
            vec![sweep.clone() as Arc<dyn IdleSweep>],
            &config,
            cancel.clone(),
        );
        wait_until(|| sweep.calls() >= 2).await;

        cancel.cancel();
        handle.await.unwrap();
    }
}
