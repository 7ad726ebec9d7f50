//! Background eviction thread.
//!
//! Runs an expiration sweep followed by an LFU sweep on a dedicated thread
//! every interval, until shut down.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::config::EvictionConfig;
use crate::manager::MemoryManager;
use crate::metrics::SWEEPS;

/// Sweeper settings.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        EvictionConfig::default().into()
    }
}

impl From<&EvictionConfig> for SweepConfig {
    fn from(config: &EvictionConfig) -> Self {
        Self {
            interval: config.sweep_interval(),
        }
    }
}

impl From<EvictionConfig> for SweepConfig {
    fn from(config: EvictionConfig) -> Self {
        (&config).into()
    }
}

/// Handle to a running sweeper thread. Dropping it stops the thread.
pub struct Sweeper {
    shutdown_tx: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start sweeping `manager` on a thread named "offheap-sweeper".
    pub fn spawn(manager: Arc<MemoryManager>, config: SweepConfig) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = config.interval;

        let join_handle = std::thread::Builder::new()
            .name("offheap-sweeper".to_string())
            .spawn(move || {
                debug!(?interval, "sweeper started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => sweep(&manager),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("sweeper stopped");
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        })
    }

    /// Signal the sweeper to stop and wait for it to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(manager: &MemoryManager) {
    SWEEPS.increment();

    let expired = match manager.collect_expired() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "expiration sweep failed");
            0
        }
    };

    let lfu = match manager.collect_lfu() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "lfu sweep failed");
            0
        }
    };

    if expired > 0 || lfu > 0 {
        debug!(expired, lfu, used = manager.used(), "sweep complete");
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::pointer::Expiry;
    use std::time::Instant;

    #[test]
    fn test_sweeper_collects_expired() {
        let manager = Arc::new(
            MemoryManager::builder()
                .region_size(1024)
                .build()
                .unwrap(),
        );
        let p = manager
            .store(&[0; 64], Expiry::after(Duration::from_millis(20)))
            .unwrap()
            .unwrap();

        let sweeper = Sweeper::spawn(
            manager.clone(),
            SweepConfig {
                interval: Duration::from_millis(10),
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.used() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        sweeper.shutdown();

        assert_eq!(manager.used(), 0);
        assert!(manager.info(&p).is_err());
    }

    #[test]
    fn test_drop_stops_thread() {
        let manager = Arc::new(
            MemoryManager::builder()
                .region_size(64)
                .build()
                .unwrap(),
        );
        let sweeper = Sweeper::spawn(
            manager.clone(),
            SweepConfig {
                interval: Duration::from_secs(60),
            },
        )
        .unwrap();
        drop(sweeper);
        // The thread held the only other reference.
        assert_eq!(Arc::strong_count(&manager), 1);
    }

    #[test]
    fn test_config_from_eviction() {
        let config = EvictionConfig {
            sweep_interval_ms: 250,
            ..Default::default()
        };
        let sweep: SweepConfig = (&config).into();
        assert_eq!(sweep.interval, Duration::from_millis(250));
        assert_eq!(SweepConfig::default().interval, Duration::from_secs(1));
    }
}
