//! Background expiry sweep for the memory tier.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::{SharedClock, duration_millis};
use crate::memory::MemoryTier;

/// Handle to a running sweep task.
pub(crate) struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Sweep `memory` every `period` until stopped or until the tier is dropped.
    pub(crate) fn spawn(memory: &Arc<MemoryTier>, clock: SharedClock, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let memory: Weak<MemoryTier> = Arc::downgrade(memory);

        let handle = tokio::spawn(async move {
            info!(interval_ms = duration_millis(period), "expiry sweeper started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(memory) = memory.upgrade() else { break };
                        let removed = memory.sweep_expired(clock.now_millis());
                        if removed > 0 {
                            debug!(removed, remaining = memory.entry_count(), "swept expired entries");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("expiry sweeper shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = self.handle.await;
    }
}
