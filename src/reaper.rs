//! Background sweep for stale sessions and expired locks.

use crate::hub::Hub;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Run `reap_stale` every `server.reap_interval_seconds` until `shutdown`
/// flips to `true` or its sender is dropped. The first sweep runs at once.
pub fn spawn_reaper(hub: Hub, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hub.config().server.reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = hub.config().server.reap_interval_seconds,
            stale_after_secs = hub.config().server.stale_timeout_seconds,
            "Reaper running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match hub.reap_stale(None) {
                        Ok(summary) if summary.is_empty() => debug!("Reaper sweep found nothing"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reaper sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reaper stopped");
    })
}
