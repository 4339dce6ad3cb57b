use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::RoomDirectory;
use crate::admission::AdmissionGuard;
use crate::shutdown::ShutdownListener;

/// Periodically destroy idle empty rooms and forget quiet IPs until shutdown.
pub fn spawn(
    rooms: Arc<RoomDirectory>,
    admission: Arc<AdmissionGuard>,
    every: Duration,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset(); // skip immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    rooms.reap_inactive(now).await;
                    let forgotten = admission.prune_idle(now);
                    if forgotten > 0 {
                        debug!(forgotten, "pruned idle ip counters");
                    }
                }
                _ = shutdown.triggered() => {
                    info!("room reaper stopped");
                    break;
                }
            }
        }
    })
}
