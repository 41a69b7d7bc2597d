mod commands;
mod queries;

pub use commands::{CommandError, CommandRegistry, FAILED_RING_CAPACITY};
pub use queries::{QueryError, QueryRegistry, SetOutcome, MAX_PENDING_QUERIES};

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info};

pub const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically drops finished queries and times out abandoned commands.
pub fn spawn_janitor(
    queries: Arc<QueryRegistry>,
    commands: Arc<CommandRegistry>,
    interval: Option<Duration>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut ticker = time::interval(interval.unwrap_or(JANITOR_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("dispatch janitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let purged = queries.purge_finished();
                    let swept = commands.sweep();
                    if purged > 0 || swept.timed_out > 0 || swept.removed > 0 {
                        debug!(purged, timed_out = swept.timed_out, removed = swept.removed, "dispatch janitor pass");
                    }
                }
            }
        }
    })
}
