//! Periodic retention cleanup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::ratelimit::RateLimiter;

/// Run [`RateLimiter::cleanup`] every `interval` until `shutdown` resolves.
///
/// The first run happens immediately. Returns the number of runs made.
pub async fn run_with_shutdown<F>(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: F,
) -> u64
where
    F: Future<Output = ()> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(interval_secs = interval.as_secs(), "Starting cleanup janitor");

    let mut runs = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(runs, "Cleanup janitor stopped");
                return runs;
            }
            _ = ticker.tick() => {
                let deleted = limiter.cleanup().await;
                runs += 1;
                debug!(run = runs, ?deleted, "Cleanup run finished");
            }
        }
    }
}
