//! Poll scheduler: one recurring tokio task per active release, gated by
//! the distributed lease.
//!
//! The scheduler owns an explicit table of timer handles keyed by
//! release id — start/stop are lifecycle methods, not ambient module
//! state. Each tick first tries to acquire (or renew) the release's
//! lease; on failure the tick is a silent skip, because another instance
//! owns the release. The lease is held continuously between ticks and
//! goes stale only when `lock_timeout` elapses without renewal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::coordinator::{StageCoordinator, TickOutcome};
use crate::engine::EngineDeps;
use crate::errors::EngineError;
use crate::model::ReleaseId;

/// Recurring poll driver over all releases this instance watches.
pub struct PollScheduler {
    deps: Arc<EngineDeps>,
    coordinator: Arc<StageCoordinator>,
    instance_id: String,
    poll_interval: Duration,
    timers: Arc<Mutex<HashMap<ReleaseId, JoinHandle<()>>>>,
}

impl PollScheduler {
    pub fn new(
        deps: Arc<EngineDeps>,
        coordinator: Arc<StageCoordinator>,
        instance_id: &str,
        poll_interval: Duration,
    ) -> Self {
        Self {
            deps,
            coordinator,
            instance_id: instance_id.to_string(),
            poll_interval,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Start the recurring timer for a release. Idempotent: a release
    /// already being polled is left alone.
    pub async fn start(&self, release_id: ReleaseId) -> Result<(), EngineError> {
        if self
            .deps
            .releases
            .get(release_id)
            .await?
            .is_none()
        {
            return Err(EngineError::ReleaseNotFound(release_id));
        }
        if self
            .deps
            .cron_jobs
            .get_by_release(release_id)
            .await?
            .is_none()
        {
            return Err(EngineError::CronJobNotFound(release_id));
        }

        let mut timers = self.timers.lock().await;
        if timers.contains_key(&release_id) {
            return Ok(());
        }

        let deps = self.deps.clone();
        let coordinator = self.coordinator.clone();
        let instance_id = self.instance_id.clone();
        let interval = self.poll_interval;
        let registry = self.timers.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tick_release(&deps, &coordinator, &instance_id, release_id).await {
                    Ok(TickOutcome::Finished) => {
                        info!(release_id = %release_id, "release finished, stopping poll loop");
                        break;
                    }
                    Ok(_) => {}
                    // A failed tick aborts only this release's tick; the
                    // loop keeps going and state is re-derived next time.
                    Err(err) => {
                        error!(release_id = %release_id, error = %err, "poll tick failed");
                    }
                }
            }
            registry.lock().await.remove(&release_id);
        });

        timers.insert(release_id, handle);
        info!(release_id = %release_id, "started release polling");
        Ok(())
    }

    /// Stop the recurring timer for a release. Idempotent; stage state is
    /// left untouched.
    pub async fn stop(&self, release_id: ReleaseId) {
        if let Some(handle) = self.timers.lock().await.remove(&release_id) {
            handle.abort();
            info!(release_id = %release_id, "stopped release polling");
        }
    }

    /// Whether a timer is currently registered for the release.
    pub async fn is_polling(&self, release_id: ReleaseId) -> bool {
        self.timers.lock().await.contains_key(&release_id)
    }

    /// Run a single tick now, outside the recurring timer. Used by the
    /// facade for synchronous driving (and by tests).
    pub async fn run_tick_once(&self, release_id: ReleaseId) -> Result<TickOutcome, EngineError> {
        tick_release(&self.deps, &self.coordinator, &self.instance_id, release_id).await
    }
}

/// One poll tick: acquire/renew the lease, then do coordinator work.
async fn tick_release(
    deps: &Arc<EngineDeps>,
    coordinator: &Arc<StageCoordinator>,
    instance_id: &str,
    release_id: ReleaseId,
) -> Result<TickOutcome, EngineError> {
    let now = deps.clock.now();
    let acquired = deps
        .cron_jobs
        .try_acquire_lock(release_id, instance_id, now)
        .await?;
    if acquired.is_none() {
        // Lock contention is not an error; another instance owns this
        // release for now.
        debug!(release_id = %release_id, "lease held elsewhere, skipping tick");
        return Ok(TickOutcome::Idle);
    }

    let release = deps
        .releases
        .get(release_id)
        .await?
        .ok_or(EngineError::ReleaseNotFound(release_id))?;

    coordinator.run_tick(&release).await
}
