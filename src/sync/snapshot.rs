use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::api::{ApiError, ApiResult, FleetApi};
use crate::model::EntityKind;
use crate::session::{Epoch, SyncNotice};
use crate::store::EntityStore;
use crate::watch::Fanout;

/// What happened to one refresh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The snapshot was fetched and applied, with this many records.
    Applied(usize),
    /// A fetch for this kind was already in flight, no new one was started.
    Suppressed,
    /// The response arrived after the session epoch moved and was ignored.
    Discarded,
    /// The fetch failed; the store keeps its previous contents and the
    /// failure was surfaced as a notice.
    Failed,
}

/// Fetches full collections from the backend and bulk-replaces them in the
/// store. At most one fetch per kind is in flight at any time, and a fetch
/// that outlives its session is discarded rather than applied.
pub struct SnapshotLoader {
    api: Arc<dyn FleetApi>,
    store: Arc<EntityStore>,
    token: String,
    epoch: Epoch,
    generation: u64,
    notices: Fanout<SyncNotice>,
}

impl SnapshotLoader {
    pub fn new(
        api: Arc<dyn FleetApi>,
        store: Arc<EntityStore>,
        token: String,
        epoch: Epoch,
        generation: u64,
        notices: Fanout<SyncNotice>,
    ) -> Self {
        Self {
            api,
            store,
            token,
            epoch,
            generation,
            notices,
        }
    }

    /// Refreshes every collection. Transport failures are reported as
    /// notices and skipped over; an authentication rejection ends the
    /// session and is the only error propagated.
    pub fn refresh_all(&self) -> Result<()> {
        log::info!("refreshing all collections from snapshot");
        for kind in EntityKind::ALL {
            self.refresh(kind)?;
        }
        Ok(())
    }

    pub fn refresh(&self, kind: EntityKind) -> Result<RefreshOutcome> {
        if !self.store.begin_snapshot(kind)? {
            log::debug!("snapshot fetch for {} already in flight, suppressed", kind);
            return Ok(RefreshOutcome::Suppressed);
        }
        match kind {
            EntityKind::Vehicle => {
                let fetched = self.api.fetch_vehicles(&self.token);
                self.finish(kind, fetched, |store, records| store.replace_vehicles(records))
            }
            EntityKind::Job => {
                let fetched = self.api.fetch_jobs(&self.token);
                self.finish(kind, fetched, |store, records| store.replace_jobs(records))
            }
            EntityKind::Zone => {
                let fetched = self.api.fetch_zones(&self.token);
                self.finish(kind, fetched, |store, records| store.replace_zones(records))
            }
            EntityKind::Alert => {
                let fetched = self.api.fetch_alerts(&self.token);
                self.finish(kind, fetched, |store, records| store.replace_alerts(records))
            }
        }
    }

    fn finish<T>(
        &self,
        kind: EntityKind,
        fetched: ApiResult<Vec<T>>,
        replace: impl FnOnce(&EntityStore, Vec<T>) -> Result<()>,
    ) -> Result<RefreshOutcome> {
        let records = match fetched {
            Ok(records) => records,
            Err(ApiError::Unauthorized) => {
                self.store.abort_snapshot(kind)?;
                log::warn!("snapshot fetch for {} rejected, session expired", kind);
                self.notices.notify(SyncNotice::SessionExpired);
                return Err(ApiError::Unauthorized.into());
            }
            Err(e) => {
                self.store.abort_snapshot(kind)?;
                log::warn!("snapshot fetch for {} failed: {}", kind, e);
                self.notices.notify(SyncNotice::SnapshotFailed {
                    kind,
                    error: e.to_string(),
                });
                return Ok(RefreshOutcome::Failed);
            }
        };

        // A logout or re-login while the fetch was on the wire makes the
        // response stale for good; it must not reach the successor store.
        if self.epoch.current() != self.generation {
            self.store.abort_snapshot(kind)?;
            log::debug!("snapshot for {} discarded, session epoch moved", kind);
            return Ok(RefreshOutcome::Discarded);
        }

        let count = records.len();
        replace(&self.store, records)?;
        log::info!("snapshot for {} applied, {} records", kind, count);
        Ok(RefreshOutcome::Applied(count))
    }

    /// Periodic refresh on a background thread until `stop` is set. Sleeps
    /// in short slices so teardown is not held up by a long interval.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let loader = self;
        thread::spawn(move || loop {
            let mut slept = Duration::ZERO;
            while slept < interval {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                let slice = Duration::from_millis(50).min(interval - slept);
                thread::sleep(slice);
                slept += slice;
            }
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = loader.refresh_all() {
                // Only an expired session gets here; the notice is already out.
                log::warn!("periodic snapshot refresh stopped: {}", e);
                return;
            }
        })
    }
}
