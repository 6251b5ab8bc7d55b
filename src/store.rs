use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use serde_json::Value;

use crate::model::{Alert, EntityKind, EntityPatch, FieldMap, Job, Record, Vehicle, Zone};
use crate::watch::{Fanout, StoreUpdate, Subscription};

/// Bounds for the per-kind pending-patch buffer. Deliberately conservative
/// defaults; a later snapshot corrects anything the buffer drops.
#[derive(Clone, Copy, Debug)]
pub struct BufferLimits {
    /// Maximum buffered patches per kind; the oldest is evicted on overflow.
    pub capacity: usize,
    /// Snapshot cycles an unmatched patch survives before it is dropped.
    pub horizon: u32,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            capacity: 64,
            horizon: 3,
        }
    }
}

/// Per-batch accounting returned by [`EntityStore::apply_batch`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub stale: usize,
    pub buffered: usize,
    pub malformed: usize,
}

/// An immutable, internally consistent view of every collection at one
/// revision. Cheap to clone; consumers can hold it across renders without
/// blocking the store.
#[derive(Clone, Debug)]
pub struct FleetSnapshot {
    pub revision: u64,
    pub vehicles: Arc<Vec<Vehicle>>,
    pub jobs: Arc<Vec<Job>>,
    pub zones: Arc<Vec<Zone>>,
    pub alerts: Arc<Vec<Alert>>,
}

#[derive(Clone, Debug)]
struct Versioned<T> {
    record: T,
    version: u64,
}

#[derive(Clone, Debug)]
struct PendingPatch {
    id: String,
    fields: FieldMap,
    version: u64,
    cycles: u32,
}

#[derive(Clone, Debug)]
struct ReplayPatch {
    id: String,
    fields: FieldMap,
    version: u64,
}

enum PatchDisposition {
    Applied,
    Stale,
    Buffered,
    Malformed,
}

struct Collection<T: Record> {
    records: HashMap<String, Versioned<T>>,
    /// Patches for ids the store has not seen yet, waiting for a snapshot to
    /// introduce them.
    pending: VecDeque<PendingPatch>,
    /// Patches accepted while a snapshot fetch is in flight. Replayed on top
    /// of the fresh snapshot so none of them is lost to the bulk replace.
    replay: VecDeque<ReplayPatch>,
    fetching: bool,
    view: Arc<Vec<T>>,
}

impl<T: Record> Default for Collection<T> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            pending: VecDeque::new(),
            replay: VecDeque::new(),
            fetching: false,
            view: Arc::new(Vec::new()),
        }
    }
}

fn merge_fields<T: Record>(record: &T, fields: &FieldMap) -> Result<T> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        for (name, field) in fields {
            map.insert(name.clone(), field.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

impl<T: Record> Collection<T> {
    /// Merges `fields` into an existing record, honoring the version rule.
    /// Returns None when the id is unknown to this collection.
    fn merge_existing(&mut self, id: &str, fields: &FieldMap, version: u64) -> Option<PatchDisposition> {
        let current = self.records.get_mut(id)?;
        if version <= current.version {
            log::debug!(
                "stale {} patch for {} discarded (v{} <= v{})",
                T::KIND,
                id,
                version,
                current.version
            );
            return Some(PatchDisposition::Stale);
        }
        let merged = match merge_fields(&current.record, fields) {
            Ok(merged) => merged,
            Err(e) => {
                log::warn!("malformed {} patch for {} dropped: {}", T::KIND, id, e);
                return Some(PatchDisposition::Malformed);
            }
        };
        T::data_quality_check(&current.record, &merged);
        current.record = merged;
        current.version = version;
        Some(PatchDisposition::Applied)
    }

    fn apply(&mut self, id: &str, fields: &FieldMap, version: u64, limits: &BufferLimits) -> PatchDisposition {
        if let Some(disposition) = self.merge_existing(id, fields, version) {
            if matches!(disposition, PatchDisposition::Applied) && self.fetching {
                if self.replay.len() >= limits.capacity {
                    self.replay.pop_front();
                    log::warn!("{} replay buffer full, dropping oldest entry", T::KIND);
                }
                self.replay.push_back(ReplayPatch {
                    id: id.to_string(),
                    fields: fields.clone(),
                    version,
                });
            }
            return disposition;
        }

        // Unknown id: hold the patch until a snapshot introduces the record.
        if self.pending.len() >= limits.capacity {
            if let Some(evicted) = self.pending.pop_front() {
                log::warn!(
                    "{} pending buffer full, evicting oldest patch for {}",
                    T::KIND,
                    evicted.id
                );
            }
        }
        log::debug!("{} patch for unknown id {} buffered", T::KIND, id);
        self.pending.push_back(PendingPatch {
            id: id.to_string(),
            fields: fields.clone(),
            version,
            cycles: 0,
        });
        PatchDisposition::Buffered
    }

    /// Atomic bulk replace from a snapshot fetch. Records absent from the new
    /// set are removed; record versions reset to 0 because the snapshot is
    /// authoritative full state. Patches that raced the fetch replay on top,
    /// and buffered patches whose id the snapshot introduced are drained.
    fn replace(&mut self, records: Vec<T>, limits: &BufferLimits) {
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            let id = record.id().to_string();
            if map.insert(id.clone(), Versioned { record, version: 0 }).is_some() {
                log::warn!("{} snapshot carries duplicate id {}, keeping the last", T::KIND, id);
            }
        }
        self.records = map;
        self.fetching = false;

        let mut replay: Vec<ReplayPatch> = self.replay.drain(..).collect();
        replay.sort_by_key(|patch| patch.version);
        for patch in replay {
            if self.merge_existing(&patch.id, &patch.fields, patch.version).is_none() {
                log::debug!(
                    "{} patch for {} not replayed, id no longer in the snapshot",
                    T::KIND,
                    patch.id
                );
            }
        }

        let pending: Vec<PendingPatch> = self.pending.drain(..).collect();
        let (matched, unmatched): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|patch| self.records.contains_key(&patch.id));

        let mut matched = matched;
        matched.sort_by_key(|patch| patch.version);
        for patch in matched {
            log::debug!("replaying buffered {} patch for {}", T::KIND, patch.id);
            let _ = self.merge_existing(&patch.id, &patch.fields, patch.version);
        }

        for mut patch in unmatched {
            patch.cycles += 1;
            if patch.cycles >= limits.horizon {
                log::debug!(
                    "buffered {} patch for {} expired after {} snapshot cycles",
                    T::KIND,
                    patch.id,
                    patch.cycles
                );
            } else {
                self.pending.push_back(patch);
            }
        }
    }

    fn begin_fetch(&mut self) -> bool {
        if self.fetching {
            return false;
        }
        self.fetching = true;
        true
    }

    fn abort_fetch(&mut self) {
        self.fetching = false;
        self.replay.clear();
    }

    fn clear(&mut self) {
        self.records.clear();
        self.pending.clear();
        self.replay.clear();
        self.fetching = false;
        self.view = Arc::new(Vec::new());
    }

    fn rebuild_view(&mut self) {
        let mut view: Vec<T> = self.records.values().map(|v| v.record.clone()).collect();
        view.sort_by(|a, b| a.id().cmp(b.id()));
        self.view = Arc::new(view);
    }
}

struct Inner {
    revision: u64,
    vehicles: Collection<Vehicle>,
    jobs: Collection<Job>,
    zones: Collection<Zone>,
    alerts: Collection<Alert>,
}

impl Inner {
    fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            revision: self.revision,
            vehicles: self.vehicles.view.clone(),
            jobs: self.jobs.view.clone(),
            zones: self.zones.view.clone(),
            alerts: self.alerts.view.clone(),
        }
    }

    fn advance(&mut self) -> StoreUpdate {
        self.revision += 1;
        StoreUpdate {
            revision: self.revision,
            snapshot: self.snapshot(),
        }
    }
}

/// The authoritative in-memory collections for one client session. All
/// mutation funnels through the write-locked entry points here, so a bulk
/// replace and a patch batch can never interleave, and watchers are notified
/// only after the lock is released.
pub struct EntityStore {
    inner: RwLock<Inner>,
    watchers: Fanout<StoreUpdate>,
    limits: BufferLimits,
}

impl EntityStore {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            inner: RwLock::new(Inner {
                revision: 0,
                vehicles: Collection::default(),
                jobs: Collection::default(),
                zones: Collection::default(),
                alerts: Collection::default(),
            }),
            watchers: Fanout::new(),
            limits,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on store"))
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.read()?.revision)
    }

    /// Returns the current immutable snapshot. Never a live reference:
    /// later mutations are invisible to the returned value.
    pub fn snapshot(&self) -> Result<FleetSnapshot> {
        Ok(self.read()?.snapshot())
    }

    pub fn replace_vehicles(&self, records: Vec<Vehicle>) -> Result<()> {
        let update = {
            let mut inner = self.write()?;
            inner.vehicles.replace(records, &self.limits);
            inner.vehicles.rebuild_view();
            inner.advance()
        };
        self.watchers.notify(update);
        Ok(())
    }

    pub fn replace_jobs(&self, records: Vec<Job>) -> Result<()> {
        let update = {
            let mut inner = self.write()?;
            inner.jobs.replace(records, &self.limits);
            inner.jobs.rebuild_view();
            inner.advance()
        };
        self.watchers.notify(update);
        Ok(())
    }

    pub fn replace_zones(&self, records: Vec<Zone>) -> Result<()> {
        let update = {
            let mut inner = self.write()?;
            inner.zones.replace(records, &self.limits);
            inner.zones.rebuild_view();
            inner.advance()
        };
        self.watchers.notify(update);
        Ok(())
    }

    pub fn replace_alerts(&self, records: Vec<Alert>) -> Result<()> {
        let update = {
            let mut inner = self.write()?;
            inner.alerts.replace(records, &self.limits);
            inner.alerts.rebuild_view();
            inner.advance()
        };
        self.watchers.notify(update);
        Ok(())
    }

    /// Applies a batch of patches as one logical step: one revision bump and
    /// one watcher notification no matter how many patches were coalesced
    /// into the batch. Stale patches are discarded, unknown ids buffered.
    pub fn apply_batch(&self, patches: Vec<EntityPatch>) -> Result<BatchOutcome> {
        if patches.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut outcome = BatchOutcome::default();
        let update = {
            let mut inner = self.write()?;
            let mut vehicles_changed = false;
            let mut jobs_changed = false;
            let mut zones_changed = false;
            let mut alerts_changed = false;

            for patch in &patches {
                let disposition = match patch.kind {
                    EntityKind::Vehicle => {
                        inner.vehicles.apply(&patch.id, &patch.fields, patch.version, &self.limits)
                    }
                    EntityKind::Job => {
                        inner.jobs.apply(&patch.id, &patch.fields, patch.version, &self.limits)
                    }
                    EntityKind::Zone => {
                        inner.zones.apply(&patch.id, &patch.fields, patch.version, &self.limits)
                    }
                    EntityKind::Alert => {
                        inner.alerts.apply(&patch.id, &patch.fields, patch.version, &self.limits)
                    }
                };
                match disposition {
                    PatchDisposition::Applied => {
                        outcome.applied += 1;
                        match patch.kind {
                            EntityKind::Vehicle => vehicles_changed = true,
                            EntityKind::Job => jobs_changed = true,
                            EntityKind::Zone => zones_changed = true,
                            EntityKind::Alert => alerts_changed = true,
                        }
                    }
                    PatchDisposition::Stale => outcome.stale += 1,
                    PatchDisposition::Buffered => outcome.buffered += 1,
                    PatchDisposition::Malformed => outcome.malformed += 1,
                }
            }

            if vehicles_changed {
                inner.vehicles.rebuild_view();
            }
            if jobs_changed {
                inner.jobs.rebuild_view();
            }
            if zones_changed {
                inner.zones.rebuild_view();
            }
            if alerts_changed {
                inner.alerts.rebuild_view();
            }

            if outcome.applied > 0 {
                Some(inner.advance())
            } else {
                None
            }
        };
        if let Some(update) = update {
            self.watchers.notify(update);
        }
        Ok(outcome)
    }

    pub fn apply_patch(&self, patch: EntityPatch) -> Result<BatchOutcome> {
        self.apply_batch(vec![patch])
    }

    /// Marks a snapshot fetch as in flight for `kind`. Returns false when one
    /// is already in flight, which suppresses the new fetch.
    pub fn begin_snapshot(&self, kind: EntityKind) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(match kind {
            EntityKind::Vehicle => inner.vehicles.begin_fetch(),
            EntityKind::Job => inner.jobs.begin_fetch(),
            EntityKind::Zone => inner.zones.begin_fetch(),
            EntityKind::Alert => inner.alerts.begin_fetch(),
        })
    }

    /// Clears the in-flight marker after a failed or discarded fetch. The
    /// collection's previous contents stay untouched.
    pub fn abort_snapshot(&self, kind: EntityKind) -> Result<()> {
        let mut inner = self.write()?;
        match kind {
            EntityKind::Vehicle => inner.vehicles.abort_fetch(),
            EntityKind::Job => inner.jobs.abort_fetch(),
            EntityKind::Zone => inner.zones.abort_fetch(),
            EntityKind::Alert => inner.alerts.abort_fetch(),
        }
        Ok(())
    }

    pub fn find_alert(&self, id: &str) -> Result<Option<(Alert, u64)>> {
        let inner = self.read()?;
        Ok(inner
            .alerts
            .records
            .get(id)
            .map(|v| (v.record.clone(), v.version)))
    }

    /// Session teardown: drops every record and notifies watchers with the
    /// empty state.
    pub fn clear(&self) -> Result<()> {
        let update = {
            let mut inner = self.write()?;
            inner.vehicles.clear();
            inner.jobs.clear();
            inner.zones.clear();
            inner.alerts.clear();
            inner.advance()
        };
        self.watchers.notify(update);
        Ok(())
    }

    /// Subscribes to revision advances. The current state is delivered into
    /// the channel before this returns, so a subscriber registered right
    /// after a mutation still sees it.
    pub fn watch(&self) -> Result<(Subscription<StoreUpdate>, Receiver<StoreUpdate>)> {
        let inner = self.read()?;
        let current = StoreUpdate {
            revision: inner.revision,
            snapshot: inner.snapshot(),
        };
        Ok(self.watchers.subscribe_seeded(current))
    }

    /// Callback flavor of [`EntityStore::watch`], running on its own thread.
    pub fn observe(
        &self,
        callback: impl FnMut(StoreUpdate) + Send + 'static,
    ) -> Result<Subscription<StoreUpdate>> {
        let inner = self.read()?;
        let current = StoreUpdate {
            revision: inner.revision,
            snapshot: inner.snapshot(),
        };
        Ok(self.watchers.observe_seeded(current, callback))
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.subscriber_count()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}
