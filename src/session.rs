use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::analytics::{AnalyticsView, FleetRollup};
use crate::api::{ApiError, FleetApi, HttpApi, PushChannel};
use crate::model::{EntityKind, EntityPatch, FieldMap, User};
use crate::store::{BufferLimits, EntityStore};
use crate::sync::{DeltaIngest, SnapshotLoader};
use crate::watch::{Fanout, Subscription};

/// Non-fatal (and one fatal) conditions surfaced to the embedding UI. None
/// of these are crashes; the store always keeps its last-known-good data.
#[derive(Clone, Debug)]
pub enum SyncNotice {
    /// A collection fetch failed; previous contents remain available.
    SnapshotFailed { kind: EntityKind, error: String },
    /// The push channel dropped. Ingest pauses until reconnect.
    PushDisconnected,
    /// The push channel is back and the store was reloaded first.
    PushReconnected,
    /// An optimistic acknowledge was rolled back.
    AcknowledgeFailed { alert_id: String, error: String },
    /// The backend rejected our token. The session is over; the embedding
    /// app should call [`FleetClient::logout`].
    SessionExpired,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How often every collection is re-fetched in the background.
    pub snapshot_interval: Duration,
    /// First reconnect delay after a push disconnect; doubles up to the max.
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    /// Bounds for the unknown-id patch buffer.
    pub pending_patches: BufferLimits,
    /// Slack added to a job's estimated ETA before it counts as late. The
    /// backend's own aggregate allows 15 minutes; the local default is
    /// strict.
    pub on_time_grace_minutes: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            pending_patches: BufferLimits::default(),
            on_time_grace_minutes: 0,
        }
    }
}

/// Monotonic session counter shared with the workers. A fetch tags itself
/// with the value at session start; once logout advances the counter, the
/// fetch's eventual response is discarded instead of applied to a store
/// that belongs to a newer session.
#[derive(Clone, Default)]
pub struct Epoch(Arc<AtomicU64>);

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct ActiveSession {
    session_id: String,
    user: User,
    token: String,
    store: Arc<EntityStore>,
    analytics: AnalyticsView,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the session lifecycle: login builds a fresh store and starts the
/// snapshot and ingest workers, logout tears everything down. There is at
/// most one active session; all mutation of fleet state goes through the
/// session's store.
pub struct FleetClient {
    config: ClientConfig,
    api: Arc<dyn FleetApi>,
    push: Arc<dyn PushChannel>,
    epoch: Epoch,
    notices: Fanout<SyncNotice>,
    active: RwLock<Option<ActiveSession>>,
}

#[derive(Default)]
pub struct FleetClientBuilder {
    config: Option<ClientConfig>,
    api: Option<Arc<dyn FleetApi>>,
    push: Option<Arc<dyn PushChannel>>,
}

impl FleetClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses the HTTP backend at `base_url` for request/response calls.
    pub fn http(mut self, base_url: &str) -> Result<Self> {
        self.api = Some(Arc::new(HttpApi::new(base_url)?));
        Ok(self)
    }

    pub fn api(mut self, api: Arc<dyn FleetApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn push(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn build(self) -> Result<FleetClient> {
        Ok(FleetClient {
            config: self.config.unwrap_or_default(),
            api: self.api.ok_or_else(|| anyhow!("no backend api configured"))?,
            push: self
                .push
                .ok_or_else(|| anyhow!("no push channel configured"))?,
            epoch: Epoch::new(),
            notices: Fanout::new(),
            active: RwLock::new(None),
        })
    }
}

impl FleetClient {
    pub fn builder() -> FleetClientBuilder {
        FleetClientBuilder::default()
    }

    /// Authenticates against the backend, builds a fresh store, loads the
    /// initial snapshots and starts the background workers. Any previous
    /// session is torn down first.
    pub fn login(&self, username: &str, password: &str) -> Result<User> {
        self.logout()?;

        let auth = self.api.login(username, password)?;
        let generation = self.epoch.advance();
        let session_id = Uuid::now_v7().to_string();
        log::info!(
            "session {} started for {} ({:?})",
            session_id,
            auth.user.username,
            auth.user.role
        );

        let store = Arc::new(EntityStore::new(self.config.pending_patches));
        let loader = Arc::new(SnapshotLoader::new(
            self.api.clone(),
            store.clone(),
            auth.access_token.clone(),
            self.epoch.clone(),
            generation,
            self.notices.clone(),
        ));

        // Initial load before the push stream starts. Transport failures are
        // surfaced as notices and tolerated; a token rejection is not.
        loader.refresh_all()?;

        let stop = Arc::new(AtomicBool::new(false));
        let ingest = DeltaIngest::new(
            self.push.clone(),
            store.clone(),
            loader.clone(),
            self.notices.clone(),
            &self.config,
            stop.clone(),
        );
        let workers = vec![
            ingest.spawn(),
            loader
                .clone()
                .spawn_periodic(self.config.snapshot_interval, stop.clone()),
        ];

        let analytics =
            AnalyticsView::new(chrono::Duration::minutes(self.config.on_time_grace_minutes));
        let user = auth.user.clone();
        let mut active = self
            .active
            .write()
            .map_err(|_| anyhow!("Failed to acquire write lock on session"))?;
        *active = Some(ActiveSession {
            session_id,
            user: auth.user,
            token: auth.access_token,
            store,
            analytics,
            stop,
            workers,
        });
        Ok(user)
    }

    /// Ends the current session, if any: the token is forgotten, the store
    /// is emptied, in-flight fetches are orphaned by the epoch advance, and
    /// the workers wind down on their own after seeing the stop flag.
    pub fn logout(&self) -> Result<()> {
        let previous = {
            let mut active = self
                .active
                .write()
                .map_err(|_| anyhow!("Failed to acquire write lock on session"))?;
            active.take()
        };
        if let Some(session) = previous {
            self.epoch.advance();
            session.stop.store(true, Ordering::Relaxed);
            session.store.clear()?;
            log::info!("session {} ended", session.session_id);
            drop(session.workers);
        }
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.active
            .read()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    pub fn user(&self) -> Option<User> {
        self.active
            .read()
            .ok()
            .and_then(|active| active.as_ref().map(|s| s.user.clone()))
    }

    /// The current session's store, for consumers that want to subscribe or
    /// read snapshots directly.
    pub fn store(&self) -> Option<Arc<EntityStore>> {
        self.active
            .read()
            .ok()
            .and_then(|active| active.as_ref().map(|s| s.store.clone()))
    }

    pub fn notices(&self) -> (Subscription<SyncNotice>, Receiver<SyncNotice>) {
        self.notices.subscribe()
    }

    pub fn observe_notices(
        &self,
        callback: impl FnMut(SyncNotice) + Send + 'static,
    ) -> Subscription<SyncNotice> {
        self.notices.observe(callback)
    }

    /// Local analytics over the live store, memoized per revision.
    pub fn analytics(&self) -> Result<Option<FleetRollup>> {
        let active = self
            .active
            .read()
            .map_err(|_| anyhow!("Failed to acquire read lock on session"))?;
        match active.as_ref() {
            None => Ok(None),
            Some(session) => {
                let snapshot = session.store.snapshot()?;
                Ok(Some(
                    session
                        .analytics
                        .rollup(&snapshot, Utc::now().date_naive()),
                ))
            }
        }
    }

    /// Acknowledges an alert: optimistic local flip first, then the backend
    /// call; on rejection the flip is rolled back and the failure surfaced.
    /// Acknowledging an already-acknowledged alert is a no-op success.
    pub fn acknowledge_alert(&self, alert_id: &str) -> Result<()> {
        let (store, token, role) = {
            let active = self
                .active
                .read()
                .map_err(|_| anyhow!("Failed to acquire read lock on session"))?;
            let session = active
                .as_ref()
                .ok_or_else(|| anyhow!("no active session"))?;
            (session.store.clone(), session.token.clone(), session.user.role)
        };

        let (alert, version) = store
            .find_alert(alert_id)?
            .ok_or_else(|| anyhow!("unknown alert {}", alert_id))?;
        if alert.acknowledged {
            log::debug!("alert {} already acknowledged", alert_id);
            return Ok(());
        }
        if !role.can_acknowledge() {
            // Advisory only; authorization is the backend's call.
            log::info!("role {:?} attempting to acknowledge alert {}", role, alert_id);
        }

        store.apply_patch(acknowledge_patch(alert_id, true, version + 1))?;

        match self.api.acknowledge_alert(&token, alert_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                store.apply_patch(acknowledge_patch(alert_id, false, version + 2))?;
                log::warn!("acknowledge of alert {} rejected: {}", alert_id, e);
                self.notices.notify(SyncNotice::AcknowledgeFailed {
                    alert_id: alert_id.to_string(),
                    error: e.to_string(),
                });
                if matches!(e, ApiError::Unauthorized) {
                    self.notices.notify(SyncNotice::SessionExpired);
                }
                Err(anyhow!("failed to acknowledge alert {}: {}", alert_id, e))
            }
        }
    }
}

fn acknowledge_patch(alert_id: &str, acknowledged: bool, version: u64) -> EntityPatch {
    let mut fields = FieldMap::new();
    fields.insert("acknowledged".to_string(), Value::Bool(acknowledged));
    EntityPatch {
        kind: EntityKind::Alert,
        id: alert_id.to_string(),
        fields,
        version,
    }
}
