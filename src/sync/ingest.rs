use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::api::{PushChannel, PushConnection};
use crate::model::{EntityPatch, PushMessage};
use crate::session::{ClientConfig, SyncNotice};
use crate::store::EntityStore;
use crate::sync::SnapshotLoader;
use crate::watch::Fanout;

/// Consumes the push channel and applies patches to the store. Messages are
/// applied in arrival order; everything already queued when the worker wakes
/// up is coalesced into one store batch, so downstream consumers get one
/// notification per batch rather than one per message.
pub struct DeltaIngest {
    push: Arc<dyn PushChannel>,
    store: Arc<EntityStore>,
    loader: Arc<SnapshotLoader>,
    notices: Fanout<SyncNotice>,
    backoff_initial: Duration,
    backoff_max: Duration,
    stop: Arc<AtomicBool>,
}

impl DeltaIngest {
    pub fn new(
        push: Arc<dyn PushChannel>,
        store: Arc<EntityStore>,
        loader: Arc<SnapshotLoader>,
        notices: Fanout<SyncNotice>,
        config: &ClientConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            push,
            store,
            loader,
            notices,
            backoff_initial: config.reconnect_backoff,
            backoff_max: config.reconnect_backoff_max,
            stop,
        }
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(&self) {
        let mut connected_before = false;
        let mut backoff = self.backoff_initial;
        while !self.stopped() {
            match self.push.connect() {
                Ok(connection) => {
                    backoff = self.backoff_initial;
                    if connected_before {
                        // Updates missed while disconnected cannot be
                        // replayed; only a full reload recovers them.
                        log::info!("push channel reconnected, reloading snapshots");
                        if let Err(e) = self.loader.refresh_all() {
                            log::warn!("snapshot reload after reconnect failed: {}", e);
                            return;
                        }
                        self.notices.notify(SyncNotice::PushReconnected);
                    } else {
                        log::info!("push channel connected");
                        connected_before = true;
                    }
                    self.drain(connection);
                    if self.stopped() {
                        return;
                    }
                    log::warn!("push channel disconnected");
                    self.notices.notify(SyncNotice::PushDisconnected);
                }
                Err(e) => {
                    log::warn!("push connect failed: {}", e);
                }
            }
            if !self.sleep_backoff(backoff) {
                return;
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    /// Applies messages until the connection closes or the session stops.
    fn drain(&self, connection: PushConnection) {
        loop {
            let first = match connection.messages.recv_timeout(Duration::from_millis(100)) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stopped() {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };

            let mut batch = Vec::new();
            Self::collect(&mut batch, first);
            while let Ok(message) = connection.messages.try_recv() {
                Self::collect(&mut batch, message);
            }

            if !batch.is_empty() {
                match self.store.apply_batch(batch) {
                    Ok(outcome) => log::debug!(
                        "push batch: applied={} stale={} buffered={} malformed={}",
                        outcome.applied,
                        outcome.stale,
                        outcome.buffered,
                        outcome.malformed
                    ),
                    Err(e) => log::warn!("push batch failed: {}", e),
                }
            }
            if self.stopped() {
                return;
            }
        }
    }

    fn collect(batch: &mut Vec<EntityPatch>, message: PushMessage) {
        match message.into_patch() {
            Some(patch) => batch.push(patch),
            None => log::warn!("push message without record id discarded"),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn sleep_backoff(&self, backoff: Duration) -> bool {
        let mut slept = Duration::ZERO;
        while slept < backoff {
            if self.stopped() {
                return false;
            }
            let slice = Duration::from_millis(50).min(backoff - slept);
            thread::sleep(slice);
            slept += slice;
        }
        !self.stopped()
    }
}
