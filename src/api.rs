use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Alert, AuthSession, Job, PushMessage, Role, User, Vehicle, Zone};

/// Failure taxonomy for the backend interfaces. `Unauthorized` is fatal to
/// the current session; everything else is recoverable locally.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication rejected")]
    Unauthorized,
    #[error("request failed with status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Backend-computed on-time aggregate over its full job history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnTimeSummary {
    pub on_time_percentage: f64,
    pub total_jobs: usize,
    pub on_time_jobs: usize,
}

/// Backend-computed delivery counts keyed by ISO date. Sparse: days without
/// deliveries are absent, unlike the local rollup which zero-fills.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyDeliveryTotals {
    pub daily_deliveries: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneDelayReport {
    pub zones: Vec<Zone>,
}

/// Request/response side of the backend: login, full-collection fetches,
/// the alert acknowledge call and the precomputed analytics reads.
/// Implementations must be usable from worker threads.
pub trait FleetApi: Send + Sync {
    fn login(&self, username: &str, password: &str) -> ApiResult<AuthSession>;
    fn fetch_vehicles(&self, token: &str) -> ApiResult<Vec<Vehicle>>;
    fn fetch_jobs(&self, token: &str) -> ApiResult<Vec<Job>>;
    fn fetch_zones(&self, token: &str) -> ApiResult<Vec<Zone>>;
    fn fetch_alerts(&self, token: &str) -> ApiResult<Vec<Alert>>;
    /// Idempotent: acknowledging an already-acknowledged alert succeeds.
    fn acknowledge_alert(&self, token: &str, alert_id: &str) -> ApiResult<()>;
    /// Aggregates computed server-side over a longer-lived dataset than the
    /// client session. Compatible in meaning with the local rollups, which
    /// exist for per-revision UI responsiveness.
    fn analytics_on_time(&self, token: &str) -> ApiResult<OnTimeSummary>;
    fn analytics_daily_deliveries(&self, token: &str) -> ApiResult<DailyDeliveryTotals>;
    fn analytics_zone_delays(&self, token: &str) -> ApiResult<ZoneDelayReport>;
}

/// One live push connection. Message framing and transport are the
/// adapter's concern; the core only consumes the channel until it closes,
/// which signals a disconnect.
pub struct PushConnection {
    pub messages: Receiver<PushMessage>,
}

/// Persistent-connection side of the backend. `connect` is called again
/// after every disconnect, with backoff.
pub trait PushChannel: Send + Sync {
    fn connect(&self) -> ApiResult<PushConnection>;
}

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

/// HTTP implementation of [`FleetApi`] against the dashboard backend's
/// `/api` routes, bearer-token authenticated.
pub struct HttpApi {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(transport)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check<T: DeserializeOwned>(response: reqwest::blocking::Response) -> ApiResult<T> {
        let status = response.status().as_u16();
        match status {
            200..=299 => response.json().map_err(transport),
            401 | 403 => Err(ApiError::Unauthorized),
            _ => Err(ApiError::Status(status)),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, token: &str) -> ApiResult<T> {
        log::debug!("API GET: {}", path);
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .map_err(transport)?;
        Self::check(response)
    }
}

impl FleetApi for HttpApi {
    fn login(&self, username: &str, password: &str) -> ApiResult<AuthSession> {
        log::debug!("API POST: /api/auth/login for {}", username);
        let response = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
            }))
            .send()
            .map_err(transport)?;
        Self::check(response)
    }

    fn fetch_vehicles(&self, token: &str) -> ApiResult<Vec<Vehicle>> {
        self.get_json("/api/vehicles", token)
    }

    fn fetch_jobs(&self, token: &str) -> ApiResult<Vec<Job>> {
        self.get_json("/api/jobs", token)
    }

    fn fetch_zones(&self, token: &str) -> ApiResult<Vec<Zone>> {
        self.get_json("/api/zones", token)
    }

    fn fetch_alerts(&self, token: &str) -> ApiResult<Vec<Alert>> {
        self.get_json("/api/alerts", token)
    }

    fn acknowledge_alert(&self, token: &str, alert_id: &str) -> ApiResult<()> {
        let path = format!("/api/alerts/{}/acknowledge", alert_id);
        log::debug!("API PUT: {}", path);
        let response = self
            .client
            .put(self.url(&path))
            .bearer_auth(token)
            .send()
            .map_err(transport)?;
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(()),
            401 | 403 => Err(ApiError::Unauthorized),
            _ => Err(ApiError::Status(status)),
        }
    }

    fn analytics_on_time(&self, token: &str) -> ApiResult<OnTimeSummary> {
        self.get_json("/api/analytics/on-time-percentage", token)
    }

    fn analytics_daily_deliveries(&self, token: &str) -> ApiResult<DailyDeliveryTotals> {
        self.get_json("/api/analytics/daily-deliveries", token)
    }

    fn analytics_zone_delays(&self, token: &str) -> ApiResult<ZoneDelayReport> {
        self.get_json("/api/analytics/zone-delays", token)
    }
}

#[derive(Default)]
struct InMemoryState {
    users: Vec<(String, String, User)>,
    issued_tokens: Vec<String>,
    vehicles: Vec<Vehicle>,
    jobs: Vec<Job>,
    zones: Vec<Zone>,
    alerts: Vec<Alert>,
    fail_fetches: bool,
    fail_acknowledge: bool,
    expired: bool,
    fetch_calls: usize,
    acknowledge_calls: usize,
}

/// In-memory [`FleetApi`] for tests and offline development. Collections are
/// seeded directly; failure modes are toggled per scenario.
#[derive(Clone, Default)]
pub struct InMemoryApi {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ApiResult<std::sync::RwLockReadGuard<'_, InMemoryState>> {
        self.state
            .read()
            .map_err(|_| ApiError::Transport("state lock poisoned".to_string()))
    }

    fn write(&self) -> ApiResult<std::sync::RwLockWriteGuard<'_, InMemoryState>> {
        self.state
            .write()
            .map_err(|_| ApiError::Transport("state lock poisoned".to_string()))
    }

    pub fn add_user(&self, username: &str, password: &str, role: Role) -> User {
        let user = User {
            id: Uuid::now_v7().to_string(),
            username: username.to_string(),
            email: format!("{}@example.com", username),
            role,
            created_at: chrono::Utc::now(),
        };
        if let Ok(mut state) = self.state.write() {
            state
                .users
                .push((username.to_string(), password.to_string(), user.clone()));
        }
        user
    }

    pub fn set_vehicles(&self, vehicles: Vec<Vehicle>) {
        if let Ok(mut state) = self.state.write() {
            state.vehicles = vehicles;
        }
    }

    pub fn set_jobs(&self, jobs: Vec<Job>) {
        if let Ok(mut state) = self.state.write() {
            state.jobs = jobs;
        }
    }

    pub fn set_zones(&self, zones: Vec<Zone>) {
        if let Ok(mut state) = self.state.write() {
            state.zones = zones;
        }
    }

    pub fn set_alerts(&self, alerts: Vec<Alert>) {
        if let Ok(mut state) = self.state.write() {
            state.alerts = alerts;
        }
    }

    /// Makes every fetch fail with a transport error until turned off again.
    pub fn set_fail_fetches(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail_fetches = fail;
        }
    }

    /// Makes acknowledge calls fail with a 500 until turned off again.
    pub fn set_fail_acknowledge(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail_acknowledge = fail;
        }
    }

    /// Invalidates every issued token: all authenticated calls return
    /// `Unauthorized` from now on.
    pub fn expire_sessions(&self) {
        if let Ok(mut state) = self.state.write() {
            state.expired = true;
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.read().map(|s| s.fetch_calls).unwrap_or(0)
    }

    pub fn acknowledge_calls(&self) -> usize {
        self.read().map(|s| s.acknowledge_calls).unwrap_or(0)
    }

    fn check_token(state: &InMemoryState, token: &str) -> ApiResult<()> {
        if state.expired || !state.issued_tokens.iter().any(|t| t == token) {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }

    fn fetch<T: Clone>(
        &self,
        token: &str,
        select: impl FnOnce(&InMemoryState) -> &Vec<T>,
    ) -> ApiResult<Vec<T>> {
        let mut state = self.write()?;
        state.fetch_calls += 1;
        Self::check_token(&state, token)?;
        if state.fail_fetches {
            return Err(ApiError::Transport("simulated network failure".to_string()));
        }
        Ok(select(&state).clone())
    }
}

impl FleetApi for InMemoryApi {
    fn login(&self, username: &str, password: &str) -> ApiResult<AuthSession> {
        let mut state = self.write()?;
        let user = state
            .users
            .iter()
            .find(|(name, pass, _)| name == username && pass == password)
            .map(|(_, _, user)| user.clone())
            .ok_or(ApiError::Unauthorized)?;
        let token = format!("token-{}", Uuid::now_v7());
        state.issued_tokens.push(token.clone());
        Ok(AuthSession {
            access_token: token,
            token_type: "bearer".to_string(),
            user,
        })
    }

    fn fetch_vehicles(&self, token: &str) -> ApiResult<Vec<Vehicle>> {
        self.fetch(token, |s| &s.vehicles)
    }

    fn fetch_jobs(&self, token: &str) -> ApiResult<Vec<Job>> {
        self.fetch(token, |s| &s.jobs)
    }

    fn fetch_zones(&self, token: &str) -> ApiResult<Vec<Zone>> {
        self.fetch(token, |s| &s.zones)
    }

    fn fetch_alerts(&self, token: &str) -> ApiResult<Vec<Alert>> {
        self.fetch(token, |s| &s.alerts)
    }

    fn acknowledge_alert(&self, token: &str, alert_id: &str) -> ApiResult<()> {
        let mut state = self.write()?;
        state.acknowledge_calls += 1;
        Self::check_token(&state, token)?;
        if state.fail_acknowledge {
            return Err(ApiError::Status(500));
        }
        if let Some(alert) = state.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
        }
        Ok(())
    }

    fn analytics_on_time(&self, token: &str) -> ApiResult<OnTimeSummary> {
        let state = self.read()?;
        Self::check_token(&state, token)?;
        if state.fail_fetches {
            return Err(ApiError::Transport("simulated network failure".to_string()));
        }
        // The server-side aggregate allows a 15 minute arrival slack.
        let stats =
            crate::analytics::on_time_stats(&state.jobs, chrono::Duration::minutes(15));
        Ok(OnTimeSummary {
            on_time_percentage: stats.percentage,
            total_jobs: stats.delivered,
            on_time_jobs: stats.on_time,
        })
    }

    fn analytics_daily_deliveries(&self, token: &str) -> ApiResult<DailyDeliveryTotals> {
        let state = self.read()?;
        Self::check_token(&state, token)?;
        if state.fail_fetches {
            return Err(ApiError::Transport("simulated network failure".to_string()));
        }
        let today = chrono::Utc::now().date_naive();
        let mut totals = DailyDeliveryTotals::default();
        for day in crate::analytics::daily_deliveries(&state.jobs, today) {
            if day.count > 0 {
                totals.daily_deliveries.insert(day.date.to_string(), day.count);
            }
        }
        Ok(totals)
    }

    fn analytics_zone_delays(&self, token: &str) -> ApiResult<ZoneDelayReport> {
        let state = self.read()?;
        Self::check_token(&state, token)?;
        if state.fail_fetches {
            return Err(ApiError::Transport("simulated network failure".to_string()));
        }
        Ok(ZoneDelayReport {
            zones: state.zones.clone(),
        })
    }
}

struct PushState {
    current: Option<Sender<PushMessage>>,
    connects: usize,
    fail_connects: usize,
}

impl Default for PushState {
    fn default() -> Self {
        Self {
            current: None,
            connects: 0,
            fail_connects: 0,
        }
    }
}

/// In-memory [`PushChannel`]: each connect hands out a fresh channel and the
/// test drives the sending side. Dropping the connection simulates a
/// transport-level disconnect.
#[derive(Clone, Default)]
pub struct InMemoryPush {
    state: Arc<RwLock<PushState>>,
}

impl InMemoryPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a message over the current connection. Returns false when no
    /// connection is up.
    pub fn send(&self, message: PushMessage) -> bool {
        if let Ok(state) = self.state.read() {
            if let Some(tx) = &state.current {
                return tx.send(message).is_ok();
            }
        }
        false
    }

    /// Drops the current connection; the consumer sees the channel close.
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.state.write() {
            state.current = None;
        }
    }

    /// Makes the next `n` connect attempts fail, for backoff scenarios.
    pub fn fail_next_connects(&self, n: usize) {
        if let Ok(mut state) = self.state.write() {
            state.fail_connects = n;
        }
    }

    pub fn connects(&self) -> usize {
        self.state.read().map(|s| s.connects).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().map(|s| s.current.is_some()).unwrap_or(false)
    }
}

impl PushChannel for InMemoryPush {
    fn connect(&self) -> ApiResult<PushConnection> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ApiError::Transport("push state lock poisoned".to_string()))?;
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ApiError::Transport("simulated connect failure".to_string()));
        }
        let (tx, rx) = channel();
        state.current = Some(tx);
        Ok(PushConnection { messages: rx })
    }
}
