use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Partial-record fields carried by a patch, keyed by field name. The wire
/// format is JSON end to end, so patches stay as JSON objects until they are
/// merged into a typed record.
pub type FieldMap = Map<String, Value>;

/// Zones with more delay incidents than this are presented as "high-delay".
/// A presentation threshold, not a stored property.
pub const HIGH_DELAY_THRESHOLD: u32 = 10;

/// The entity collections held by the store, one keyed map each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Vehicle,
    Job,
    Zone,
    Alert,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Vehicle,
        EntityKind::Job,
        EntityKind::Zone,
        EntityKind::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vehicle => "vehicle",
            EntityKind::Job => "job",
            EntityKind::Zone => "zone",
            EntityKind::Alert => "alert",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for records the store can hold. The backend owns all field values;
/// the client never computes them locally.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Called after a patch merge with the record before and after. Used for
    /// data-quality logging only, never to reject backend-owned data.
    fn data_quality_check(_old: &Self, _new: &Self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleStatus {
    Idle,
    EnRoute,
    Maintenance,
}

/// Job statuses in lifecycle order. The backend only ever moves a job
/// forward, so the derived ordering doubles as a regression check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InTransit,
    Delivered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Delay,
    Maintenance,
    Overload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Driver,
    Viewer,
}

impl Role {
    /// Presentation hint only. The backend re-validates every mutation, so
    /// this must never be used as an enforcement point.
    pub fn can_acknowledge(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A pickup or delivery site: street address plus map coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteLocation {
    pub address: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub plate_number: String,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    pub status: VehicleStatus,
    pub location: GeoPoint,
    pub last_updated: DateTime<Utc>,
    pub vehicle_type: String,
    pub load_capacity: f64,
    pub current_load: f64,
}

impl Record for Vehicle {
    const KIND: EntityKind = EntityKind::Vehicle;

    fn id(&self) -> &str {
        &self.id
    }

    fn data_quality_check(_old: &Self, new: &Self) {
        if new.current_load > new.load_capacity {
            log::warn!(
                "vehicle {} reports load {} over capacity {}",
                new.id,
                new.current_load,
                new.load_capacity
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_number: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
    pub status: JobStatus,
    pub zone: String,
    pub pickup_location: SiteLocation,
    pub delivery_location: SiteLocation,
    pub load_type: String,
    pub load_weight: f64,
    pub estimated_eta: DateTime<Utc>,
    #[serde(default)]
    pub actual_eta: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Record for Job {
    const KIND: EntityKind = EntityKind::Job;

    fn id(&self) -> &str {
        &self.id
    }

    fn data_quality_check(old: &Self, new: &Self) {
        if new.status < old.status {
            log::debug!(
                "job {} status went backwards ({:?} -> {:?}); the backend owns transitions",
                new.id,
                old.status,
                new.status
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub coordinates: GeoPoint,
    pub delay_count: u32,
}

impl Zone {
    pub fn is_high_delay(&self) -> bool {
        self.delay_count > HIGH_DELAY_THRESHOLD
    }
}

impl Record for Zone {
    const KIND: EntityKind = EntityKind::Zone;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Record for Alert {
    const KIND: EntityKind = EntityKind::Alert;

    fn id(&self) -> &str {
        &self.id
    }

    fn data_quality_check(old: &Self, new: &Self) {
        if old.acknowledged && !new.acknowledged {
            log::debug!("alert {} flipped back to unacknowledged", new.id);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Login result: a bearer token plus the role-tagged user record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub token_type: String,
    pub user: User,
}

/// A partial update for one record, normalized from the push channel. The
/// version is a logical clock: patches are ordered by it, not by arrival.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityPatch {
    pub kind: EntityKind,
    pub id: String,
    pub fields: FieldMap,
    pub version: u64,
}

/// Typed messages delivered over the push channel. A backend that does not
/// version its pushes leaves `version` at 0, which never overrides
/// snapshot-loaded state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    VehicleUpdate {
        data: FieldMap,
        #[serde(default)]
        version: u64,
    },
    JobUpdate {
        data: FieldMap,
        #[serde(default)]
        version: u64,
    },
    ZoneUpdate {
        data: FieldMap,
        #[serde(default)]
        version: u64,
    },
    AlertUpdate {
        data: FieldMap,
        #[serde(default)]
        version: u64,
    },
    AlertAcknowledged {
        alert_id: String,
        #[serde(default)]
        version: u64,
    },
}

impl PushMessage {
    /// Normalizes the message into an [`EntityPatch`]. Returns None when the
    /// payload carries no usable record id.
    pub fn into_patch(self) -> Option<EntityPatch> {
        fn from_data(kind: EntityKind, data: FieldMap, version: u64) -> Option<EntityPatch> {
            let id = data.get("id").and_then(Value::as_str)?.to_string();
            Some(EntityPatch {
                kind,
                id,
                fields: data,
                version,
            })
        }

        match self {
            PushMessage::VehicleUpdate { data, version } => {
                from_data(EntityKind::Vehicle, data, version)
            }
            PushMessage::JobUpdate { data, version } => from_data(EntityKind::Job, data, version),
            PushMessage::ZoneUpdate { data, version } => from_data(EntityKind::Zone, data, version),
            PushMessage::AlertUpdate { data, version } => {
                from_data(EntityKind::Alert, data, version)
            }
            PushMessage::AlertAcknowledged { alert_id, version } => {
                let mut fields = FieldMap::new();
                fields.insert("acknowledged".to_string(), Value::Bool(true));
                Some(EntityPatch {
                    kind: EntityKind::Alert,
                    id: alert_id,
                    fields,
                    version,
                })
            }
        }
    }
}
