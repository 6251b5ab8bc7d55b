//! Read-only rollups over the current store snapshot. Everything here is a
//! pure function of the snapshot: nothing mutates the store, and nothing is
//! cached past the revision the snapshot was taken at. The backend exposes
//! matching aggregates over its longer-lived dataset; these local versions
//! exist so the UI can recompute instantly on every store change.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::model::{Job, JobStatus, Zone};
use crate::store::FleetSnapshot;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OnTimeStats {
    /// `on_time / delivered * 100`, rounded to two decimals. Defined as 0
    /// when nothing has been delivered so the UI never sees a NaN.
    pub percentage: f64,
    pub delivered: usize,
    pub on_time: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneDelaySummary {
    pub zone_id: String,
    pub name: String,
    pub delay_count: u32,
    pub high_delay: bool,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A delivered job is on-time when it arrived no later than its estimated
/// ETA plus `grace`. Delivered jobs without a recorded arrival count as
/// delivered but not on-time.
pub fn on_time_stats(jobs: &[Job], grace: Duration) -> OnTimeStats {
    let delivered: Vec<&Job> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Delivered)
        .collect();
    let on_time = delivered
        .iter()
        .filter(|job| match job.actual_eta {
            Some(actual) => actual <= job.estimated_eta + grace,
            None => false,
        })
        .count();
    let percentage = if delivered.is_empty() {
        0.0
    } else {
        round2(on_time as f64 / delivered.len() as f64 * 100.0)
    };
    OnTimeStats {
        percentage,
        delivered: delivered.len(),
        on_time,
    }
}

/// Delivered jobs grouped by calendar day of completion over the trailing
/// seven days ending at `today`, chronological. Days without deliveries are
/// present with count 0.
pub fn daily_deliveries(jobs: &[Job], today: NaiveDate) -> Vec<DailyCount> {
    let start = today - Duration::days(6);
    let mut counts: HashMap<NaiveDate, usize> = HashMap::new();
    for job in jobs {
        if job.status != JobStatus::Delivered {
            continue;
        }
        if let Some(completed) = job.completed_at {
            let day = completed.date_naive();
            if day >= start && day <= today {
                *counts.entry(day).or_default() += 1;
            }
        }
    }
    (0..7)
        .map(|offset| {
            let date = start + Duration::days(offset);
            DailyCount {
                date,
                count: counts.get(&date).copied().unwrap_or(0),
            }
        })
        .collect()
}

/// Passes through each zone's backend-computed delay count, sorted by name,
/// with the high-delay presentation flag attached. Delay counts are never
/// re-derived from job data here; the zone record is trusted.
pub fn zone_delays(zones: &[Zone]) -> Vec<ZoneDelaySummary> {
    let mut summaries: Vec<ZoneDelaySummary> = zones
        .iter()
        .map(|zone| ZoneDelaySummary {
            zone_id: zone.id.clone(),
            name: zone.name.clone(),
            delay_count: zone.delay_count,
            high_delay: zone.is_high_delay(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    summaries
}

/// Everything the dashboard's analytics widgets need, derived from one
/// snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FleetRollup {
    pub revision: u64,
    pub on_time: OnTimeStats,
    pub daily_deliveries: Vec<DailyCount>,
    pub zone_delays: Vec<ZoneDelaySummary>,
}

/// Memoizes the rollup per (revision, day): repeated reads between store
/// changes are free, and any revision advance recomputes from scratch.
pub struct AnalyticsView {
    grace: Duration,
    cache: Mutex<Option<(NaiveDate, FleetRollup)>>,
}

impl AnalyticsView {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            cache: Mutex::new(None),
        }
    }

    pub fn rollup(&self, snapshot: &FleetSnapshot, today: NaiveDate) -> FleetRollup {
        if let Ok(cache) = self.cache.lock() {
            if let Some((day, cached)) = &*cache {
                if *day == today && cached.revision == snapshot.revision {
                    return cached.clone();
                }
            }
        }
        let computed = FleetRollup {
            revision: snapshot.revision,
            on_time: on_time_stats(&snapshot.jobs, self.grace),
            daily_deliveries: daily_deliveries(&snapshot.jobs, today),
            zone_delays: zone_delays(&snapshot.zones),
        };
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((today, computed.clone()));
        }
        computed
    }
}
