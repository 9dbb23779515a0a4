use crate::state::EntityProfile;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Base polling interval before the recency multiplier is applied.
pub const BASE_INTERVAL_MS: i64 = 60 * 1000;

/// Upper bound for the per-cycle scheduling jitter.
pub const MAX_SCHEDULE_JITTER_MS: i64 = 10_000;

/// Multiplier applied to entities with no observed activity, or activity
/// older than the last tier cutoff.
pub const DORMANT_MULTIPLIER: f64 = 20.0;

/// Maps recency of activity onto a polling-interval multiplier. Entities
/// seen within minutes poll at the base interval; ones quiet for hours decay
/// to the dormant tier. Low-priority mode (surface not actively viewed)
/// doubles every tier.
pub fn interval_multiplier(
    last_seen_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    low_priority: bool,
) -> f64 {
    let scale = if low_priority { 2.0 } else { 1.0 };
    let Some(seen) = last_seen_at else {
        return DORMANT_MULTIPLIER * scale;
    };
    let minutes = (now - seen).num_seconds() as f64 / 60.0;
    let tier = if minutes < 2.0 {
        1.0
    } else if minutes < 10.0 {
        1.5
    } else if minutes < 60.0 {
        4.0
    } else if minutes < 120.0 {
        5.0
    } else {
        DORMANT_MULTIPLIER
    };
    tier * scale
}

/// Per-entity scheduling state.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerEntry {
    pub multiplier: f64,
    pub next_fetch_at: Option<DateTime<Utc>>,
}

impl Default for SchedulerEntry {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            next_fetch_at: None,
        }
    }
}

/// Tracks when each entity is next due. Entities never scheduled are due
/// immediately; rescheduling happens after every fetch attempt regardless of
/// outcome, so failures decay into infrequent retries instead of hot loops.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: HashMap<String, SchedulerEntry>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the multiplier for one entity from its profile.
    pub fn observe_profile(
        &mut self,
        entity: &str,
        profile: &EntityProfile,
        now: DateTime<Utc>,
        low_priority: bool,
    ) {
        let multiplier = interval_multiplier(profile.last_seen_at, now, low_priority);
        self.entries.entry(entity.to_string()).or_default().multiplier = multiplier;
    }

    /// Interval for one full cycle of the entity at its current multiplier.
    pub fn cycle_duration(&self, entity: &str) -> Duration {
        let multiplier = self
            .entries
            .get(entity)
            .map(|entry| entry.multiplier)
            .unwrap_or(1.0);
        Duration::milliseconds((BASE_INTERVAL_MS as f64 * multiplier) as i64)
    }

    /// Schedules the entity's next fetch: `now + base*multiplier + jitter`.
    pub fn reschedule(&mut self, entity: &str, now: DateTime<Utc>, jitter: Duration) {
        let next = now + self.cycle_duration(entity) + jitter;
        self.entries
            .entry(entity.to_string())
            .or_default()
            .next_fetch_at = Some(next);
    }

    /// Picks the single most-overdue entity among those due at `now`.
    /// Never-scheduled entities are due immediately and sort first.
    pub fn most_overdue(&self, entities: &[String], now: DateTime<Utc>) -> Option<String> {
        entities
            .iter()
            .filter_map(|entity| {
                match self.entries.get(entity).and_then(|e| e.next_fetch_at) {
                    None => Some((entity, None)),
                    Some(at) if at <= now => Some((entity, Some(at))),
                    Some(_) => None,
                }
            })
            .min_by_key(|(_, at)| *at)
            .map(|(entity, _)| entity.clone())
    }

    pub fn remove(&mut self, entity: &str) {
        self.entries.remove(entity);
    }

    pub fn multiplier(&self, entity: &str) -> Option<f64> {
        self.entries.get(entity).map(|entry| entry.multiplier)
    }

    pub fn next_fetch_at(&self, entity: &str) -> Option<DateTime<Utc>> {
        self.entries.get(entity).and_then(|entry| entry.next_fetch_at)
    }

    /// Snapshot projections of the per-entity scheduling maps.
    pub fn next_fetch_map(&self) -> HashMap<String, DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|(entity, entry)| entry.next_fetch_at.map(|at| (entity.clone(), at)))
            .collect()
    }

    pub fn multiplier_map(&self) -> HashMap<String, f64> {
        self.entries
            .iter()
            .map(|(entity, entry)| (entity.clone(), entry.multiplier))
            .collect()
    }

    /// Wholesale replacement from a received snapshot (follower mirror).
    pub fn replace(
        &mut self,
        multipliers: &HashMap<String, f64>,
        next_fetch_at: &HashMap<String, DateTime<Utc>>,
    ) {
        self.entries.clear();
        for (entity, multiplier) in multipliers {
            self.entries.insert(
                entity.clone(),
                SchedulerEntry {
                    multiplier: *multiplier,
                    next_fetch_at: next_fetch_at.get(entity).copied(),
                },
            );
        }
        for (entity, at) in next_fetch_at {
            self.entries
                .entry(entity.clone())
                .or_default()
                .next_fetch_at = Some(*at);
        }
    }
}
