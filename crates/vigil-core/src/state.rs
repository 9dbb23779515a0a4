use crate::activity::ActivityItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hard cap on tracked entities; the leader rejects additions past this.
pub const MAX_TRACKED_ENTITIES: usize = 5;

/// Recency signals for one entity, refreshed on every fetch cycle. Used only
/// to compute scheduling intervals.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityProfile {
    #[serde(default)]
    pub last_posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// User-facing toggles, synced across peers via `cmd_config_sync`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub system_notify: bool,
    #[serde(default = "default_enabled")]
    pub ticker: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_notify: true,
            ticker: true,
        }
    }
}

/// Which setting a `cmd_config_sync` message toggles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    SystemNotify,
    Ticker,
}

impl Settings {
    pub fn set(&mut self, key: SettingKey, value: bool) {
        match key {
            SettingKey::SystemNotify => self.system_notify = value,
            SettingKey::Ticker => self.ticker = value,
        }
    }

    pub fn get(&self, key: SettingKey) -> bool {
        match key {
            SettingKey::SystemNotify => self.system_notify,
            SettingKey::Ticker => self.ticker,
        }
    }
}

/// Full projection of shared state, broadcast wholesale by the leader.
/// Followers replace their mirror with it; no field-level merging.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub entities: Vec<String>,
    #[serde(default)]
    pub cursors: HashMap<String, String>,
    #[serde(default)]
    pub profiles: HashMap<String, EntityProfile>,
    #[serde(default)]
    pub items: HashMap<String, Vec<ActivityItem>>,
    #[serde(default)]
    pub next_fetch_at: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub multipliers: HashMap<String, f64>,
    #[serde(default)]
    pub settings: Settings,
}

/// On-disk schema, deliberately minimal: enough to re-hydrate tracking and
/// cursors after a restart. Everything else is rebuilt by fetching.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoredConfig {
    #[serde(default)]
    pub tracked_entities: Vec<String>,
    #[serde(default)]
    pub cursors: HashMap<String, String>,
    #[serde(default)]
    pub settings: Settings,
}
