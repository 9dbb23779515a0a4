use std::collections::HashMap;
use thiserror::Error;
use vigil_core::activity::ActivityItem;
use vigil_core::schedule::Schedule;
use vigil_core::state::{
    EntityProfile, SettingKey, Settings, Snapshot, StoredConfig, MAX_TRACKED_ENTITIES,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("already tracking {0}")]
    Duplicate(String),
    #[error("tracked entity limit reached ({0})")]
    AtCapacity(usize),
}

/// Shared state owned by this peer. The leader is the sole writer; followers
/// only ever touch it through [`StateStore::apply_snapshot`], which replaces
/// everything wholesale.
#[derive(Debug, Default)]
pub struct StateStore {
    entities: Vec<String>,
    cursors: HashMap<String, String>,
    profiles: HashMap<String, EntityProfile>,
    items: HashMap<String, Vec<ActivityItem>>,
    settings: Settings,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: StoredConfig) -> Self {
        let mut entities = config.tracked_entities;
        entities.truncate(MAX_TRACKED_ENTITIES);
        Self {
            entities,
            cursors: config.cursors,
            profiles: HashMap::new(),
            items: HashMap::new(),
            settings: config.settings,
        }
    }

    pub fn to_config(&self) -> StoredConfig {
        StoredConfig {
            tracked_entities: self.entities.clone(),
            cursors: self.cursors.clone(),
            settings: self.settings,
        }
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn is_tracked(&self, entity: &str) -> bool {
        self.entities.iter().any(|e| e == entity)
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn set_setting(&mut self, key: SettingKey, value: bool) {
        self.settings.set(key, value);
    }

    pub fn cursor(&self, entity: &str) -> Option<&str> {
        self.cursors.get(entity).map(String::as_str)
    }

    pub fn items(&self, entity: &str) -> &[ActivityItem] {
        self.items.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn profile(&self, entity: &str) -> Option<&EntityProfile> {
        self.profiles.get(entity)
    }

    /// Appends a validated entity, preserving insertion order.
    pub fn add_entity(&mut self, entity: &str) -> Result<(), StoreError> {
        if self.is_tracked(entity) {
            return Err(StoreError::Duplicate(entity.to_string()));
        }
        if self.entities.len() >= MAX_TRACKED_ENTITIES {
            return Err(StoreError::AtCapacity(MAX_TRACKED_ENTITIES));
        }
        self.entities.push(entity.to_string());
        Ok(())
    }

    /// Removes an entity and every per-entity record tied to it.
    pub fn remove_entity(&mut self, entity: &str) -> bool {
        let before = self.entities.len();
        self.entities.retain(|e| e != entity);
        self.cursors.remove(entity);
        self.profiles.remove(entity);
        self.items.remove(entity);
        self.entities.len() != before
    }

    /// Records the result of a completed fetch cycle. The cursor is replaced
    /// only when the diff produced one, so it never regresses.
    pub fn record_cycle(
        &mut self,
        entity: &str,
        profile: EntityProfile,
        items: Option<Vec<ActivityItem>>,
        cursor: Option<String>,
    ) {
        self.profiles.insert(entity.to_string(), profile);
        if let Some(items) = items {
            self.items.insert(entity.to_string(), items);
        }
        if let Some(cursor) = cursor {
            self.cursors.insert(entity.to_string(), cursor);
        }
    }

    /// Projects the full shared state for broadcast.
    pub fn snapshot(&self, schedule: &Schedule) -> Snapshot {
        Snapshot {
            entities: self.entities.clone(),
            cursors: self.cursors.clone(),
            profiles: self.profiles.clone(),
            items: self.items.clone(),
            next_fetch_at: schedule.next_fetch_map(),
            multipliers: schedule.multiplier_map(),
            settings: self.settings,
        }
    }

    /// Follower path: total replacement, last snapshot wins, no merging.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot, schedule: &mut Schedule) {
        schedule.replace(&snapshot.multipliers, &snapshot.next_fetch_at);
        self.entities = snapshot.entities;
        self.cursors = snapshot.cursors;
        self.profiles = snapshot.profiles;
        self.items = snapshot.items;
        self.settings = snapshot.settings;
    }
}
