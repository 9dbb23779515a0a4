use crate::bus::ChannelBus;
use crate::clock::{Clock, VisibilityProbe};
use crate::config::ConfigStore;
use crate::fetch::{ActivityFetcher, FetchError, FetchOutcome};
use crate::store::StateStore;
use chrono::Duration as ChronoDuration;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::activity::ActivityItem;
use vigil_core::detect::{diff_against_cursor, DedupMemory, DEFAULT_DEDUP_CAPACITY};
use vigil_core::elector::{Effect, LeaderElector, Role, ELECTION_TIMEOUT, RESIGN_RETRY_JITTER};
use vigil_core::schedule::{Schedule, MAX_SCHEDULE_JITTER_MS};
use vigil_core::state::{SettingKey, Snapshot, StoredConfig, MAX_TRACKED_ENTITIES};
use vigil_core::wire::{ConfigSync, EntityRef, Envelope, PeerMessage};

const EVENTS_CAPACITY: usize = 256;

/// Tunables for one peer. Defaults match the documented protocol values;
/// tests shrink the timers.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub election_timeout: Duration,
    pub resign_retry_jitter: Duration,
    pub tick_interval: Duration,
    pub max_schedule_jitter_ms: i64,
    pub dedup_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            election_timeout: ELECTION_TIMEOUT,
            resign_retry_jitter: RESIGN_RETRY_JITTER,
            tick_interval: Duration::from_secs(1),
            max_schedule_jitter_ms: MAX_SCHEDULE_JITTER_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Events surfaced to the local (out-of-scope) notification/UI layer, which
/// observes passively and is never called into synchronously.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    NewActivity(ActivityItem),
    LeadershipChanged(Role),
    EntityRejected { entity: String, reason: String },
}

/// Operations a local caller may request. On the leader they execute
/// directly; on a follower they are forwarded to the leader as `cmd_*`
/// messages and never applied locally.
#[derive(Debug)]
pub enum Command {
    AddEntity(String),
    RemoveEntity(String),
    RefreshAll,
    RefreshEntity(String),
    SetSetting(SettingKey, bool),
    Reelect,
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PeerEvent>,
    role: watch::Receiver<Role>,
    state: watch::Receiver<Snapshot>,
}

impl CoordinatorHandle {
    pub fn add_entity(&self, entity: impl Into<String>) {
        let _ = self.commands.send(Command::AddEntity(entity.into()));
    }

    pub fn remove_entity(&self, entity: impl Into<String>) {
        let _ = self.commands.send(Command::RemoveEntity(entity.into()));
    }

    pub fn refresh_all(&self) {
        let _ = self.commands.send(Command::RefreshAll);
    }

    pub fn refresh_entity(&self, entity: impl Into<String>) {
        let _ = self.commands.send(Command::RefreshEntity(entity.into()));
    }

    pub fn set_setting(&self, key: SettingKey, value: bool) {
        let _ = self.commands.send(Command::SetSetting(key, value));
    }

    /// Speculatively re-runs the probe protocol (e.g. on regaining
    /// foreground focus). This is the only recovery path for a leader that
    /// died without resigning.
    pub fn reelect(&self) {
        let _ = self.commands.send(Command::Reelect);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn role_changes(&self) -> watch::Receiver<Role> {
        self.role.clone()
    }

    pub fn state(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }
}

/// Everything a coordinator needs injected. No ambient globals: each peer
/// owns exactly one of these wirings.
pub struct CoordinatorSetup {
    pub peer_id: String,
    pub config: CoordinatorConfig,
    pub bus: Arc<dyn ChannelBus>,
    pub fetcher: Arc<dyn ActivityFetcher>,
    pub clock: Arc<dyn Clock>,
    pub visibility: Arc<dyn VisibilityProbe>,
    pub config_store: Option<ConfigStore>,
}

impl CoordinatorSetup {
    pub fn random_peer_id() -> String {
        format!("peer-{}", Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    /// Normal due-time cycle: full diff, notifications emitted.
    Scheduled,
    /// Forced/initial cycle: seeds an absent cursor, no notifications.
    Initial,
    /// Manually requested single-entity refresh: behaves like Scheduled.
    Manual,
    /// Membership validation for `cmd_add_user`: the entity must resolve
    /// before it is accepted; doubles as its first Initial cycle.
    Validate,
}

struct CycleDone {
    entity: String,
    mode: CycleMode,
    result: Result<FetchOutcome, FetchError>,
}

/// Top-level orchestrator for one peer: runs the tick loop, routes bus
/// messages, drives elections, and republishes state after every mutation.
pub struct Coordinator {
    core: PeerCore,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    cycles_rx: mpsc::UnboundedReceiver<CycleDone>,
}

impl Coordinator {
    pub fn new(setup: CoordinatorSetup) -> (Self, CoordinatorHandle) {
        let CoordinatorSetup {
            peer_id,
            config,
            bus,
            fetcher,
            clock,
            visibility,
            config_store,
        } = setup;

        let stored = match &config_store {
            Some(store) => match store.load() {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(event = "config_load_failed", error = %err);
                    StoredConfig::default()
                }
            },
            None => StoredConfig::default(),
        };
        let store = StateStore::from_config(stored);
        let schedule = Schedule::new();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (cycles_tx, cycles_rx) = mpsc::unbounded_channel();
        let (role_tx, role_rx) = watch::channel(Role::Follower);
        let (state_tx, state_rx) = watch::channel(store.snapshot(&schedule));
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);

        let handle = CoordinatorHandle {
            commands: commands_tx,
            events: events_tx.clone(),
            role: role_rx,
            state: state_rx,
        };

        let dedup = DedupMemory::new(config.dedup_capacity);
        let core = PeerCore {
            peer_id,
            config,
            bus,
            fetcher,
            clock,
            visibility,
            config_store,
            store,
            schedule,
            dedup,
            elector: LeaderElector::new(),
            role_tx,
            state_tx,
            events: events_tx,
            cycles_tx,
            election_deadline: None,
            retry_at: None,
            in_flight: None,
            backlog: VecDeque::new(),
        };

        (
            Self {
                core,
                commands_rx,
                cycles_rx,
            },
            handle,
        )
    }

    /// Runs until the shutdown watch flips to true (or every handle and the
    /// bus are gone). Resigns leadership on the way out, best effort.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Coordinator {
            mut core,
            mut commands_rx,
            mut cycles_rx,
        } = self;

        info!(event = "peer_start", peer_id = %core.peer_id);
        let mut bus_rx = core.bus.subscribe();
        let mut tick = time::interval(core.config.tick_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        let effects = core.elector.start();
        core.apply_effects(effects);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => core.on_tick(),
                received = bus_rx.recv() => match received {
                    Ok(envelope) => core.on_envelope(envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "bus_lagged", peer_id = %core.peer_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = deadline_sleep(core.election_deadline) => {
                    core.election_deadline = None;
                    let effects = core.elector.on_deadline();
                    core.apply_effects(effects);
                }
                _ = deadline_sleep(core.retry_at) => {
                    core.retry_at = None;
                    let effects = core.elector.start();
                    core.apply_effects(effects);
                }
                Some(done) = cycles_rx.recv() => core.on_cycle_done(done),
                Some(command) = commands_rx.recv() => core.on_command(command),
            }
        }

        let effects = core.elector.resign();
        core.apply_effects(effects);
        info!(event = "peer_stop", peer_id = %core.peer_id);
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

struct PeerCore {
    peer_id: String,
    config: CoordinatorConfig,
    bus: Arc<dyn ChannelBus>,
    fetcher: Arc<dyn ActivityFetcher>,
    clock: Arc<dyn Clock>,
    visibility: Arc<dyn VisibilityProbe>,
    config_store: Option<ConfigStore>,
    store: StateStore,
    schedule: Schedule,
    dedup: DedupMemory,
    elector: LeaderElector,
    role_tx: watch::Sender<Role>,
    state_tx: watch::Sender<Snapshot>,
    events: broadcast::Sender<PeerEvent>,
    cycles_tx: mpsc::UnboundedSender<CycleDone>,
    election_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    in_flight: Option<String>,
    backlog: VecDeque<(String, CycleMode)>,
}

impl PeerCore {
    fn on_tick(&mut self) {
        if !self.elector.is_leader() || self.in_flight.is_some() {
            return;
        }
        if self.start_backlogged_cycle() {
            return;
        }
        let now = self.clock.now();
        let entities = self.store.entities().to_vec();
        if let Some(entity) = self.schedule.most_overdue(&entities, now) {
            self.start_cycle(entity, CycleMode::Scheduled);
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        if envelope.peer_id == self.peer_id {
            return;
        }
        match envelope.msg {
            msg @ (PeerMessage::LeaderCheck
            | PeerMessage::LeaderHere
            | PeerMessage::LeaderTakeover
            | PeerMessage::LeaderResign) => {
                let effects = self.elector.on_message(&msg);
                self.apply_effects(effects);
            }
            PeerMessage::DataRequest => {
                if self.elector.is_leader() {
                    self.publish_snapshot();
                }
            }
            PeerMessage::DataUpdate(snapshot) => {
                if !self.elector.is_leader() {
                    self.store.apply_snapshot(snapshot, &mut self.schedule);
                    self.state_tx
                        .send_replace(self.store.snapshot(&self.schedule));
                    debug!(
                        event = "snapshot_applied",
                        peer_id = %self.peer_id,
                        from = %envelope.peer_id
                    );
                }
            }
            PeerMessage::NewAction(item) => {
                // the leader already emitted this locally when it diffed
                if !self.elector.is_leader() && self.dedup.insert(item.unique_id()) {
                    self.emit(PeerEvent::NewActivity(item));
                }
            }
            PeerMessage::CmdRefreshAll => {
                if self.elector.is_leader() {
                    self.enqueue_refresh_all();
                }
            }
            PeerMessage::CmdRefreshUser(EntityRef { entity }) => {
                if self.elector.is_leader() {
                    self.enqueue_refresh_one(entity);
                }
            }
            PeerMessage::CmdConfigSync(ConfigSync { key, value }) => {
                // settings apply everywhere, leader and follower alike
                self.store.set_setting(key, value);
                self.persist();
                self.state_tx
                    .send_replace(self.store.snapshot(&self.schedule));
            }
            PeerMessage::CmdAddUser(EntityRef { entity }) => {
                if self.elector.is_leader() {
                    self.begin_add(entity);
                }
            }
            PeerMessage::CmdRemoveUser(EntityRef { entity }) => {
                if self.elector.is_leader() {
                    self.apply_remove(&entity);
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        let leader = self.elector.is_leader();
        match command {
            Command::AddEntity(entity) => {
                if leader {
                    self.begin_add(entity);
                } else {
                    self.publish(PeerMessage::CmdAddUser(EntityRef::new(entity)));
                }
            }
            Command::RemoveEntity(entity) => {
                if leader {
                    self.apply_remove(&entity);
                } else {
                    self.publish(PeerMessage::CmdRemoveUser(EntityRef::new(entity)));
                }
            }
            Command::RefreshAll => {
                if leader {
                    self.enqueue_refresh_all();
                } else {
                    self.publish(PeerMessage::CmdRefreshAll);
                }
            }
            Command::RefreshEntity(entity) => {
                if leader {
                    self.enqueue_refresh_one(entity);
                } else {
                    self.publish(PeerMessage::CmdRefreshUser(EntityRef::new(entity)));
                }
            }
            Command::SetSetting(key, value) => {
                self.store.set_setting(key, value);
                self.persist();
                self.state_tx
                    .send_replace(self.store.snapshot(&self.schedule));
                self.publish(PeerMessage::CmdConfigSync(ConfigSync { key, value }));
            }
            Command::Reelect => {
                let effects = self.elector.start();
                self.apply_effects(effects);
            }
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(msg) => self.publish(msg),
                Effect::ArmDeadline(_) => {
                    self.election_deadline =
                        Some(Instant::now() + self.config.election_timeout);
                }
                Effect::CancelDeadline => self.election_deadline = None,
                Effect::ScheduleRetry => {
                    let max_ms = self.config.resign_retry_jitter.as_millis().max(1) as u64;
                    let delay = Duration::from_millis(rand::rng().random_range(0..max_ms));
                    self.retry_at = Some(Instant::now() + delay);
                }
                Effect::Promoted => {
                    info!(event = "leader_promoted", peer_id = %self.peer_id);
                    self.role_tx.send_replace(Role::Leader);
                    self.emit(PeerEvent::LeadershipChanged(Role::Leader));
                    if self.store.entities().is_empty() {
                        // promoted with nothing cached: ask the group in
                        // case a demoting leader still answers
                        self.publish(PeerMessage::DataRequest);
                    }
                    self.enqueue_refresh_all();
                }
                Effect::Demoted { republish } => {
                    info!(event = "leader_demoted", peer_id = %self.peer_id);
                    self.role_tx.send_replace(Role::Follower);
                    self.emit(PeerEvent::LeadershipChanged(Role::Follower));
                    self.backlog.clear();
                    if republish {
                        self.publish_snapshot();
                    }
                }
                Effect::RequestSnapshot => self.publish(PeerMessage::DataRequest),
            }
        }
    }

    fn begin_add(&mut self, entity: String) {
        if self.store.is_tracked(&entity) {
            self.reject_entity(entity, "already tracked");
            return;
        }
        if self.store.entities().len() >= MAX_TRACKED_ENTITIES {
            self.reject_entity(entity, "tracked entity limit reached");
            return;
        }
        if self.in_flight.is_some() {
            self.backlog.push_back((entity, CycleMode::Validate));
        } else {
            self.start_cycle(entity, CycleMode::Validate);
        }
    }

    fn reject_entity(&mut self, entity: String, reason: &str) {
        warn!(event = "entity_rejected", entity = %entity, reason = reason);
        self.emit(PeerEvent::EntityRejected {
            entity,
            reason: reason.to_string(),
        });
    }

    fn apply_remove(&mut self, entity: &str) {
        if self.store.remove_entity(entity) {
            self.schedule.remove(entity);
            self.backlog.retain(|(queued, _)| queued != entity);
            info!(event = "entity_removed", entity = %entity);
            self.persist();
            self.publish_snapshot();
        }
    }

    fn enqueue_refresh_all(&mut self) {
        for entity in self.store.entities().to_vec() {
            if !self.backlog.iter().any(|(queued, _)| queued == &entity) {
                self.backlog.push_back((entity, CycleMode::Initial));
            }
        }
        if self.in_flight.is_none() {
            self.start_backlogged_cycle();
        }
    }

    fn enqueue_refresh_one(&mut self, entity: String) {
        if !self.store.is_tracked(&entity) {
            return;
        }
        self.backlog.push_back((entity, CycleMode::Manual));
        if self.in_flight.is_none() {
            self.start_backlogged_cycle();
        }
    }

    fn start_backlogged_cycle(&mut self) -> bool {
        while let Some((entity, mode)) = self.backlog.pop_front() {
            if mode != CycleMode::Validate && !self.store.is_tracked(&entity) {
                continue;
            }
            self.start_cycle(entity, mode);
            return true;
        }
        false
    }

    fn start_cycle(&mut self, entity: String, mode: CycleMode) {
        debug!(event = "cycle_start", entity = %entity, mode = ?mode);
        self.in_flight = Some(entity.clone());
        let fetcher = self.fetcher.clone();
        let done_tx = self.cycles_tx.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch(&entity).await;
            let _ = done_tx.send(CycleDone {
                entity,
                mode,
                result,
            });
        });
    }

    fn on_cycle_done(&mut self, done: CycleDone) {
        self.in_flight = None;
        // leadership may have changed while the fetch was in flight; a
        // demoted peer must not mutate or publish from a stale result
        if !self.elector.is_leader() {
            debug!(event = "stale_cycle_discarded", entity = %done.entity);
            return;
        }
        match done.mode {
            CycleMode::Validate => self.finish_validation(done),
            _ => self.finish_cycle(done),
        }
        if self.in_flight.is_none() {
            self.start_backlogged_cycle();
        }
    }

    fn finish_validation(&mut self, done: CycleDone) {
        let entity = done.entity;
        match done.result {
            Ok(outcome) => {
                if let Err(err) = self.store.add_entity(&entity) {
                    self.reject_entity(entity, &err.to_string());
                    return;
                }
                info!(event = "entity_added", entity = %entity);
                self.apply_outcome(&entity, CycleMode::Initial, outcome);
                self.reschedule(&entity);
                self.persist();
                self.publish_snapshot();
            }
            Err(err) => self.reject_entity(entity, &err.to_string()),
        }
    }

    fn finish_cycle(&mut self, done: CycleDone) {
        let entity = done.entity;
        if !self.store.is_tracked(&entity) {
            // removed while the fetch was in flight
            return;
        }
        match done.result {
            Ok(outcome) => {
                let advanced = self.apply_outcome(&entity, done.mode, outcome);
                if advanced {
                    self.persist();
                }
            }
            Err(err) => {
                // isolated per entity: log, reschedule, move on
                warn!(event = "fetch_failed", entity = %entity, error = %err);
            }
        }
        self.reschedule(&entity);
        self.publish_snapshot();
    }

    /// Applies a successful fetch outcome; returns whether the cursor moved.
    fn apply_outcome(&mut self, entity: &str, mode: CycleMode, outcome: FetchOutcome) -> bool {
        let now = self.clock.now();
        let low_priority = self.visibility.low_priority();
        match outcome {
            FetchOutcome::Unchanged { profile } => {
                self.schedule
                    .observe_profile(entity, &profile, now, low_priority);
                self.store.record_cycle(entity, profile, None, None);
                debug!(event = "entity_dormant", entity = %entity);
                false
            }
            FetchOutcome::Items { profile, items } => {
                self.schedule
                    .observe_profile(entity, &profile, now, low_priority);
                let stored = self.store.cursor(entity).map(str::to_string);
                let cursor = match mode {
                    CycleMode::Initial | CycleMode::Validate => {
                        // forced cycles seed an absent cursor without
                        // emitting: backlog is not news
                        if stored.is_none() {
                            items.first().map(ActivityItem::unique_id)
                        } else {
                            None
                        }
                    }
                    CycleMode::Scheduled | CycleMode::Manual => {
                        let advance = diff_against_cursor(&items, stored.as_deref());
                        if !advance.fresh.is_empty() {
                            info!(
                                event = "new_activity",
                                entity = %entity,
                                count = advance.fresh.len()
                            );
                        }
                        for item in &advance.fresh {
                            if self.dedup.insert(item.unique_id()) {
                                self.publish(PeerMessage::NewAction(item.clone()));
                                self.emit(PeerEvent::NewActivity(item.clone()));
                            }
                        }
                        advance.cursor
                    }
                };
                let advanced = match &cursor {
                    Some(new_cursor) => stored.as_deref() != Some(new_cursor.as_str()),
                    None => false,
                };
                self.store.record_cycle(entity, profile, Some(items), cursor);
                advanced
            }
        }
    }

    fn reschedule(&mut self, entity: &str) {
        let now = self.clock.now();
        let max_ms = self.config.max_schedule_jitter_ms.max(1);
        let jitter = ChronoDuration::milliseconds(rand::rng().random_range(0..max_ms));
        self.schedule.reschedule(entity, now, jitter);
    }

    fn publish_snapshot(&mut self) {
        let snapshot = self.store.snapshot(&self.schedule);
        self.state_tx.send_replace(snapshot.clone());
        self.publish(PeerMessage::DataUpdate(snapshot));
    }

    fn publish(&self, msg: PeerMessage) {
        self.bus
            .publish(Envelope::new(self.peer_id.as_str(), msg, self.clock.now()));
    }

    fn emit(&self, event: PeerEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn persist(&self) {
        if let Some(config_store) = &self.config_store {
            if let Err(err) = config_store.save(&self.store.to_config()) {
                warn!(event = "config_save_failed", error = %err);
            }
        }
    }
}
