//! Multi-peer coordination scenarios over an in-process loopback group,
//! driven on paused time with scripted fetchers so election races and fetch
//! cycles are deterministic.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use vigil_core::activity::{ActionKind, ActivityItem, ActorRef};
use vigil_core::elector::Role;
use vigil_core::state::{EntityProfile, SettingKey, Snapshot};
use vigil_core::wire::{Envelope, PeerMessage};
use vigil_peer::coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorSetup};
use vigil_peer::{
    ActivityFetcher, ChannelBus, Clock, FetchError, FetchOutcome, LoopbackGroup, PeerEvent,
    VisibilityFlag,
};

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

#[derive(Clone)]
struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(anchor())),
        }
    }

    fn advance(&self, delta: ChronoDuration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += delta;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Fetcher returning pre-scripted outcomes per entity, optionally gated so a
/// fetch can be held in flight while the test changes leadership.
#[derive(Default)]
struct ScriptFetcher {
    responses: Mutex<HashMap<String, VecDeque<Result<FetchOutcome, FetchError>>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptFetcher {
    fn push(&self, entity: &str, outcome: Result<FetchOutcome, FetchError>) {
        self.responses
            .lock()
            .expect("responses lock")
            .entry(entity.to_string())
            .or_default()
            .push_back(outcome);
    }

    fn gate(&self, entity: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .expect("gates lock")
            .insert(entity.to_string(), notify.clone());
        notify
    }

    fn call_count(&self, entity: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|called| called.as_str() == entity)
            .count()
    }
}

#[async_trait]
impl ActivityFetcher for ScriptFetcher {
    async fn fetch(&self, entity: &str) -> Result<FetchOutcome, FetchError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(entity.to_string());
        let gate = self
            .gates
            .lock()
            .expect("gates lock")
            .remove(entity);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .expect("responses lock")
            .get_mut(entity)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(FetchError::NotFound(entity.to_string())))
    }
}

fn item(id: u64) -> ActivityItem {
    ActivityItem {
        id: Some(id),
        created_at: anchor() + ChronoDuration::minutes(id as i64),
        kind: ActionKind::Reply,
        actor: ActorRef::new("alice"),
        acting: None,
        topic_id: None,
        post_number: None,
        title: None,
        excerpt: None,
        category_id: None,
    }
}

fn items_outcome(clock: &TestClock, ids: &[u64]) -> FetchOutcome {
    FetchOutcome::Items {
        profile: EntityProfile {
            last_posted_at: Some(clock.now()),
            last_seen_at: Some(clock.now()),
        },
        items: ids.iter().map(|id| item(*id)).collect(),
    }
}

struct Peer {
    handle: CoordinatorHandle,
    shutdown: watch::Sender<bool>,
    fetcher: Arc<ScriptFetcher>,
    clock: TestClock,
}

fn spawn_peer(group: &LoopbackGroup, peer_id: &str) -> Peer {
    let fetcher = Arc::new(ScriptFetcher::default());
    let clock = TestClock::new();
    let (coordinator, handle) = Coordinator::new(CoordinatorSetup {
        peer_id: peer_id.to_string(),
        config: CoordinatorConfig::default(),
        bus: Arc::new(group.join()),
        fetcher: fetcher.clone(),
        clock: Arc::new(clock.clone()),
        visibility: Arc::new(VisibilityFlag::new(false)),
        config_store: None,
    });
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(coordinator.run(shutdown_rx));
    Peer {
        handle,
        shutdown,
        fetcher,
        clock,
    }
}

async fn wait_role(handle: &CoordinatorHandle, wanted: Role) {
    let mut roles = handle.role_changes();
    timeout(Duration::from_secs(10), async {
        loop {
            if *roles.borrow() == wanted {
                return;
            }
            roles.changed().await.expect("role channel open");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer never reached role {wanted}"));
}

async fn wait_state(handle: &CoordinatorHandle, what: &str, pred: impl Fn(&Snapshot) -> bool) {
    let mut states = handle.state_changes();
    timeout(Duration::from_secs(10), async {
        loop {
            if pred(&states.borrow()) {
                return;
            }
            states.changed().await.expect("state channel open");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never satisfied: {what}"));
}

async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn solo_peer_promotes_when_channel_is_silent() {
    let group = LoopbackGroup::new();
    let peer = spawn_peer(&group, "peer-a");
    assert_eq!(peer.handle.role(), Role::Follower);
    wait_role(&peer.handle, Role::Leader).await;
}

#[tokio::test(start_paused = true)]
async fn near_simultaneous_starts_settle_on_one_leader() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    sleep(Duration::from_millis(50)).await;
    let peer_b = spawn_peer(&group, "peer-b");

    sleep(Duration::from_millis(300)).await;
    settle().await;

    let leaders = [&peer_a, &peer_b]
        .iter()
        .filter(|peer| peer.handle.role() == Role::Leader)
        .count();
    assert_eq!(leaders, 1, "exactly one leader after the race settles");
}

#[tokio::test(start_paused = true)]
async fn late_joiner_defers_to_existing_leader() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;
    settle().await;

    assert_eq!(peer_a.handle.role(), Role::Leader);
    assert_eq!(peer_b.handle.role(), Role::Follower);
}

#[tokio::test(start_paused = true)]
async fn resign_hands_leadership_to_a_follower() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;
    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;
    assert_eq!(peer_b.handle.role(), Role::Follower);

    peer_a.shutdown.send(true).expect("signal shutdown");
    // resign jitter (<=300ms) + probe timeout (200ms)
    wait_role(&peer_b.handle, Role::Leader).await;
}

#[tokio::test(start_paused = true)]
async fn leader_yields_to_foreign_takeover() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    let outsider = group.join();
    outsider.publish(Envelope::new(
        "peer-x",
        PeerMessage::LeaderTakeover,
        anchor(),
    ));

    wait_role(&peer_a.handle, Role::Follower).await;
}

#[tokio::test(start_paused = true)]
async fn validated_add_seeds_cursor_and_replicates() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;
    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_b.handle.add_entity("alice");

    wait_state(&peer_a.handle, "leader tracks alice", |snapshot| {
        snapshot.entities == ["alice"] && snapshot.cursors.get("alice").map(String::as_str) == Some("3")
    })
    .await;
    wait_state(&peer_b.handle, "follower mirrors alice", |snapshot| {
        snapshot.entities == ["alice"] && snapshot.cursors.get("alice").map(String::as_str) == Some("3")
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn rejected_add_does_not_change_membership() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    let mut events = peer_a.handle.subscribe_events();
    // no scripted response: the fetcher reports the entity as unresolvable
    peer_a.handle.add_entity("ghost");

    let rejected = timeout(Duration::from_secs(10), async {
        loop {
            if let PeerEvent::EntityRejected { entity, .. } =
                events.recv().await.expect("events open")
            {
                return entity;
            }
        }
    })
    .await
    .expect("rejection event");
    assert_eq!(rejected, "ghost");
    assert!(peer_a.handle.state().entities.is_empty());
}

#[tokio::test(start_paused = true)]
async fn new_items_notify_every_peer_exactly_once() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;
    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_a.handle, "cursor seeded", |snapshot| {
        snapshot.cursors.get("alice").map(String::as_str) == Some("3")
    })
    .await;

    let mut events_a = peer_a.handle.subscribe_events();
    let mut events_b = peer_b.handle.subscribe_events();

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[5, 4, 3])));
    peer_a.handle.refresh_entity("alice");

    wait_state(&peer_a.handle, "cursor advanced", |snapshot| {
        snapshot.cursors.get("alice").map(String::as_str) == Some("5")
    })
    .await;

    let mut seen_a = Vec::new();
    let mut seen_b = Vec::new();
    settle().await;
    while let Ok(event) = events_a.try_recv() {
        if let PeerEvent::NewActivity(item) = event {
            seen_a.push(item.unique_id());
        }
    }
    while let Ok(event) = events_b.try_recv() {
        if let PeerEvent::NewActivity(item) = event {
            seen_b.push(item.unique_id());
        }
    }
    // chronological order, oldest first
    assert_eq!(seen_a, ["4", "5"]);
    assert_eq!(seen_b, ["4", "5"]);

    // replaying the identical window emits nothing anywhere
    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[5, 4, 3])));
    peer_a.handle.refresh_entity("alice");
    settle().await;
    assert!(events_a.try_recv().is_err());
    assert!(events_b.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn settings_toggle_propagates_to_all_peers() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;
    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;

    peer_b.handle.set_setting(SettingKey::Ticker, false);
    wait_state(&peer_a.handle, "leader applies toggle", |snapshot| {
        !snapshot.settings.ticker
    })
    .await;
    wait_state(&peer_b.handle, "origin applies toggle", |snapshot| {
        !snapshot.settings.ticker
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn follower_remove_routes_through_leader() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;
    let peer_b = spawn_peer(&group, "peer-b");
    sleep(Duration::from_millis(300)).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_b.handle, "follower sees alice", |snapshot| {
        snapshot.entities == ["alice"]
    })
    .await;

    peer_b.handle.remove_entity("alice");
    wait_state(&peer_a.handle, "leader drops alice", |snapshot| {
        snapshot.entities.is_empty()
    })
    .await;
    wait_state(&peer_b.handle, "follower drops alice", |snapshot| {
        snapshot.entities.is_empty()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn stale_fetch_result_is_discarded_after_demotion() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_a.handle, "cursor seeded", |snapshot| {
        snapshot.cursors.get("alice").map(String::as_str) == Some("3")
    })
    .await;

    // hold the next fetch in flight
    let gate = peer_a.fetcher.gate("alice");
    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[9, 3])));
    peer_a.handle.refresh_entity("alice");
    settle().await;
    assert_eq!(peer_a.fetcher.call_count("alice"), 2);

    let mut events = peer_a.handle.subscribe_events();
    let outsider = group.join();
    outsider.publish(Envelope::new(
        "peer-x",
        PeerMessage::LeaderTakeover,
        anchor(),
    ));
    wait_role(&peer_a.handle, Role::Follower).await;

    gate.notify_one();
    settle().await;

    // the completed fetch was discarded: no cursor motion, no notifications
    assert_eq!(
        peer_a
            .handle
            .state()
            .cursors
            .get("alice")
            .map(String::as_str),
        Some("3")
    );
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, PeerEvent::NewActivity(_)),
            "stale cycle must not notify"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn fetch_failure_is_isolated_and_rescheduled() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_a.handle, "alice tracked", |snapshot| {
        snapshot.entities == ["alice"]
    })
    .await;

    peer_a
        .fetcher
        .push("alice", Err(FetchError::Status(502)));
    peer_a.handle.refresh_entity("alice");
    settle().await;

    // still tracked, still scheduled, loop still alive
    let snapshot = peer_a.handle.state();
    assert_eq!(snapshot.entities, ["alice"]);
    assert!(snapshot.next_fetch_at.contains_key("alice"));

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[4, 3])));
    let mut events = peer_a.handle.subscribe_events();
    peer_a.handle.refresh_entity("alice");
    wait_state(&peer_a.handle, "recovered cycle advances", |snapshot| {
        snapshot.cursors.get("alice").map(String::as_str) == Some("4")
    })
    .await;
    settle().await;
    assert!(matches!(
        events.try_recv(),
        Ok(PeerEvent::NewActivity(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn dormant_probe_skips_change_detection() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_a.handle, "alice tracked", |snapshot| {
        snapshot.entities == ["alice"]
    })
    .await;

    let quiet_profile = EntityProfile {
        last_posted_at: Some(peer_a.clock.now() - ChronoDuration::hours(5)),
        last_seen_at: Some(peer_a.clock.now() - ChronoDuration::hours(5)),
    };
    peer_a.fetcher.push(
        "alice",
        Ok(FetchOutcome::Unchanged {
            profile: quiet_profile,
        }),
    );
    let mut events = peer_a.handle.subscribe_events();
    peer_a.handle.refresh_entity("alice");
    wait_state(&peer_a.handle, "dormant profile recorded", |snapshot| {
        snapshot
            .profiles
            .get("alice")
            .and_then(|profile| profile.last_seen_at)
            .map(|seen| seen < anchor())
            .unwrap_or(false)
    })
    .await;

    assert!(events.try_recv().is_err());
    // dormant tier stretches the next fetch far out
    let snapshot = peer_a.handle.state();
    assert_eq!(snapshot.multipliers.get("alice"), Some(&20.0));
}

#[tokio::test(start_paused = true)]
async fn scheduler_polls_due_entity_again_after_interval() {
    let group = LoopbackGroup::new();
    let peer_a = spawn_peer(&group, "peer-a");
    wait_role(&peer_a.handle, Role::Leader).await;

    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.handle.add_entity("alice");
    wait_state(&peer_a.handle, "alice tracked", |snapshot| {
        snapshot.entities == ["alice"]
    })
    .await;
    assert_eq!(peer_a.fetcher.call_count("alice"), 1);

    // recently-active profile => base interval + jitter (< 70s)
    peer_a
        .fetcher
        .push("alice", Ok(items_outcome(&peer_a.clock, &[3])));
    peer_a.clock.advance(ChronoDuration::seconds(71));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(peer_a.fetcher.call_count("alice"), 2);
}
