use crate::wire::PeerMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How long a starting peer waits for `leader_here` before promoting itself.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound for the random delay before re-running the probe after a
/// `leader_resign`, so a group of followers does not stampede the channel.
pub const RESIGN_RETRY_JITTER: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => f.write_str("follower"),
            Role::Leader => f.write_str("leader"),
        }
    }
}

/// Side effects the embedding runtime must carry out after feeding the
/// elector an input. The elector itself never touches a timer or the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish this message on the channel.
    Publish(PeerMessage),
    /// Arm the probe timeout; on expiry call [`LeaderElector::on_deadline`].
    ArmDeadline(Duration),
    /// Cancel a previously armed probe timeout.
    CancelDeadline,
    /// Re-run [`LeaderElector::start`] after a random delay in
    /// `[0, RESIGN_RETRY_JITTER)`.
    ScheduleRetry,
    /// This peer just became leader: begin scheduling and seed state.
    Promoted,
    /// This peer just stopped being leader. `republish` asks for one final
    /// snapshot broadcast as a state handoff (the takeover race case).
    Demoted { republish: bool },
    /// Ask the current leader for a fresh snapshot (`data_request`).
    RequestSnapshot,
}

/// Lease-free election over an unordered, at-most-once broadcast medium.
///
/// A starting peer probes with `leader_check`; silence for
/// [`ELECTION_TIMEOUT`] means no leader exists and the peer promotes itself.
/// Split-brain races resolve by yielding to the last `leader_takeover`
/// announcement, never by negotiation. There is no heartbeat: a leader that
/// dies without resigning stalls the group until some peer re-probes.
#[derive(Debug)]
pub struct LeaderElector {
    role: Role,
    probe_pending: bool,
}

impl LeaderElector {
    pub fn new() -> Self {
        Self {
            role: Role::Follower,
            probe_pending: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn probe_pending(&self) -> bool {
        self.probe_pending
    }

    /// Begins (or speculatively re-runs) the probe protocol. No-op for a
    /// peer that is already leader or already probing.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.role == Role::Leader || self.probe_pending {
            return Vec::new();
        }
        self.probe_pending = true;
        vec![
            Effect::Publish(PeerMessage::LeaderCheck),
            Effect::ArmDeadline(ELECTION_TIMEOUT),
        ]
    }

    /// The probe timeout expired without a `leader_here`: promote.
    pub fn on_deadline(&mut self) -> Vec<Effect> {
        if !self.probe_pending {
            return Vec::new();
        }
        self.probe_pending = false;
        self.role = Role::Leader;
        vec![Effect::Publish(PeerMessage::LeaderTakeover), Effect::Promoted]
    }

    /// Feeds one election-relevant message from another peer. Non-election
    /// messages yield no effects.
    pub fn on_message(&mut self, msg: &PeerMessage) -> Vec<Effect> {
        match msg {
            PeerMessage::LeaderCheck => {
                if self.role == Role::Leader {
                    vec![Effect::Publish(PeerMessage::LeaderHere)]
                } else {
                    Vec::new()
                }
            }
            PeerMessage::LeaderHere => {
                let mut effects = Vec::new();
                if self.probe_pending {
                    self.probe_pending = false;
                    effects.push(Effect::CancelDeadline);
                }
                if self.role == Role::Leader {
                    // two leaders and the other one answered first; yield
                    // quietly, the group already follows it
                    self.role = Role::Follower;
                    effects.push(Effect::Demoted { republish: false });
                }
                effects.push(Effect::RequestSnapshot);
                effects
            }
            PeerMessage::LeaderTakeover => {
                if self.role == Role::Leader {
                    // last announcer wins; hand off our state and step down
                    self.role = Role::Follower;
                    vec![Effect::Demoted { republish: true }]
                } else {
                    Vec::new()
                }
            }
            PeerMessage::LeaderResign => vec![Effect::ScheduleRetry],
            _ => Vec::new(),
        }
    }

    /// Voluntary departure (shutdown path). Best effort: the resign message
    /// may never arrive, which is the documented liveness gap.
    pub fn resign(&mut self) -> Vec<Effect> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        self.role = Role::Follower;
        vec![Effect::Publish(PeerMessage::LeaderResign)]
    }
}

impl Default for LeaderElector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_channel_promotes_after_deadline() {
        let mut elector = LeaderElector::new();
        let effects = elector.start();
        assert_eq!(
            effects,
            vec![
                Effect::Publish(PeerMessage::LeaderCheck),
                Effect::ArmDeadline(ELECTION_TIMEOUT),
            ]
        );
        let effects = elector.on_deadline();
        assert_eq!(
            effects,
            vec![
                Effect::Publish(PeerMessage::LeaderTakeover),
                Effect::Promoted,
            ]
        );
        assert!(elector.is_leader());
    }

    #[test]
    fn reply_before_deadline_confirms_follower() {
        let mut elector = LeaderElector::new();
        elector.start();
        let effects = elector.on_message(&PeerMessage::LeaderHere);
        assert_eq!(
            effects,
            vec![Effect::CancelDeadline, Effect::RequestSnapshot]
        );
        assert_eq!(elector.role(), Role::Follower);
        // a deadline that fires anyway is ignored
        assert!(elector.on_deadline().is_empty());
    }

    #[test]
    fn leader_answers_probes() {
        let mut elector = LeaderElector::new();
        elector.start();
        elector.on_deadline();
        let effects = elector.on_message(&PeerMessage::LeaderCheck);
        assert_eq!(effects, vec![Effect::Publish(PeerMessage::LeaderHere)]);
    }

    #[test]
    fn follower_ignores_probes() {
        let mut elector = LeaderElector::new();
        assert!(elector.on_message(&PeerMessage::LeaderCheck).is_empty());
    }

    #[test]
    fn leader_yields_to_foreign_takeover_with_handoff() {
        let mut elector = LeaderElector::new();
        elector.start();
        elector.on_deadline();
        let effects = elector.on_message(&PeerMessage::LeaderTakeover);
        assert_eq!(effects, vec![Effect::Demoted { republish: true }]);
        assert_eq!(elector.role(), Role::Follower);
    }

    #[test]
    fn follower_with_pending_probe_keeps_probing_through_takeover() {
        // last-announcer-wins: a takeover does not cancel someone else's
        // in-flight probe; the prober may still promote and win the race
        let mut elector = LeaderElector::new();
        elector.start();
        assert!(elector.on_message(&PeerMessage::LeaderTakeover).is_empty());
        assert!(elector.probe_pending());
        let effects = elector.on_deadline();
        assert!(effects.contains(&Effect::Promoted));
    }

    #[test]
    fn resign_schedules_jittered_retry_on_peers() {
        let mut elector = LeaderElector::new();
        let effects = elector.on_message(&PeerMessage::LeaderResign);
        assert_eq!(effects, vec![Effect::ScheduleRetry]);
    }

    #[test]
    fn leader_resigns_once() {
        let mut elector = LeaderElector::new();
        elector.start();
        elector.on_deadline();
        let effects = elector.resign();
        assert_eq!(effects, vec![Effect::Publish(PeerMessage::LeaderResign)]);
        assert_eq!(elector.role(), Role::Follower);
        assert!(elector.resign().is_empty());
    }

    #[test]
    fn start_is_idempotent_while_probing_or_leading() {
        let mut elector = LeaderElector::new();
        elector.start();
        assert!(elector.start().is_empty());
        elector.on_deadline();
        assert!(elector.start().is_empty());
    }

    #[test]
    fn data_messages_do_not_disturb_the_machine() {
        let mut elector = LeaderElector::new();
        assert!(elector.on_message(&PeerMessage::DataRequest).is_empty());
        assert!(elector.on_message(&PeerMessage::CmdRefreshAll).is_empty());
    }
}
