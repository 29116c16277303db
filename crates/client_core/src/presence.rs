use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::UserId,
    protocol::{MemberSummary, PRESENCE_WINDOW_SECONDS},
};

pub fn default_window() -> Duration {
    Duration::seconds(PRESENCE_WINDOW_SECONDS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

/// Online iff `now - last_heartbeat < window`. A member that never sent a
/// heartbeat is offline; a heartbeat ahead of `now` counts as fresh.
pub fn classify(
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> Presence {
    match last_heartbeat {
        Some(at) if now - at < window => Presence::Online,
        _ => Presence::Offline,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPresence {
    pub user_id: UserId,
    pub name: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceReport {
    pub computed_at: DateTime<Utc>,
    pub members: Vec<MemberPresence>,
    pub online_count: usize,
}

impl PresenceReport {
    pub fn presence_of(&self, user_id: UserId) -> Option<Presence> {
        self.members
            .iter()
            .find(|member| member.user_id == user_id)
            .map(|member| member.presence)
    }
}

/// Classifies every `(member, name, last heartbeat)` entry against the same `now`.
pub fn estimate<I>(heartbeats: I, now: DateTime<Utc>, window: Duration) -> PresenceReport
where
    I: IntoIterator<Item = (UserId, String, Option<DateTime<Utc>>)>,
{
    let members: Vec<MemberPresence> = heartbeats
        .into_iter()
        .map(|(user_id, name, last_heartbeat)| MemberPresence {
            user_id,
            name,
            last_heartbeat,
            presence: classify(last_heartbeat, now, window),
        })
        .collect();
    let online_count = members
        .iter()
        .filter(|member| member.presence == Presence::Online)
        .count();
    PresenceReport {
        computed_at: now,
        members,
        online_count,
    }
}

/// Recomputes presence from a member listing. The server's own `online`
/// flag is ignored.
pub fn estimate_members(
    members: &[MemberSummary],
    now: DateTime<Utc>,
    window: Duration,
) -> PresenceReport {
    estimate(
        members
            .iter()
            .map(|member| (member.id, member.name.clone(), member.last_seen)),
        now,
        window,
    )
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
