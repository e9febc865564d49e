//! Session table, per-channel rosters and the idle reaper's bookkeeping.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use rand::{Rng, distr::Alphanumeric};

use codec::message::AgentInfo;

use crate::error::ServiceError;

/// Coarse clock advanced once per second by the housekeeping thread.
/// Everything idle-related counts in its ticks instead of wall time, so a
/// wall clock jump cannot mass-expire sessions.
///
/// ```
/// use courier_server_service::sessions::Ticker;
///
/// let ticker = Ticker::default();
///
/// assert_eq!(ticker.now(), 0);
/// assert_eq!(ticker.advance(), 1);
/// assert_eq!(ticker.now(), 1);
/// ```
#[derive(Default)]
pub struct Ticker(AtomicU64);

impl Ticker {
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Receive-side watermarks, serialized per session by the async lock so
/// concurrent receives cannot double-deliver ephemerals.
#[derive(Debug, Default)]
pub struct ReadState {
    pub last_persistence_read_ms: u64,
    pub last_ephemeral_watermark: u64,
}

pub struct Session {
    pub session_id: String,
    pub channel_id: String,
    pub agent: AgentInfo,
    pub(crate) read: tokio::sync::Mutex<ReadState>,
    last_activity: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(session_id: String, channel_id: String, agent: AgentInfo, tick: u64) -> Self {
        Self {
            session_id,
            channel_id,
            agent,
            read: tokio::sync::Mutex::new(ReadState::default()),
            last_activity: AtomicU64::new(tick),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_activity.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn idle_ticks(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Flipped exactly once, when the session leaves the tables. In-flight
    /// long-polls observe it after the channel wakeup and bail out with
    /// the session-not-found contract.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    rosters: RwLock<HashMap<String, HashMap<String, Arc<Session>>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::with_capacity(1024)),
            rosters: RwLock::new(HashMap::with_capacity(64)),
        }
    }
}

impl SessionManager {
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Register a session, enforcing agent name uniqueness within its
    /// channel. Both tables move together under the roster lock.
    pub(crate) fn insert(&self, session: Arc<Session>) -> Result<(), ServiceError> {
        let mut rosters = self.rosters.write();
        let roster = rosters.entry(session.channel_id.clone()).or_default();

        if roster.contains_key(&session.agent.agent_name) {
            return Err(ServiceError::AgentNameConflict);
        }

        roster.insert(session.agent.agent_name.clone(), session.clone());
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);

        Ok(())
    }

    pub(crate) fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(session_id)?;

        {
            let mut rosters = self.rosters.write();
            if let Some(roster) = rosters.get_mut(&session.channel_id) {
                roster.remove(&session.agent.agent_name);
                if roster.is_empty() {
                    rosters.remove(&session.channel_id);
                }
            }
        }

        session.close();
        Some(session)
    }

    /// Remove every session of a channel (channel deletion path).
    pub(crate) fn drop_channel(&self, channel_id: &str) -> Vec<Arc<Session>> {
        let Some(roster) = self.rosters.write().remove(channel_id) else {
            return Vec::new();
        };

        let mut sessions = self.sessions.write();
        roster
            .into_values()
            .map(|session| {
                sessions.remove(&session.session_id);
                session.close();
                session
            })
            .collect()
    }

    /// Roster projection, connection order first so clients can verify
    /// their host election against the listing.
    pub fn roster(&self, channel_id: &str) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .rosters
            .read()
            .get(channel_id)
            .map(|roster| roster.values().map(|s| s.agent.clone()).collect())
            .unwrap_or_default();

        agents.sort_by(|a, b| {
            a.connection_time
                .cmp(&b.connection_time)
                .then_with(|| a.agent_name.cmp(&b.agent_name))
        });

        agents
    }

    pub fn channel_len(&self, channel_id: &str) -> usize {
        self.rosters
            .read()
            .get(channel_id)
            .map(|roster| roster.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn idle(&self, now: u64, ttl_ticks: u64) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|session| session.idle_ticks(now) >= ttl_ticks)
            .cloned()
            .collect()
    }
}

/// The host is the live agent with the earliest connection time, ties
/// broken lexicographically. Every client evaluating the same roster
/// lands on the same answer.
///
/// ```
/// use courier_server_service::sessions::elect_host;
/// use codec::message::AgentInfo;
///
/// let agent = |name: &str, time: u64| AgentInfo {
///     agent_name: name.to_string(),
///     connection_time: time,
///     ..Default::default()
/// };
///
/// let roster = [agent("bob", 20), agent("alice", 10), agent("zed", 10)];
/// assert_eq!(elect_host(&roster).unwrap().agent_name, "alice");
/// assert!(elect_host(&[]).is_none());
/// ```
pub fn elect_host(agents: &[AgentInfo]) -> Option<&AgentInfo> {
    agents.iter().min_by(|a, b| {
        a.connection_time
            .cmp(&b.connection_time)
            .then_with(|| a.agent_name.cmp(&b.agent_name))
    })
}

/// Opaque, unguessable session identifier.
pub(crate) fn make_session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, channel: &str, name: &str) -> Arc<Session> {
        Arc::new(Session::new(
            id.to_string(),
            channel.to_string(),
            AgentInfo {
                agent_name: name.to_string(),
                ..Default::default()
            },
            0,
        ))
    }

    #[test]
    fn names_are_unique_per_channel_not_globally() {
        let manager = SessionManager::default();
        manager.insert(session("s1", "c1", "alice")).unwrap();

        assert_eq!(
            manager.insert(session("s2", "c1", "alice")),
            Err(ServiceError::AgentNameConflict)
        );

        // Same name in another channel is fine.
        manager.insert(session("s3", "c2", "alice")).unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn removal_frees_the_name_and_closes() {
        let manager = SessionManager::default();
        manager.insert(session("s1", "c1", "alice")).unwrap();

        let removed = manager.remove("s1").unwrap();
        assert!(removed.is_closed());
        assert_eq!(manager.channel_len("c1"), 0);

        manager.insert(session("s2", "c1", "alice")).unwrap();
    }

    #[test]
    fn drop_channel_clears_every_table() {
        let manager = SessionManager::default();
        manager.insert(session("s1", "c1", "alice")).unwrap();
        manager.insert(session("s2", "c1", "bob")).unwrap();
        manager.insert(session("s3", "c2", "carol")).unwrap();

        let dropped = manager.drop_channel("c1");
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|s| s.is_closed()));
        assert_eq!(manager.len(), 1);
        assert!(manager.get("s1").is_none());
    }

    #[test]
    fn idle_selection_uses_ticks() {
        let manager = SessionManager::default();
        let lively = session("s1", "c1", "alice");
        let stale = session("s2", "c1", "bob");
        manager.insert(lively.clone()).unwrap();
        manager.insert(stale).unwrap();

        lively.touch(100);

        let idle = manager.idle(100, 50);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].session_id, "s2");
    }
}
