//! Channel registry: identity-keyed channel state, dual offset
//! allocation, and the per-channel wakeup used by long-polling receives.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use codec::message::Envelope;

use crate::{cache::EphemeralCache, error::ServiceError, log::DurableLog};

/// Registry record for one channel. Immutable once created; the moving
/// parts (offset counters, cache, activity clock) live on the handle.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub channel_id: String,
    pub channel_name: String,
    /// Client-computed password hash, stored verbatim at creation. Empty
    /// for channels created by developer-scoped identity alone.
    pub hashed_password: String,
    pub dev_key_id: String,
    pub topic_name: String,
    pub created_at: u64,
    /// Retention hint for housekeeping, in milliseconds.
    pub age_ms: u64,
    pub public_channel: bool,
    pub allowed_agent_names: Vec<String>,
    pub original_global_offset: u64,
    pub original_local_offset: u64,
}

/// Client-facing snapshot of a channel, offsets included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub channel_name: String,
    pub public_channel: bool,
    pub age_ms: u64,
    pub global_offset: u64,
    pub local_offset: u64,
    pub original_global_offset: u64,
    pub original_local_offset: u64,
}

/// Admin projection used by the registry self-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOffsetInfo {
    pub cache_local_counter: u64,
    pub db_local_offset: u64,
    pub db_global_offset: u64,
    pub log_last_offset: u64,
    pub dirty: bool,
}

#[derive(Default)]
struct OffsetCounters {
    global: u64,
    local: u64,
}

pub struct ChannelHandle {
    state: ChannelState,
    counters: Mutex<OffsetCounters>,
    cache: EphemeralCache,
    notify: Notify,
    /// Housekeeping tick of the last operation touching the channel.
    last_activity: AtomicU64,
    /// Last assigned connection time, for the per-channel monotonic clock.
    last_connection_ms: AtomicU64,
}

impl ChannelHandle {
    fn new(state: ChannelState, cache_capacity: usize, tick: u64) -> Self {
        Self {
            counters: Mutex::new(OffsetCounters {
                global: state.original_global_offset,
                local: state.original_local_offset,
            }),
            cache: EphemeralCache::new(cache_capacity),
            notify: Notify::new(),
            last_activity: AtomicU64::new(tick),
            last_connection_ms: AtomicU64::new(0),
            state,
        }
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn id(&self) -> &str {
        &self.state.channel_id
    }

    pub fn topic(&self) -> &str {
        &self.state.topic_name
    }

    pub fn cache(&self) -> &EphemeralCache {
        &self.cache
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    pub(crate) fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_activity.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn idle_ticks(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Connection times are strictly monotonic within a channel even when
    /// the wall clock stalls, which keeps host election total.
    pub(crate) fn next_connection_time(&self, now_ms: u64) -> u64 {
        self.last_connection_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now_ms.max(last + 1))
            })
            .map(|last| now_ms.max(last + 1))
            .unwrap_or(now_ms)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let counters = self.counters.lock();

        ChannelSnapshot {
            channel_id: self.state.channel_id.clone(),
            channel_name: self.state.channel_name.clone(),
            public_channel: self.state.public_channel,
            age_ms: self.state.age_ms,
            global_offset: counters.global,
            local_offset: counters.local,
            original_global_offset: self.state.original_global_offset,
            original_local_offset: self.state.original_local_offset,
        }
    }

    /// Allocate the next (global, local) pair and append. The counters
    /// only commit on a successful append, so a failed write leaves no
    /// gap and the caller may retry with the same envelope.
    pub(crate) fn append_durable(
        &self,
        log: &dyn DurableLog,
        envelope: &mut Envelope,
    ) -> Result<(u64, u64), ServiceError> {
        let mut counters = self.counters.lock();
        let global = counters.global + 1;
        let local = counters.local + 1;

        envelope.global_offset = global;
        envelope.local_offset = Some(local);
        envelope.ephemeral = false;

        log.append(&self.state.topic_name, envelope)?;

        counters.global = global;
        counters.local = local;
        drop(counters);

        self.notify.notify_waiters();
        Ok((global, local))
    }

    /// Ephemeral events take a global offset for client-side display
    /// ordering but never advance the durable counter.
    pub(crate) fn put_ephemeral(&self, envelope: &mut Envelope, now_ms: u64) -> u64 {
        let global = {
            let mut counters = self.counters.lock();
            counters.global += 1;
            counters.global
        };

        envelope.global_offset = global;
        envelope.local_offset = None;
        envelope.ephemeral = true;

        self.cache.put(envelope.clone(), now_ms);
        self.notify.notify_waiters();

        global
    }

    /// Health probe: compare the cached counter against the log head. A
    /// lagging counter marks the channel dirty and re-seeds it so the
    /// next allocation lands past everything stored.
    pub(crate) fn self_check(
        &self,
        log: &dyn DurableLog,
    ) -> Result<ChannelOffsetInfo, ServiceError> {
        let head = log.head(&self.state.topic_name)?;
        let (head_global, head_local) = head.unwrap_or((0, 0));

        let mut counters = self.counters.lock();
        let info = ChannelOffsetInfo {
            cache_local_counter: counters.local,
            db_local_offset: counters.local,
            db_global_offset: counters.global,
            log_last_offset: head_local,
            dirty: counters.local < head_local,
        };

        if info.dirty {
            counters.local = head_local;
            counters.global = counters.global.max(head_global);
        }

        Ok(info)
    }
}

/// Process-wide channel table. Reads are the hot path and never block
/// sends; writes happen on create/delete only.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<ChannelHandle>>>,
    cache_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::with_capacity(64)),
            cache_capacity,
        }
    }

    pub fn lookup(&self, channel_id: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.read().get(channel_id).cloned()
    }

    /// Idempotent by channel id: a concurrent create of the same identity
    /// returns the handle that won.
    pub(crate) fn create(&self, state: ChannelState, tick: u64) -> Arc<ChannelHandle> {
        self.channels
            .write()
            .entry(state.channel_id.clone())
            .or_insert_with(|| Arc::new(ChannelHandle::new(state, self.cache_capacity, tick)))
            .clone()
    }

    pub(crate) fn remove(&self, channel_id: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.write().remove(channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn owned_by(&self, dev_key_id: &str) -> usize {
        self.channels
            .read()
            .values()
            .filter(|handle| handle.state.dev_key_id == dev_key_id)
            .count()
    }

    pub(crate) fn all(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::log::MemoryLog;

    use codec::message::EventType;

    fn state(id: &str) -> ChannelState {
        ChannelState {
            channel_id: id.to_string(),
            channel_name: "room".to_string(),
            hashed_password: "H".to_string(),
            dev_key_id: "dev".to_string(),
            topic_name: id.to_string(),
            created_at: 0,
            age_ms: 86_400_000,
            public_channel: false,
            allowed_agent_names: Vec::new(),
            original_global_offset: 0,
            original_local_offset: 0,
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            from: "a".to_string(),
            to: Some("*".to_string()),
            filter: None,
            kind: EventType::ChatText,
            custom_type: None,
            encrypted: false,
            content: "x".to_string(),
            date: 0,
            global_offset: 0,
            local_offset: None,
            ephemeral: false,
            system_event: false,
        }
    }

    #[test]
    fn durable_allocation_is_strictly_increasing() {
        let log = MemoryLog::new();
        log.create("c1").unwrap();

        let registry = ChannelRegistry::new(16);
        let handle = registry.create(state("c1"), 0);

        let mut previous = (0, 0);
        for _ in 0..100 {
            let mut event = envelope();
            let assigned = handle.append_durable(&log, &mut event).unwrap();
            assert!(assigned.0 > previous.0 && assigned.1 > previous.1);
            previous = assigned;
        }
    }

    #[test]
    fn ephemeral_allocation_skips_local() {
        let log = MemoryLog::new();
        log.create("c1").unwrap();

        let registry = ChannelRegistry::new(16);
        let handle = registry.create(state("c1"), 0);

        let mut durable = envelope();
        handle.append_durable(&log, &mut durable).unwrap();

        let mut fleeting = envelope();
        let global = handle.put_ephemeral(&mut fleeting, 0);
        assert_eq!(global, 2);
        assert_eq!(fleeting.local_offset, None);

        // The durable counter did not move.
        let mut durable = envelope();
        assert_eq!(handle.append_durable(&log, &mut durable).unwrap(), (3, 2));
    }

    #[test]
    fn failed_append_commits_nothing() {
        let log = MemoryLog::new();

        let registry = ChannelRegistry::new(16);
        let handle = registry.create(state("missing"), 0);

        // The topic was never created, so the append fails.
        let mut event = envelope();
        assert!(handle.append_durable(&log, &mut event).is_err());

        log.create("missing").unwrap();
        let mut event = envelope();
        assert_eq!(handle.append_durable(&log, &mut event).unwrap(), (1, 1));
    }

    #[test]
    fn self_check_reseeds_lagging_counters() {
        let log = MemoryLog::new();
        log.create("c1").unwrap();

        let mut stored = envelope();
        stored.global_offset = 9;
        stored.local_offset = Some(4);
        log.append("c1", &stored).unwrap();

        let registry = ChannelRegistry::new(16);
        let handle = registry.create(state("c1"), 0);

        let info = handle.self_check(&log).unwrap();
        assert!(info.dirty);
        assert_eq!(info.log_last_offset, 4);

        // Re-seeded: the next allocation lands past the stored head.
        let mut event = envelope();
        assert_eq!(handle.append_durable(&log, &mut event).unwrap(), (10, 5));

        assert!(!handle.self_check(&log).unwrap().dirty);
    }

    #[test]
    fn connection_times_are_strictly_monotonic() {
        let registry = ChannelRegistry::new(16);
        let handle = registry.create(state("c1"), 0);

        let first = handle.next_connection_time(1_000);
        let second = handle.next_connection_time(1_000);
        let third = handle.next_connection_time(999);
        assert!(first < second && second < third);

        // The clock moving forward is respected.
        assert_eq!(handle.next_connection_time(5_000), 5_000);
    }
}
