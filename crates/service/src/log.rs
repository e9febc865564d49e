//! Durable log contract and the in-memory reference backend.
//!
//! The registry owns offset allocation; by the time an envelope reaches
//! [`DurableLog::append`] its `(globalOffset, localOffset)` pair is
//! assigned, and the backend's only ordering duty is to preserve append
//! order per topic. A broker-backed implementation (Kafka, a WAL, a DB
//! table) plugs in behind this trait without the pipeline changing.

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use codec::message::Envelope;

use crate::error::ServiceError;

pub trait DurableLog: Send + Sync + 'static {
    /// Ensure backing storage exists for the topic. Returns the offsets of
    /// the last event already stored there, if any; the registry seeds
    /// `originalGlobalOffset`/`originalLocalOffset` from it.
    fn create(&self, topic: &str) -> Result<Option<(u64, u64)>, ServiceError>;

    /// Append a fully-assigned envelope. Two successful appends A then B
    /// must read back in that order. A failed append must not leave a
    /// partial write behind.
    fn append(&self, topic: &str, envelope: &Envelope) -> Result<(), ServiceError>;

    /// Up to `limit` events with `localOffset > from_local` and
    /// `globalOffset > from_global`, in append order.
    fn read_range(
        &self,
        topic: &str,
        from_global: u64,
        from_local: u64,
        limit: usize,
    ) -> Result<Vec<Envelope>, ServiceError>;

    /// Offsets of the last stored event for the topic.
    fn head(&self, topic: &str) -> Result<Option<(u64, u64)>, ServiceError>;

    /// Destroy all events stored for the topic.
    fn destroy(&self, topic: &str) -> Result<(), ServiceError>;

    /// Drop events dated before `cutoff_ms`, returning how many went.
    /// Offsets of surviving events are untouched, so readers keep
    /// advancing correctly across collections.
    fn sweep(&self, topic: &str, cutoff_ms: u64) -> Result<usize, ServiceError> {
        let _ = (topic, cutoff_ms);
        Ok(0)
    }
}

/// Process-local log, one ordered vector per topic.
#[derive(Default)]
pub struct MemoryLog {
    topics: RwLock<HashMap<String, Vec<Envelope>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::with_capacity(64)),
        }
    }
}

impl DurableLog for MemoryLog {
    fn create(&self, topic: &str) -> Result<Option<(u64, u64)>, ServiceError> {
        let mut topics = self.topics.write();
        let events = topics.entry(topic.to_string()).or_default();

        Ok(events
            .last()
            .map(|event| (event.global_offset, event.local_offset.unwrap_or(0))))
    }

    fn append(&self, topic: &str, envelope: &Envelope) -> Result<(), ServiceError> {
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(events) => {
                events.push(envelope.clone());
                Ok(())
            }
            None => Err(ServiceError::transient(format!(
                "unknown topic: {}",
                topic
            ))),
        }
    }

    fn read_range(
        &self,
        topic: &str,
        from_global: u64,
        from_local: u64,
        limit: usize,
    ) -> Result<Vec<Envelope>, ServiceError> {
        let topics = self.topics.read();
        let Some(events) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        // Events are stored in (global, local) order, so the first match
        // can be found by binary search on the local offset.
        let start = events.partition_point(|event| event.local_offset.unwrap_or(0) <= from_local);

        Ok(events[start..]
            .iter()
            .filter(|event| event.global_offset > from_global)
            .take(limit)
            .cloned()
            .collect())
    }

    fn head(&self, topic: &str) -> Result<Option<(u64, u64)>, ServiceError> {
        Ok(self.topics.read().get(topic).and_then(|events| {
            events
                .last()
                .map(|event| (event.global_offset, event.local_offset.unwrap_or(0)))
        }))
    }

    fn destroy(&self, topic: &str) -> Result<(), ServiceError> {
        self.topics.write().remove(topic);
        Ok(())
    }

    fn sweep(&self, topic: &str, cutoff_ms: u64) -> Result<usize, ServiceError> {
        let mut topics = self.topics.write();
        let Some(events) = topics.get_mut(topic) else {
            return Ok(0);
        };

        let dropped = events.partition_point(|event| event.date < cutoff_ms);
        events.drain(..dropped);

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use codec::message::EventType;

    fn envelope(global: u64, local: u64, date: u64) -> Envelope {
        Envelope {
            from: "a".to_string(),
            to: Some("*".to_string()),
            filter: None,
            kind: EventType::ChatText,
            custom_type: None,
            encrypted: false,
            content: String::new(),
            date,
            global_offset: global,
            local_offset: Some(local),
            ephemeral: false,
            system_event: false,
        }
    }

    #[test]
    fn range_reads_are_exclusive_of_both_offsets() {
        let log = MemoryLog::new();
        log.create("t").unwrap();

        for i in 1..=5 {
            log.append("t", &envelope(i + 10, i, i)).unwrap();
        }

        let batch = log.read_range("t", 12, 2, 10).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].local_offset, Some(3));

        let batch = log.read_range("t", 0, 0, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].local_offset, Some(2));

        assert!(log.read_range("t", 15, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn create_is_idempotent_and_reports_head() {
        let log = MemoryLog::new();
        assert_eq!(log.create("t").unwrap(), None);

        log.append("t", &envelope(7, 3, 1)).unwrap();
        assert_eq!(log.create("t").unwrap(), Some((7, 3)));
        assert_eq!(log.head("t").unwrap(), Some((7, 3)));
    }

    #[test]
    fn append_to_unknown_topic_is_transient() {
        let log = MemoryLog::new();
        assert!(matches!(
            log.append("nope", &envelope(1, 1, 1)),
            Err(ServiceError::Transient(_))
        ));
    }

    #[test]
    fn sweep_drops_old_events_but_keeps_offsets() {
        let log = MemoryLog::new();
        log.create("t").unwrap();

        for i in 1..=4 {
            log.append("t", &envelope(i, i, i * 100)).unwrap();
        }

        assert_eq!(log.sweep("t", 250).unwrap(), 2);

        let batch = log.read_range("t", 0, 0, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].local_offset, Some(3));
    }
}
