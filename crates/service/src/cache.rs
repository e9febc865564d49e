//! Per-channel ephemeral event cache.
//!
//! Ephemeral events bypass the durable log: they live in a bounded list
//! with a short TTL, and delivery is at-most-once per session via a
//! sequence watermark kept on the session (the cache itself never removes
//! entries on read, so late-joining sessions inside the TTL window still
//! see them).

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use codec::message::Envelope;

struct CacheEntry {
    seq: u64,
    appended_ms: u64,
    envelope: Envelope,
}

pub struct EphemeralCache {
    entries: Mutex<VecDeque<CacheEntry>>,
    seq: AtomicU64,
    capacity: usize,
}

impl EphemeralCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            seq: AtomicU64::new(0),
            capacity,
        }
    }

    /// Insert an envelope, dropping the oldest entry on overflow. Returns
    /// the sequence number assigned to it.
    pub fn put(&self, envelope: Envelope, now_ms: u64) -> u64 {
        let mut entries = self.entries.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        if entries.len() >= self.capacity {
            entries.pop_front();
        }

        entries.push_back(CacheEntry {
            seq,
            appended_ms: now_ms,
            envelope,
        });

        seq
    }

    /// Entries appended after the watermark, oldest first, together with
    /// the watermark covering everything currently cached. Reading never
    /// removes; callers persist the returned watermark per session.
    pub fn read_since(&self, watermark: u64) -> (Vec<Envelope>, u64) {
        let entries = self.entries.lock();
        let mut advanced = watermark;

        let events = entries
            .iter()
            .filter(|entry| entry.seq > watermark)
            .map(|entry| {
                advanced = advanced.max(entry.seq);
                entry.envelope.clone()
            })
            .collect();

        (events, advanced)
    }

    /// Remove entries older than the TTL regardless of read state.
    pub fn sweep(&self, now_ms: u64, ttl_ms: u64) {
        let mut entries = self.entries.lock();
        while let Some(entry) = entries.front() {
            if entry.appended_ms.saturating_add(ttl_ms) > now_ms {
                break;
            }

            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
