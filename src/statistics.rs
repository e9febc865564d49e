use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The kind of count reported into the statistics table.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    SentEvents(usize),
    ReceivedEvents(usize),
    ReceivedEphemerals(usize),
    ErrorCalls(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-session counters.
pub struct Counts<T> {
    pub sent_events: T,
    pub received_events: T,
    pub received_ephemerals: T,
    pub error_calls: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use courier_server::statistics::*;
    ///
    /// let counts = Counts {
    ///     sent_events: Count::default(),
    ///     received_events: Count::default(),
    ///     received_ephemerals: Count::default(),
    ///     error_calls: Count::default(),
    /// };
    ///
    /// counts.add(&Stats::SentEvents(1));
    /// assert_eq!(counts.sent_events.get(), 1);
    ///
    /// counts.add(&Stats::ReceivedEvents(3));
    /// assert_eq!(counts.received_events.get(), 3);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::SentEvents(v) => self.sent_events.add(*v),
            Stats::ReceivedEvents(v) => self.received_events.add(*v),
            Stats::ReceivedEphemerals(v) => self.received_ephemerals.add(*v),
            Stats::ErrorCalls(v) => self.error_calls.add(*v),
        }
    }
}

/// Session-keyed statistics table. Rows are registered at connect and
/// dropped at disconnect; the counters only ever count, message content
/// never reaches them.
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(1024))))
    }
}

impl Statistics {
    /// # Example
    ///
    /// ```
    /// use courier_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("s1");
    /// statistics.add("s1", &[Stats::SentEvents(2)]);
    /// assert_eq!(statistics.get("s1").unwrap().sent_events, 2);
    ///
    /// statistics.unregister("s1");
    /// assert!(statistics.get("s1").is_none());
    /// ```
    pub fn register(&self, session_id: &str) {
        self.0.write().insert(
            session_id.to_string(),
            Counts {
                sent_events: Count::default(),
                received_events: Count::default(),
                received_ephemerals: Count::default(),
                error_calls: Count::default(),
            },
        );
    }

    pub fn unregister(&self, session_id: &str) {
        self.0.write().remove(session_id);
    }

    /// Reports for unregistered sessions fall on the floor, which is what
    /// a reaped session's in-flight calls want.
    pub fn add(&self, session_id: &str, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(session_id) {
            for report in reports {
                counts.add(report);
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Counts<usize>> {
        self.0.read().get(session_id).map(|counts| Counts {
            sent_events: counts.sent_events.get(),
            received_events: counts.received_events.get(),
            received_ephemerals: counts.received_ephemerals.get(),
            error_calls: counts.error_calls.get(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
