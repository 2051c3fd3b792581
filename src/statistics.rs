//! Node-wide statistics aggregation, keyed by peer identifier rather than
//! socket address: a watch list plus per-peer counters, and a cloneable
//! reporter handle each endpoint holds to feed it without touching the map
//! directly.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use codec::identifier::Identifier;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy)]
pub enum Report {
    ReceivedBytes(u32),
    SendBytes(u32),
    ReceivedPkts(u32),
    SendPkts(u32),
    ErrorPkts(u32),
}

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Counts {
    received_bytes: Count,
    send_bytes: Count,
    received_pkts: Count,
    send_pkts: Count,
    error_pkts: Count,
}

impl Counts {
    fn add(&self, report: &Report) {
        match report {
            Report::ReceivedBytes(v) => self.received_bytes.add(*v as u64),
            Report::ReceivedPkts(v) => self.received_pkts.add(*v as u64),
            Report::SendBytes(v) => self.send_bytes.add(*v as u64),
            Report::SendPkts(v) => self.send_pkts.add(*v as u64),
            Report::ErrorPkts(v) => self.error_pkts.add(*v as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerCounts {
    pub received_bytes: u64,
    pub send_bytes: u64,
    pub received_pkts: u64,
    pub send_pkts: u64,
    pub error_pkts: u64,
}

/// Node-wide statistics, one entry per watched peer identifier.
#[derive(Clone)]
pub struct NodeStatistics(Arc<RwLock<AHashMap<Identifier, Counts>>>);

impl Default for NodeStatistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(64))))
    }
}

impl NodeStatistics {
    /// A cloneable handle each endpoint holds to report without touching
    /// the map's lock directly on every packet.
    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter { map: self.0.clone() }
    }

    pub fn register(&self, identifier: Identifier) {
        self.0.write().insert(identifier, Counts::default());
    }

    pub fn unregister(&self, identifier: &Identifier) {
        self.0.write().remove(identifier);
    }

    pub fn get(&self, identifier: &Identifier) -> Option<PeerCounts> {
        self.0.read().get(identifier).map(|counts| PeerCounts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }

    pub fn watched_peers(&self) -> usize {
        self.0.read().len()
    }
}

/// Held by each endpoint; forwards reports into the shared map.
#[derive(Clone)]
pub struct StatisticsReporter {
    map: Arc<RwLock<AHashMap<Identifier, Counts>>>,
}

impl StatisticsReporter {
    pub fn send(&self, identifier: &Identifier, reports: &[Report]) {
        if let Some(counts) = self.map.read().get(identifier) {
            for report in reports {
                counts.add(report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_peer_accumulates_reports() {
        let statistics = NodeStatistics::default();
        let identifier = Identifier::generate();
        statistics.register(identifier);

        let reporter = statistics.get_reporter();
        reporter.send(&identifier, &[Report::ReceivedBytes(10), Report::SendPkts(1)]);

        let counts = statistics.get(&identifier).unwrap();
        assert_eq!(counts.received_bytes, 10);
        assert_eq!(counts.send_pkts, 1);
    }

    #[test]
    fn unregistered_peer_reports_are_dropped_silently() {
        let statistics = NodeStatistics::default();
        let identifier = Identifier::generate();
        let reporter = statistics.get_reporter();

        reporter.send(&identifier, &[Report::ReceivedBytes(10)]);
        assert!(statistics.get(&identifier).is_none());
    }

    #[test]
    fn unregister_removes_the_watch_entry() {
        let statistics = NodeStatistics::default();
        let identifier = Identifier::generate();
        statistics.register(identifier);
        assert_eq!(statistics.watched_peers(), 1);

        statistics.unregister(&identifier);
        assert_eq!(statistics.watched_peers(), 0);
    }
}
