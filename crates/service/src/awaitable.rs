//! Awaitable Tracking Service: correlates responses to outbound requests
//! that may fan out, enforces deadlines, and aggregates partial results.

use std::sync::Weak;

use ahash::{AHashMap, AHashSet};
use codec::identifier::Identifier;
use codec::parcel::ApplicationParcel;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::RngCore;

use crate::peer::PeerProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Direct,
    Cluster,
    Sampled,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Pending,
    Fulfilled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    Fulfilled,
    Expired,
    Unexpected,
}

struct Tracker {
    kind: RequestKind,
    expected: AHashSet<Identifier>,
    received: Vec<(Identifier, ApplicationParcel)>,
    requestor: Weak<PeerProxy>,
    /// Present only for `Deferred` trackers: the original request this
    /// aggregate must eventually reply to.
    original_requestor_parcel: Option<ApplicationParcel>,
    created_at_ms: u64,
    deadline_ms: u64,
    state: TrackerState,
}

impl Tracker {
    fn is_complete(&self) -> bool {
        self.received.len() >= self.expected.len()
    }
}

/// A tracker that has transitioned to `Fulfilled` or `Expired` this cycle,
/// handed to the caller of `execute()` so it can transmit the aggregated
/// response and, for timed-out peers, a synthesized timeout status.
pub struct CompletedTracker {
    pub key: [u8; 16],
    pub kind: RequestKind,
    pub state: TrackerState,
    pub expected: Vec<Identifier>,
    pub received: Vec<(Identifier, ApplicationParcel)>,
    pub requestor: Weak<PeerProxy>,
    pub original_requestor_parcel: Option<ApplicationParcel>,
}

/// Generates the 16-byte MD5 tracker key and correlates responses against
/// it. Its delegate (in the scheduler) declares a dependency on the
/// AuthorizedProcessor's delegate so this cycle's responses are applied
/// before the fulfillment sweep in `execute()`.
pub struct AwaitableTrackingService {
    trackers: Mutex<AHashMap<[u8; 16], Tracker>>,
}

impl Default for AwaitableTrackingService {
    fn default() -> Self {
        Self::new()
    }
}

impl AwaitableTrackingService {
    pub fn new() -> Self {
        Self {
            trackers: Mutex::new(AHashMap::with_capacity(64)),
        }
    }

    fn generate_key(requestor_internal: &[u8; 16], now_ms: u64) -> [u8; 16] {
        let mut salt = [0u8; 8];
        rand::rng().fill_bytes(&mut salt);

        let mut hasher = Md5::new();
        hasher.update(requestor_internal);
        hasher.update(now_ms.to_be_bytes());
        hasher.update(salt);

        hasher.finalize().into()
    }

    /// Stage a direct/cluster/sampled request tracker. `requestor_internal`
    /// is the local node's internal identifier (the MD5 key input), not the
    /// requestor peer's.
    pub fn stage(
        &self,
        kind: RequestKind,
        requestor_internal: &[u8; 16],
        expected: AHashSet<Identifier>,
        requestor: Weak<PeerProxy>,
        now_ms: u64,
        timeout_ms: u64,
    ) -> [u8; 16] {
        let key = Self::generate_key(requestor_internal, now_ms);

        self.trackers.lock().insert(
            key,
            Tracker {
                kind,
                expected,
                received: Vec::new(),
                requestor,
                original_requestor_parcel: None,
                created_at_ms: now_ms,
                deadline_ms: now_ms + timeout_ms,
                state: TrackerState::Pending,
            },
        );

        key
    }

    /// Stages a deferred aggregate: validates the deferred parcel carries a
    /// request-bound Awaitable extension, generates a key, and stores the
    /// original requestor parcel for final reply assembly.
    pub fn stage_deferred(
        &self,
        requestor_internal: &[u8; 16],
        expected: AHashSet<Identifier>,
        deferred_parcel: ApplicationParcel,
        requestor: Weak<PeerProxy>,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Option<[u8; 16]> {
        let awaitable = deferred_parcel.extensions.awaitable()?;
        if awaitable.binding != codec::extension::Binding::Request {
            return None;
        }

        let key = Self::generate_key(requestor_internal, now_ms);

        self.trackers.lock().insert(
            key,
            Tracker {
                kind: RequestKind::Deferred,
                expected,
                received: Vec::new(),
                requestor,
                original_requestor_parcel: Some(deferred_parcel),
                created_at_ms: now_ms,
                deadline_ms: now_ms + timeout_ms,
                state: TrackerState::Pending,
            },
        );

        Some(key)
    }

    /// Locate the tracker by the parcel's Awaitable extension key, record
    /// the response, and report the update outcome. Late responses after
    /// fulfillment are dropped with `Unexpected`.
    pub fn process(&self, responder: Identifier, parcel: ApplicationParcel) -> ProcessOutcome {
        let Some(awaitable) = parcel.extensions.awaitable() else {
            return ProcessOutcome::Unexpected;
        };

        if awaitable.binding != codec::extension::Binding::Response {
            return ProcessOutcome::Unexpected;
        }

        let key = awaitable.tracker_key;
        let mut trackers = self.trackers.lock();
        let Some(tracker) = trackers.get_mut(&key) else {
            return ProcessOutcome::Unexpected;
        };

        if tracker.state != TrackerState::Pending {
            log::warn!("late response for tracker after fulfillment");
            return ProcessOutcome::Unexpected;
        }

        if !tracker.expected.contains(&responder) {
            return ProcessOutcome::Unexpected;
        }

        tracker.received.push((responder, parcel));

        if tracker.is_complete() {
            tracker.state = TrackerState::Fulfilled;
            ProcessOutcome::Fulfilled
        } else {
            ProcessOutcome::Success
        }
    }

    /// Scans trackers; transmits and erases every Fulfilled tracker, and
    /// every Pending tracker whose deadline has passed transitions to
    /// Expired with a synthesized timeout for missing peers, then erases.
    /// Returns the number of trackers completed this cycle.
    pub fn execute(&self, now_ms: u64, mut on_complete: impl FnMut(CompletedTracker)) -> usize {
        let mut completed = Vec::new();

        {
            let mut trackers = self.trackers.lock();
            let expired_keys: Vec<[u8; 16]> = trackers
                .iter()
                .filter(|(_, t)| t.state == TrackerState::Pending && now_ms >= t.deadline_ms)
                .map(|(k, _)| *k)
                .collect();

            for key in expired_keys {
                if let Some(tracker) = trackers.get_mut(&key) {
                    tracker.state = TrackerState::Expired;
                }
            }

            let done_keys: Vec<[u8; 16]> = trackers
                .iter()
                .filter(|(_, t)| matches!(t.state, TrackerState::Fulfilled | TrackerState::Expired))
                .map(|(k, _)| *k)
                .collect();

            for key in done_keys {
                if let Some(tracker) = trackers.remove(&key) {
                    completed.push(CompletedTracker {
                        key,
                        kind: tracker.kind,
                        state: tracker.state,
                        expected: tracker.expected.into_iter().collect(),
                        received: tracker.received,
                        requestor: tracker.requestor,
                        original_requestor_parcel: tracker.original_requestor_parcel,
                    });
                }
            }
        }

        let count = completed.len();
        for tracker in completed {
            on_complete(tracker);
        }

        count
    }

    pub fn pending_count(&self) -> usize {
        self.trackers.lock().len()
    }

    pub fn created_at(&self, key: &[u8; 16]) -> Option<u64> {
        self.trackers.lock().get(key).map(|t| t.created_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::extension::{AwaitableExtension, Binding};
    use codec::header::DestinationType;
    use codec::parcel::build_application;

    fn response_parcel(key: [u8; 16]) -> ApplicationParcel {
        build_application(
            Identifier::generate(),
            DestinationType::Node,
            None,
            "/query",
            b"pong".to_vec(),
            vec![Box::new(AwaitableExtension {
                binding: Binding::Response,
                tracker_key: key,
            })],
        )
        .unwrap()
    }

    #[test]
    fn fulfills_once_every_expected_peer_has_responded() {
        let service = AwaitableTrackingService::new();
        let a = Identifier::generate();
        let b = Identifier::generate();

        let mut expected = AHashSet::default();
        expected.insert(a);
        expected.insert(b);

        let key = service.stage(
            RequestKind::Cluster,
            &[0u8; 16],
            expected,
            Weak::new(),
            0,
            1000,
        );

        assert_eq!(service.process(a, response_parcel(key)), ProcessOutcome::Success);
        assert_eq!(service.process(b, response_parcel(key)), ProcessOutcome::Fulfilled);

        let mut completed = 0;
        let count = service.execute(1, |_| completed += 1);
        assert_eq!(count, 1);
        assert_eq!(completed, 1);
        assert_eq!(service.pending_count(), 0);
    }

    #[test]
    fn expires_when_deadline_passes_with_insufficient_responses() {
        let service = AwaitableTrackingService::new();
        let a = Identifier::generate();

        let mut expected = AHashSet::default();
        expected.insert(a);

        let _key = service.stage(RequestKind::Direct, &[0u8; 16], expected, Weak::new(), 0, 250);

        let mut expired_states = Vec::new();
        let count = service.execute(300, |tracker| expired_states.push(tracker.state));

        assert_eq!(count, 1);
        assert_eq!(expired_states, vec![TrackerState::Expired]);
    }

    #[test]
    fn late_response_after_fulfillment_is_dropped() {
        let service = AwaitableTrackingService::new();
        let a = Identifier::generate();

        let mut expected = AHashSet::default();
        expected.insert(a);

        let key = service.stage(RequestKind::Direct, &[0u8; 16], expected, Weak::new(), 0, 1000);
        assert_eq!(service.process(a, response_parcel(key)), ProcessOutcome::Fulfilled);

        // Tracker is Fulfilled but not yet swept by execute(); a second
        // response for the same key must be dropped as Unexpected.
        assert_eq!(service.process(a, response_parcel(key)), ProcessOutcome::Unexpected);
    }

    #[test]
    fn unexpected_responder_is_rejected() {
        let service = AwaitableTrackingService::new();
        let a = Identifier::generate();
        let stranger = Identifier::generate();

        let mut expected = AHashSet::default();
        expected.insert(a);

        let key = service.stage(RequestKind::Direct, &[0u8; 16], expected, Weak::new(), 0, 1000);
        assert_eq!(
            service.process(stranger, response_parcel(key)),
            ProcessOutcome::Unexpected
        );
    }
}
