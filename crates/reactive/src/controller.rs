//! Change controller state machine.
//!
//! One controller lives in every thread-confined instance. It decides what
//! happens when a newer version is committed by another thread:
//!
//! - with no live asynchronous queries the instance advances immediately;
//! - otherwise one background batch re-evaluates every asynchronous query
//!   and the instance only advances when that batch is delivered;
//! - changes arriving while a batch is in flight are coalesced into at most
//!   one follow-up batch.
//!
//! Worker results are adopted iff the worker version is not older than the
//! caller's version and the result answers the most recent request for its
//! target. The same rule applies to query results and single objects.

use tessel_storage::VersionId;
use tracing::debug;

/// Identifies a submitted re-evaluation batch.
pub type BatchId = u64;

/// Observable state of a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// No asynchronous work outstanding.
    Idle,
    /// Asynchronous queries are not loaded yet or a batch is in flight.
    AwaitingAsyncQueries,
}

/// What to do about a newer committed version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Advance to the latest version and notify listeners now.
    AdvanceNow,
    /// Submit a re-evaluation batch with this id; defer the advance.
    SubmitBatch(BatchId),
    /// A batch is already in flight; one follow-up has been scheduled.
    Coalesced,
}

/// Whether a delivered worker result is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Adopt,
    Discard,
}

/// Result of delivering a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchResolution {
    pub outcome: BatchOutcome,
    /// Changes arrived while the batch was in flight; process them again.
    pub rerun: bool,
}

/// Per-instance change controller.
#[derive(Debug)]
pub struct ChangeController {
    in_flight: Option<BatchId>,
    rerun_pending: bool,
    next_batch: BatchId,
    unloaded: usize,
    batches_submitted: u64,
}

impl Default for ChangeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeController {
    pub fn new() -> Self {
        Self {
            in_flight: None,
            rerun_pending: false,
            next_batch: 1,
            unloaded: 0,
            batches_submitted: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.in_flight.is_some() || self.unloaded > 0 {
            ControllerState::AwaitingAsyncQueries
        } else {
            ControllerState::Idle
        }
    }

    /// Returns the batch currently in flight.
    #[inline]
    pub fn in_flight(&self) -> Option<BatchId> {
        self.in_flight
    }

    /// Returns how many batches were submitted so far.
    #[inline]
    pub fn batches_submitted(&self) -> u64 {
        self.batches_submitted
    }

    /// Records how many asynchronous targets are waiting for their first
    /// result.
    pub fn set_unloaded(&mut self, unloaded: usize) {
        self.unloaded = unloaded;
    }

    /// Handles a newer committed version. `has_async` tells whether the
    /// instance has live asynchronous queries.
    pub fn on_change(&mut self, has_async: bool) -> ChangeDecision {
        if self.in_flight.is_some() {
            self.rerun_pending = true;
            return ChangeDecision::Coalesced;
        }
        if !has_async {
            return ChangeDecision::AdvanceNow;
        }
        let id = self.next_batch;
        self.next_batch += 1;
        self.in_flight = Some(id);
        self.batches_submitted += 1;
        debug!(batch = id, "submitting re-evaluation batch");
        ChangeDecision::SubmitBatch(id)
    }

    /// Handles the delivery of batch `id`, computed at `worker` while the
    /// instance reads `caller`.
    pub fn on_batch_delivered(
        &mut self,
        id: BatchId,
        worker: VersionId,
        caller: VersionId,
    ) -> BatchResolution {
        if self.in_flight != Some(id) {
            debug!(batch = id, "discarding unknown batch");
            return BatchResolution {
                outcome: BatchOutcome::Discard,
                rerun: false,
            };
        }
        self.in_flight = None;
        let outcome = if worker >= caller {
            BatchOutcome::Adopt
        } else {
            debug!(batch = id, %worker, %caller, "discarding superseded batch");
            BatchOutcome::Discard
        };
        BatchResolution {
            outcome,
            rerun: std::mem::take(&mut self.rerun_pending),
        }
    }

    /// Forgets the batch in flight, e.g. when the worker failed. Pending
    /// changes are reported so the caller can process them.
    pub fn abandon_batch(&mut self) -> bool {
        self.in_flight = None;
        std::mem::take(&mut self.rerun_pending)
    }

    /// Adoption rule for a single target: the worker must not be behind the
    /// caller and must answer the latest request.
    pub fn accepts(worker: VersionId, caller: VersionId, answered: u64, latest_request: u64) -> bool {
        worker >= caller && answered == latest_request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_advance_now_without_async() {
        let mut controller = ChangeController::new();
        assert_eq!(controller.on_change(false), ChangeDecision::AdvanceNow);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.batches_submitted(), 0);
    }

    #[test]
    fn test_batch_then_adopt() {
        let mut controller = ChangeController::new();
        let ChangeDecision::SubmitBatch(id) = controller.on_change(true) else {
            panic!("expected a batch");
        };
        assert_eq!(controller.state(), ControllerState::AwaitingAsyncQueries);

        let resolution = controller.on_batch_delivered(id, VersionId(3), VersionId(2));
        assert_eq!(resolution.outcome, BatchOutcome::Adopt);
        assert!(!resolution.rerun);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_equal_versions_adopt() {
        let mut controller = ChangeController::new();
        let ChangeDecision::SubmitBatch(id) = controller.on_change(true) else {
            panic!("expected a batch");
        };
        let resolution = controller.on_batch_delivered(id, VersionId(4), VersionId(4));
        assert_eq!(resolution.outcome, BatchOutcome::Adopt);
    }

    #[test]
    fn test_older_batch_is_discarded() {
        let mut controller = ChangeController::new();
        let ChangeDecision::SubmitBatch(id) = controller.on_change(true) else {
            panic!("expected a batch");
        };
        let resolution = controller.on_batch_delivered(id, VersionId(2), VersionId(5));
        assert_eq!(resolution.outcome, BatchOutcome::Discard);
    }

    #[test]
    fn test_changes_during_batch_coalesce() {
        let mut controller = ChangeController::new();
        let ChangeDecision::SubmitBatch(id) = controller.on_change(true) else {
            panic!("expected a batch");
        };
        for _ in 0..5 {
            assert_eq!(controller.on_change(true), ChangeDecision::Coalesced);
        }
        let resolution = controller.on_batch_delivered(id, VersionId(2), VersionId(2));
        assert!(resolution.rerun);

        assert!(matches!(controller.on_change(true), ChangeDecision::SubmitBatch(_)));
        assert_eq!(controller.batches_submitted(), 2);
    }

    #[test]
    fn test_stale_batch_id() {
        let mut controller = ChangeController::new();
        let resolution = controller.on_batch_delivered(42, VersionId(9), VersionId(1));
        assert_eq!(resolution.outcome, BatchOutcome::Discard);
        assert!(!resolution.rerun);
    }

    #[test]
    fn test_unloaded_targets_keep_awaiting() {
        let mut controller = ChangeController::new();
        controller.set_unloaded(2);
        assert_eq!(controller.state(), ControllerState::AwaitingAsyncQueries);
        controller.set_unloaded(0);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_accepts() {
        assert!(ChangeController::accepts(VersionId(3), VersionId(3), 2, 2));
        assert!(ChangeController::accepts(VersionId(4), VersionId(3), 2, 2));
        assert!(!ChangeController::accepts(VersionId(2), VersionId(3), 2, 2));
        assert!(!ChangeController::accepts(VersionId(4), VersionId(3), 1, 2));
    }

    #[derive(Clone, Debug)]
    enum Event {
        Change,
        Deliver,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![Just(Event::Change), Just(Event::Deliver)]
    }

    proptest! {
        // However many changes arrive while a batch is outstanding, at most
        // one more batch follows its delivery.
        #[test]
        fn prop_at_most_one_pending_batch(events in prop::collection::vec(event(), 1..200)) {
            let mut controller = ChangeController::new();
            let mut in_flight: Option<BatchId> = None;
            let mut deliveries = 0u64;
            for event in events {
                match event {
                    Event::Change => match controller.on_change(true) {
                        ChangeDecision::SubmitBatch(id) => {
                            prop_assert!(in_flight.is_none());
                            in_flight = Some(id);
                        }
                        ChangeDecision::Coalesced => prop_assert!(in_flight.is_some()),
                        ChangeDecision::AdvanceNow => prop_assert!(false, "async present"),
                    },
                    Event::Deliver => {
                        if let Some(id) = in_flight.take() {
                            deliveries += 1;
                            let resolution = controller.on_batch_delivered(id, VersionId(1), VersionId(1));
                            prop_assert_eq!(resolution.outcome, BatchOutcome::Adopt);
                            if resolution.rerun {
                                let next = controller.on_change(true);
                                prop_assert!(matches!(next, ChangeDecision::SubmitBatch(_)));
                                if let ChangeDecision::SubmitBatch(id) = next {
                                    in_flight = Some(id);
                                }
                            }
                        }
                    }
                }
                prop_assert_eq!(controller.in_flight(), in_flight);
                prop_assert!(controller.batches_submitted() <= deliveries + 1);
            }
        }
    }
}
