//! Orders LSN acknowledgements so PostgreSQL is only told "up to X" once
//! every LSN ≤ X has finished processing, even when later LSNs' handlers
//! finish before earlier ones.

use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;
use std::collections::BTreeSet;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    processing: BTreeSet<u64>,
    pending: BTreeSet<u64>,
}

/// Tracks in-flight and finished LSNs and computes the largest LSN that is
/// safe to acknowledge.
#[derive(Debug, Default)]
pub struct AcknowledgeManager {
    state: Mutex<State>,
}

impl AcknowledgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `lsn` as in-flight. Fails if it is already registered.
    pub async fn start_processing(&self, lsn: Lsn) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        if !state.processing.insert(lsn.raw()) {
            return Err(OutboxError::AlreadyProcessing(lsn.raw()));
        }
        Ok(())
    }

    /// Mark `lsn` as finished. Returns the largest LSN now safe to
    /// acknowledge, if any advance is possible, moving every LSN below the
    /// new processing-minimum out of `pending`.
    pub async fn finish_processing(&self, lsn: Lsn) -> OutboxResult<Option<Lsn>> {
        let mut state = self.state.lock().await;
        if !state.processing.remove(&lsn.raw()) {
            return Err(OutboxError::NotRegistered(lsn.raw()));
        }
        state.pending.insert(lsn.raw());

        let watermark = state.processing.iter().next().copied().unwrap_or(u64::MAX);

        let mut ack: Option<u64> = None;
        let safe: Vec<u64> = state
            .pending
            .iter()
            .copied()
            .take_while(|&l| l < watermark)
            .collect();
        for l in safe {
            state.pending.remove(&l);
            ack = Some(l);
        }

        Ok(ack.map(Lsn::new))
    }

    #[cfg(test)]
    async fn in_flight_count(&self) -> usize {
        self.state.lock().await.processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acknowledges_largest_safe_lsn_out_of_order() {
        let mgr = AcknowledgeManager::new();
        let l1 = Lsn::parse("0/16B6E40").unwrap();
        let l2 = Lsn::parse("0/16B6E60").unwrap();
        let l3 = Lsn::parse("0/16B6E80").unwrap();

        mgr.start_processing(l1).await.unwrap();
        mgr.start_processing(l2).await.unwrap();
        mgr.start_processing(l3).await.unwrap();

        // finish #2 and #3 first: nothing is safe to ack yet, #1 is still in flight.
        assert_eq!(mgr.finish_processing(l2).await.unwrap(), None);
        assert_eq!(mgr.finish_processing(l3).await.unwrap(), None);

        // finishing #1 unblocks all three, acked as a single coalesced advance to #3.
        assert_eq!(mgr.finish_processing(l1).await.unwrap(), Some(l3));
    }

    #[tokio::test]
    async fn acknowledges_immediately_when_in_order() {
        let mgr = AcknowledgeManager::new();
        let l1 = Lsn::new(100);
        let l2 = Lsn::new(200);

        mgr.start_processing(l1).await.unwrap();
        assert_eq!(mgr.finish_processing(l1).await.unwrap(), Some(l1));

        mgr.start_processing(l2).await.unwrap();
        assert_eq!(mgr.finish_processing(l2).await.unwrap(), Some(l2));
    }

    #[tokio::test]
    async fn rejects_double_start() {
        let mgr = AcknowledgeManager::new();
        let l1 = Lsn::new(1);
        mgr.start_processing(l1).await.unwrap();
        let err = mgr.start_processing(l1).await.unwrap_err();
        assert!(matches!(err, OutboxError::AlreadyProcessing(1)));
    }

    #[tokio::test]
    async fn rejects_finish_without_start() {
        let mgr = AcknowledgeManager::new();
        let err = mgr.finish_processing(Lsn::new(1)).await.unwrap_err();
        assert!(matches!(err, OutboxError::NotRegistered(1)));
    }

    #[tokio::test]
    async fn in_flight_count_drops_to_zero_once_drained() {
        let mgr = AcknowledgeManager::new();
        let l1 = Lsn::new(1);
        mgr.start_processing(l1).await.unwrap();
        assert_eq!(mgr.in_flight_count().await, 1);
        mgr.finish_processing(l1).await.unwrap();
        assert_eq!(mgr.in_flight_count().await, 0);
    }
}
