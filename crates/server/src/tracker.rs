//! Per-session URB tracking
//!
//! Every in-flight submit is tracked here by its client-assigned sequence
//! number, together with the cancel handle of its device operation. The
//! completion path and the unlink path both retire entries through
//! [`UrbTracker::take`]; whichever gets there first owns the entry and
//! writes the URB's single `RET_SUBMIT`, the loser finds nothing and stays
//! silent. The table itself never suspends; waiting happens on the
//! [`tokio::sync::Notify`] it pings whenever an entry retires.

use crate::port::CancelHandle;
use common::EndpointKind;
use protocol::UrbDirection;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Notify;

/// Metadata of a tracked URB, kept for response construction
#[derive(Debug, Clone)]
pub struct Urb {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    pub kind: EndpointKind,
    pub transfer_flags: u32,
    pub buffer_length: u32,
    pub start_frame: u32,
    /// Raw wire value, echoed into the reply
    pub number_of_packets: u32,
    pub setup: [u8; 8],
    pub submitted_at: Instant,
}

/// One tracked entry: the URB plus the handle that aborts its device I/O
pub struct TrackedUrb {
    pub urb: Urb,
    pub cancel: CancelHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("seqnum {0} is already in flight")]
    DuplicateSeqnum(u32),

    #[error("per-session URB capacity exceeded")]
    CapacityExceeded,
}

/// Table of in-flight URBs for one session
///
/// Owned by a single session; lookups are by sequence number only, there is
/// no iteration surface.
pub struct UrbTracker {
    entries: Mutex<HashMap<u32, TrackedUrb>>,
    capacity: usize,
    retired: Notify,
}

impl UrbTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            retired: Notify::new(),
        }
    }

    /// Track a new in-flight URB
    pub fn insert(&self, entry: TrackedUrb) -> Result<(), TrackerError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            return Err(TrackerError::CapacityExceeded);
        }
        let seqnum = entry.urb.seqnum;
        if entries.contains_key(&seqnum) {
            return Err(TrackerError::DuplicateSeqnum(seqnum));
        }
        entries.insert(seqnum, entry);
        Ok(())
    }

    /// Atomically retire and return an entry
    ///
    /// Exactly one caller gets the entry; every later take of the same
    /// seqnum observes `None`.
    pub fn take(&self, seqnum: u32) -> Option<TrackedUrb> {
        let entry = self.entries.lock().unwrap().remove(&seqnum);
        if entry.is_some() {
            self.retired.notify_waiters();
        }
        entry
    }

    /// Fire every cancel handle and drain the table
    ///
    /// Returns how many entries were cancelled. Used on session shutdown;
    /// the cancelled operations' completion paths will find their entries
    /// gone and emit nothing.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<TrackedUrb> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            self.retired.notify_waiters();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Suspend until the table has room for another entry
    ///
    /// This is the reader's backpressure point: while the table is full no
    /// new submit is decoded, so no entry can be created.
    pub async fn wait_for_room(&self) {
        loop {
            let retired = self.retired.notified();
            if !self.is_full() {
                return;
            }
            retired.await;
        }
    }

    /// Suspend until every entry has retired
    pub async fn wait_until_empty(&self) {
        loop {
            let retired = self.retired.notified();
            if self.is_empty() {
                return;
            }
            retired.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_entry(seqnum: u32) -> TrackedUrb {
        TrackedUrb {
            urb: Urb {
                seqnum,
                devid: 0x0001_0002,
                direction: UrbDirection::In,
                ep: 1,
                kind: EndpointKind::Bulk,
                transfer_flags: 0,
                buffer_length: 64,
                start_frame: 0,
                number_of_packets: 0,
                setup: [0u8; 8],
                submitted_at: Instant::now(),
            },
            cancel: CancelHandle::new(),
        }
    }

    #[test]
    fn test_insert_take() {
        let tracker = UrbTracker::new(16);
        tracker.insert(sample_entry(1)).unwrap();
        assert_eq!(tracker.len(), 1);

        let entry = tracker.take(1).unwrap();
        assert_eq!(entry.urb.seqnum, 1);
        assert!(tracker.take(1).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_seqnum_rejected() {
        let tracker = UrbTracker::new(16);
        tracker.insert(sample_entry(7)).unwrap();
        assert_eq!(
            tracker.insert(sample_entry(7)),
            Err(TrackerError::DuplicateSeqnum(7))
        );
        // the original entry is untouched
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_seqnum_reusable_after_retire() {
        let tracker = UrbTracker::new(16);
        tracker.insert(sample_entry(7)).unwrap();
        tracker.take(7).unwrap();
        assert!(tracker.insert(sample_entry(7)).is_ok());
    }

    #[test]
    fn test_capacity_cap() {
        let tracker = UrbTracker::new(2);
        tracker.insert(sample_entry(1)).unwrap();
        tracker.insert(sample_entry(2)).unwrap();
        assert_eq!(
            tracker.insert(sample_entry(3)),
            Err(TrackerError::CapacityExceeded)
        );
        assert!(tracker.is_full());

        tracker.take(1).unwrap();
        assert!(tracker.insert(sample_entry(3)).is_ok());
    }

    #[test]
    fn test_cancel_all_fires_handles() {
        let tracker = UrbTracker::new(16);
        let entry = sample_entry(1);
        let mut cancel_rx = entry.cancel.subscribe();
        tracker.insert(entry).unwrap();
        tracker.insert(sample_entry(2)).unwrap();

        assert_eq!(tracker.cancel_all(), 2);
        assert!(tracker.is_empty());
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_room_unblocks_on_take() {
        let tracker = std::sync::Arc::new(UrbTracker::new(1));
        tracker.insert(sample_entry(1)).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_for_room().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.take(1).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let tracker = std::sync::Arc::new(UrbTracker::new(4));
        tracker.insert(sample_entry(1)).unwrap();
        tracker.insert(sample_entry(2)).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_until_empty().await;
            })
        };

        tracker.take(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.take(2).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }
}
