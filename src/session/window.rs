//! Bounded in-flight request window.
//!
//! Every outstanding submit occupies one slot keyed by sequence number. A
//! slot is freed when the response arrives, or manually by the window
//! monitor when the carrier never answers. Slots deliberately survive the
//! submitter's own wait deadline: a submit that timed out still occupies the
//! window until the response or a manual cancel, which is exactly the
//! saturation signal the monitor watches for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use super::{SessionError, SubmitOutcome};

/// Monitor-facing view of one occupied slot.
#[derive(Debug, Clone)]
pub struct WindowSlot {
    pub sequence: u32,
    pub offered_at: Instant,
}

pub(crate) struct PendingSlot {
    pub offered_at: Instant,
    pub responder: oneshot::Sender<Result<SubmitOutcome, SessionError>>,
    /// Freed when the slot is dropped, releasing window capacity.
    pub _permit: OwnedSemaphorePermit,
}

/// The send window of one session.
pub struct SendWindow {
    max_size: usize,
    capacity: Arc<Semaphore>,
    slots: Mutex<HashMap<u32, PendingSlot>>,
}

impl SendWindow {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            capacity: Arc::new(Semaphore::new(max_size)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, SessionError> {
        self.capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub(crate) fn insert(&self, sequence: u32, slot: PendingSlot) {
        self.slots.lock().unwrap().insert(sequence, slot);
    }

    /// Remove a slot because its response arrived.
    pub(crate) fn take(&self, sequence: u32) -> Option<PendingSlot> {
        self.slots.lock().unwrap().remove(&sequence)
    }

    /// Manually liberate a slot. Returns how long it had been pending, or
    /// `None` when the slot had already completed.
    pub fn cancel(&self, sequence: u32) -> Option<Duration> {
        self.slots
            .lock()
            .unwrap()
            .remove(&sequence)
            .map(|slot| slot.offered_at.elapsed())
    }

    /// Outstanding slots, ordered by sequence number.
    pub fn snapshot(&self) -> Vec<WindowSlot> {
        let slots = self.slots.lock().unwrap();
        let mut view: Vec<WindowSlot> = slots
            .iter()
            .map(|(&sequence, slot)| WindowSlot {
                sequence,
                offered_at: slot.offered_at,
            })
            .collect();
        view.sort_by_key(|slot| slot.sequence);
        view
    }

    /// Drop every outstanding slot; waiting submitters observe cancellation.
    pub(crate) fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}
