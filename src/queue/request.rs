//! Queued requests and their single-assignment completion slot.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::work::BoxWork;

/// Lifecycle of a request that failed admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    /// Queue full, no fallback
    Rejected,
    FallbackInvoked,
    FallbackSucceeded,
    FallbackFailed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded
                | RequestState::Failed
                | RequestState::TimedOut
                | RequestState::Rejected
                | RequestState::FallbackSucceeded
                | RequestState::FallbackFailed
        )
    }
}

struct Slot<T> {
    state: RequestState,
    sender: Option<oneshot::Sender<Result<T>>>,
}

/// Result slot shared by the waiting caller and whoever settles the request.
///
/// The first terminal transition wins; later attempts return `false` and
/// change nothing. This is what resolves completion, timeout and clear races.
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Result<T>>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Arc::new(Self {
            slot: Mutex::new(Slot {
                state: RequestState::Created,
                sender: Some(sender),
            }),
        });
        (completion, receiver)
    }

    pub fn state(&self) -> RequestState {
        self.slot.lock().state
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move to another state. Terminal states drop the sender without a value.
    ///
    /// Returns `false` if the request was already settled.
    pub(crate) fn transition(&self, state: RequestState) -> bool {
        let mut slot = self.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = state;
        if state.is_terminal() {
            slot.sender = None;
        }
        true
    }

    /// Settle with a terminal state and hand `outcome` to the waiting caller.
    ///
    /// Returns `false`, discarding `outcome`, if already settled.
    pub(crate) fn settle(&self, state: RequestState, outcome: Result<T>) -> bool {
        debug_assert!(state.is_terminal());
        let sender = {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = state;
            slot.sender.take()
        };
        if let Some(sender) = sender {
            // The caller may have stopped waiting; the state still records the outcome.
            let _ = sender.send(outcome);
        }
        true
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("state", &self.state()).finish()
    }
}

/// A deferred unit of work parked in a per-key queue.
///
/// Heap order: lower rank first, then earlier insertion.
pub struct QueuedRequest<T> {
    id: Uuid,
    key: Arc<str>,
    work: Option<BoxWork<T>>,
    /// 0 is the highest priority
    priority: u8,
    /// Effective ordering priority; 0 for every request when priority is disabled
    rank: u8,
    seq: u64,
    created_at: Instant,
    enqueued_at: Instant,
    max_wait: Duration,
    completion: Arc<Completion<T>>,
}

impl<T> QueuedRequest<T> {
    pub(crate) fn new(
        key: Arc<str>,
        work: BoxWork<T>,
        priority: u8,
        max_wait: Duration,
    ) -> (Self, oneshot::Receiver<Result<T>>) {
        let (completion, receiver) = Completion::new();
        let now = Instant::now();
        let request = Self {
            id: Uuid::new_v4(),
            key,
            work: Some(work),
            priority,
            rank: priority,
            seq: 0,
            created_at: now,
            enqueued_at: now,
            max_wait,
            completion,
        };
        (request, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn completion(&self) -> Arc<Completion<T>> {
        self.completion.clone()
    }

    /// Time spent waiting as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.max_wait
    }

    pub(crate) fn mark_queued(&mut self, seq: u64, priority_enabled: bool, now: Instant) {
        self.seq = seq;
        self.rank = if priority_enabled { self.priority } else { 0 };
        self.enqueued_at = now;
        self.completion.transition(RequestState::Queued);
    }

    pub(crate) fn take_work(&mut self) -> Option<BoxWork<T>> {
        self.work.take()
    }
}

impl<T> fmt::Debug for QueuedRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("state", &self.completion.state())
            .finish()
    }
}

impl<T> PartialEq for QueuedRequest<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl<T> Eq for QueuedRequest<T> {}

impl<T> PartialOrd for QueuedRequest<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedRequest<T> {
    // BinaryHeap is a max-heap, so the request to serve next must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
