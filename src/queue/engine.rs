//! Per-key request queues.
//!
//! A request that fails admission is parked in its key's priority queue and
//! its caller waits, up to `max_wait_time`, for one of: the work's result,
//! a timeout, or a clear. Each key with waiting requests gets one background
//! processor that drains the queue on a fixed tick and stops once the queue
//! is empty; [`QueueEngine::process`] triggers extra passes.

use std::any::Any;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::config::{EngineSettings, QueueConfig};
use super::policy::ProcessingPolicy;
use super::request::{Completion, QueuedRequest, RequestState};
use super::stats::{KeyQueueStats, QueueCounters, QueueStats};
use crate::error::{BoxError, Result, TurnstileError};
use crate::work::{BoxWork, Work};

struct Pending<T> {
    heap: BinaryHeap<QueuedRequest<T>>,
    next_seq: u64,
    closed: bool,
}

enum Insert<T> {
    Queued,
    Full(QueuedRequest<T>),
    Contended(QueuedRequest<T>),
    Closed(QueuedRequest<T>),
}

struct KeyQueue<T> {
    key: Arc<str>,
    config: QueueConfig,
    pending: Mutex<Pending<T>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl<T> KeyQueue<T> {
    fn new(key: &str, config: QueueConfig) -> Self {
        Self {
            key: Arc::from(key),
            config,
            pending: Mutex::new(Pending {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            processor: Mutex::new(None),
        }
    }

    fn try_insert(&self, mut request: QueuedRequest<T>, lock_timeout: Duration) -> Insert<T> {
        let Some(mut pending) = self.pending.try_lock_for(lock_timeout) else {
            return Insert::Contended(request);
        };
        if pending.closed {
            return Insert::Closed(request);
        }
        if pending.heap.len() >= self.config.max_queue_size {
            return Insert::Full(request);
        }

        let seq = pending.next_seq;
        pending.next_seq += 1;
        request.mark_queued(seq, self.config.priority_enabled, Instant::now());
        pending.heap.push(request);
        Insert::Queued
    }

    fn remove(&self, id: Uuid) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.heap.len();
        pending.heap.retain(|r| r.id() != id);
        pending.heap.len() != before
    }

    /// Pop expired heads and up to `budget` live requests.
    fn drain(&self, policy: ProcessingPolicy, settings: &EngineSettings) -> (Vec<QueuedRequest<T>>, Vec<QueuedRequest<T>>) {
        let mut pending = self.pending.lock();
        let budget = policy.budget(&self.config, pending.heap.len(), &settings.adaptive);
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut ready = Vec::new();

        while let Some(head) = pending.heap.peek() {
            if head.is_expired(now) || head.completion().is_settled() {
                expired.extend(pending.heap.pop());
                continue;
            }
            if ready.len() >= budget {
                break;
            }
            ready.extend(pending.heap.pop());
        }
        (expired, ready)
    }

    /// Refuse further inserts and hand back everything still waiting.
    fn close(&self) -> Vec<QueuedRequest<T>> {
        let mut pending = self.pending.lock();
        pending.closed = true;
        std::mem::take(&mut pending.heap).into_vec()
    }

    fn depth(&self) -> usize {
        self.pending.lock().heap.len()
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Drop the processor handle if nothing is waiting.
    ///
    /// Holds the processor lock across the depth check so an insert that
    /// lands afterwards finds no handle and starts a fresh processor.
    fn retire_processor_if_idle(&self) -> bool {
        let mut processor = self.processor.lock();
        if self.depth() > 0 {
            return false;
        }
        *processor = None;
        true
    }

    fn processor_active(&self) -> bool {
        self.processor
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

struct Shared<T> {
    queues: DashMap<String, Arc<KeyQueue<T>>>,
    counters: QueueCounters,
    settings: EngineSettings,
}

impl<T: Send + 'static> Shared<T> {
    fn run_pass(self: &Arc<Self>, queue: &KeyQueue<T>, policy: ProcessingPolicy) -> usize {
        let (expired, ready) = queue.drain(policy, &self.settings);

        for request in expired {
            self.expire(&queue.key, &request);
        }

        let dispatched = ready.len();
        for request in ready {
            self.dispatch(request);
        }
        if dispatched > 0 {
            trace!(key = %queue.key, %policy, dispatched, "Processed queue");
        }
        dispatched
    }

    fn expire(&self, key: &str, request: &QueuedRequest<T>) {
        let waited_ms = request.age(Instant::now()).as_millis() as u64;
        let settled = request.completion().settle(
            RequestState::TimedOut,
            Err(TurnstileError::QueueTimeout {
                key: key.to_string(),
                waited_ms,
            }),
        );
        if settled {
            QueueCounters::incr(&self.counters.timed_out);
            debug!(key, id = %request.id(), waited_ms, "Evicted expired request");
        }
    }

    fn dispatch(self: &Arc<Self>, mut request: QueuedRequest<T>) {
        let completion = request.completion();
        let Some(work) = request.take_work() else {
            return;
        };
        if !completion.transition(RequestState::Running) {
            return;
        }

        let shared = Arc::clone(self);
        let key = request.key().to_string();
        let id = request.id();
        tokio::spawn(async move {
            let (state, outcome) = match AssertUnwindSafe(work.execute()).catch_unwind().await {
                Ok(Ok(value)) => (RequestState::Succeeded, Ok(value)),
                Ok(Err(e)) => (RequestState::Failed, Err(TurnstileError::Execution(e))),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(key, %id, panic = %message, "Queued work panicked");
                    (
                        RequestState::Failed,
                        Err(TurnstileError::Execution(message.into())),
                    )
                }
            };
            QueueCounters::incr(&shared.counters.processed);
            if !completion.settle(state, outcome) {
                trace!(key, %id, "Work finished after the request was settled");
            }
        });
    }
}

/// Queuing engine shared by all keys.
///
/// Cheap to clone; clones share queues and counters.
pub struct QueueEngine<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> QueueEngine<T> {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: DashMap::new(),
                counters: QueueCounters::default(),
                settings,
            }),
        }
    }

    /// Run `work` now if `admission` passes, otherwise queue it under `key`.
    ///
    /// `priority` orders waiting requests, 0 first. When the queue is full,
    /// `fallback` runs if given and enabled in `config`; otherwise the call
    /// fails with [`TurnstileError::QueueFull`].
    pub async fn admit_or_queue<W, A>(
        &self,
        key: &str,
        work: W,
        admission: A,
        config: &QueueConfig,
        priority: u8,
        fallback: Option<BoxWork<T>>,
    ) -> Result<T>
    where
        W: Work<T>,
        A: FnOnce() -> bool,
    {
        if admission() {
            trace!(key, "Admitted without queuing");
            return Work::execute(Box::new(work))
                .await
                .map_err(TurnstileError::Execution);
        }

        let queue = self.queue_for(key, config);
        let (request, receiver) =
            QueuedRequest::new(queue.key.clone(), Box::new(work), priority, config.max_wait_time);
        let id = request.id();
        let completion = request.completion();
        let created_at = request.created_at();

        match queue.try_insert(request, self.shared.settings.insert_timeout) {
            Insert::Queued => {}
            Insert::Full(request) => {
                return self.overflow(key, request, config, fallback).await;
            }
            Insert::Contended(request) => {
                debug!(key, "Queue lock contended, treating as full");
                return self.overflow(key, request, config, fallback).await;
            }
            Insert::Closed(request) => {
                let cleared = TurnstileError::QueueCleared {
                    key: key.to_string(),
                };
                request.completion().transition(RequestState::Failed);
                return Err(cleared);
            }
        }

        QueueCounters::incr(&self.shared.counters.queued);
        debug!(key, %id, priority, "Request queued");
        self.ensure_processor(&queue);

        self.wait(&queue, id, completion, receiver, config.max_wait_time, created_at)
            .await
    }

    async fn wait(
        &self,
        queue: &KeyQueue<T>,
        id: Uuid,
        completion: Arc<Completion<T>>,
        mut receiver: oneshot::Receiver<Result<T>>,
        max_wait: Duration,
        created_at: Instant,
    ) -> Result<T> {
        let key = queue.key.to_string();
        if let Ok(received) = tokio::time::timeout(max_wait, &mut receiver).await {
            return received.unwrap_or_else(|_| Err(TurnstileError::QueueCleared { key }));
        }

        let waited_ms = created_at.elapsed().as_millis() as u64;
        let timed_out = completion.settle(
            RequestState::TimedOut,
            Err(TurnstileError::QueueTimeout {
                key: key.clone(),
                waited_ms,
            }),
        );
        if timed_out {
            queue.remove(id);
            QueueCounters::incr(&self.shared.counters.timed_out);
            warn!(key, %id, waited_ms, "Queued request timed out");
        }

        // Whichever settlement won is now in the channel.
        receiver
            .await
            .unwrap_or_else(|_| Err(TurnstileError::QueueTimeout { key, waited_ms }))
    }

    async fn overflow(
        &self,
        key: &str,
        request: QueuedRequest<T>,
        config: &QueueConfig,
        fallback: Option<BoxWork<T>>,
    ) -> Result<T> {
        let completion = request.completion();
        drop(request);

        let Some(fallback) = fallback.filter(|_| config.fallback_enabled) else {
            completion.transition(RequestState::Rejected);
            QueueCounters::incr(&self.shared.counters.rejected);
            warn!(key, "Queue full, request rejected");
            return Err(TurnstileError::QueueFull {
                key: key.to_string(),
            });
        };

        completion.transition(RequestState::FallbackInvoked);
        QueueCounters::incr(&self.shared.counters.fallback_invoked);
        debug!(key, "Queue full, invoking fallback");

        match tokio::time::timeout(config.fallback_timeout, fallback.execute()).await {
            Ok(Ok(value)) => {
                completion.transition(RequestState::FallbackSucceeded);
                Ok(value)
            }
            Ok(Err(e)) => {
                completion.transition(RequestState::FallbackFailed);
                Err(fallback_error(key, e))
            }
            Err(_) => {
                completion.transition(RequestState::FallbackFailed);
                warn!(key, timeout_ms = config.fallback_timeout.as_millis() as u64, "Fallback timed out");
                Err(TurnstileError::FallbackTimeout {
                    key: key.to_string(),
                    timeout: config.fallback_timeout,
                })
            }
        }
    }

    fn queue_for(&self, key: &str, config: &QueueConfig) -> Arc<KeyQueue<T>> {
        if let Some(queue) = self.shared.queues.get(key) {
            return queue.clone();
        }
        self.shared
            .queues
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, max_queue_size = config.max_queue_size, "Created queue");
                Arc::new(KeyQueue::new(key, config.clone()))
            })
            .clone()
    }

    /// Start the key's tick loop unless one is already running.
    ///
    /// The loop exits on the first tick that leaves the queue empty.
    fn ensure_processor(&self, queue: &Arc<KeyQueue<T>>) {
        let mut processor = queue.processor.lock();
        if processor.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }
        if queue.is_closed() {
            return;
        }

        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let queue = Arc::clone(queue);
        let period = self.shared.settings.process_interval;
        debug!(key = %queue.key, period_ms = period.as_millis() as u64, "Starting queue processor");

        *processor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if queue.is_closed() {
                    break;
                }
                shared.run_pass(&queue, ProcessingPolicy::Scheduled);
                if queue.retire_processor_if_idle() {
                    break;
                }
            }
            debug!(key = %queue.key, "Queue processor stopped");
        }));
    }

    /// Run one pass over `key` now. Returns how many requests were dispatched.
    pub fn process(&self, key: &str, policy: ProcessingPolicy) -> usize {
        let Some(queue) = self.shared.queues.get(key).map(|q| q.clone()) else {
            return 0;
        };
        self.shared.run_pass(&queue, policy)
    }

    /// Fail every request waiting on `key` and stop its processor.
    ///
    /// Requests already running are unaffected. Returns how many were cleared.
    pub fn clear_key(&self, key: &str) -> usize {
        let Some((_, queue)) = self.shared.queues.remove(key) else {
            return 0;
        };

        let drained = queue.close();
        if let Some(handle) = queue.processor.lock().take() {
            handle.abort();
        }

        let mut cleared = 0;
        for request in drained {
            let settled = request.completion().settle(
                RequestState::Failed,
                Err(TurnstileError::QueueCleared {
                    key: key.to_string(),
                }),
            );
            if settled {
                cleared += 1;
            }
        }
        QueueCounters::add(&self.shared.counters.cleared, cleared as u64);
        info!(key, cleared, "Cleared queue");
        cleared
    }

    /// Clear every key. Returns the total number of requests cleared.
    pub fn shutdown(&self) -> usize {
        let keys: Vec<String> = self.shared.queues.iter().map(|e| e.key().clone()).collect();
        let cleared = keys.iter().map(|key| self.clear_key(key)).sum();
        info!(keys = keys.len(), cleared, "Queue engine shut down");
        cleared
    }

    pub fn key_stats(&self, key: &str) -> KeyQueueStats {
        match self.shared.queues.get(key) {
            Some(queue) => KeyQueueStats {
                key: key.to_string(),
                depth: queue.depth(),
                processor_active: queue.processor_active(),
            },
            None => KeyQueueStats {
                key: key.to_string(),
                depth: 0,
                processor_active: false,
            },
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::from_counters(&self.shared.counters);
        for entry in self.shared.queues.iter() {
            stats.active_queues += 1;
            stats.total_depth += entry.depth();
            if entry.processor_active() {
                stats.active_processors += 1;
            }
        }
        stats
    }
}

impl<T: Send + 'static> Default for QueueEngine<T> {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

fn fallback_error(key: &str, source: BoxError) -> TurnstileError {
    match source.downcast::<TurnstileError>() {
        Ok(inner) if matches!(*inner, TurnstileError::FallbackExhausted { .. }) => *inner,
        Ok(inner) => TurnstileError::FallbackFailed {
            key: key.to_string(),
            source: inner,
        },
        Err(source) => TurnstileError::FallbackFailed {
            key: key.to_string(),
            source,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("work panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("work panicked: {}", message)
    } else {
        "work panicked".to_string()
    }
}
