//! Task poller: keeps in-flight tasks under periodic observation until they
//! reach a terminal status, then notifies exactly once.
//!
//! The ticker is a spawned tokio task that only exists while at least one task
//! is active. It stops itself when the active set drains and is restarted by
//! the next [`TaskPoller::watch`]. Dropping the poller aborts it.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{Task, TaskSnapshot, TaskStatus};

/// Anything that can report the current status of a task by id.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch_task(&self, id: &str) -> Result<TaskSnapshot, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// A task observed for longer than this is abandoned.
    pub max_observation: Duration,
    /// Consecutive fetch failures tolerated before a task is abandoned.
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_observation: Duration::from_secs(15 * 60),
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    TimedOut,
    Unreachable,
}

/// User-visible notification, emitted once per task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Completed(Task),
    Failed(Task),
    Abandoned { task: Task, reason: AbandonReason },
}

impl TaskEvent {
    pub fn task(&self) -> &Task {
        match self {
            TaskEvent::Completed(task) | TaskEvent::Failed(task) => task,
            TaskEvent::Abandoned { task, .. } => task,
        }
    }

    fn terminal(task: Task) -> Self {
        match task.status {
            TaskStatus::Failed => TaskEvent::Failed(task),
            _ => TaskEvent::Completed(task),
        }
    }
}

struct Watch {
    since: Instant,
    failures: u32,
}

#[derive(Default)]
struct PollerState {
    tasks: HashMap<String, Task>,
    active: HashMap<String, Watch>,
    ticker: Option<JoinHandle<()>>,
    /// Bumped whenever a ticker is started or cancelled; stale tickers exit.
    epoch: u64,
    ticks: u64,
}

impl PollerState {
    fn stop_ticker(&mut self) {
        self.epoch += 1;
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    /// Fold one snapshot into local state. Returns the event to emit when the
    /// task leaves the active set.
    fn apply_snapshot(&mut self, id: &str, snapshot: &TaskSnapshot) -> Option<TaskEvent> {
        let task = self.tasks.get_mut(id)?;
        let previous = task.status;
        if !task.apply(snapshot) {
            debug!(id, from = %previous, to = %snapshot.status, "ignoring non-forward status");
            return None;
        }
        if let Some(watch) = self.active.get_mut(id) {
            watch.failures = 0;
        }
        if previous != task.status {
            debug!(id, from = %previous, to = %task.status, "task status changed");
        }
        if !task.is_terminal() {
            return None;
        }
        let task = task.clone();
        self.active.remove(id);
        info!(id, kind = %task.kind, status = %task.status, "task reached terminal state");
        Some(TaskEvent::terminal(task))
    }

    fn apply_failure(&mut self, id: &str, err: &FetchError, limit: u32) -> Option<TaskEvent> {
        let watch = self.active.get_mut(id)?;
        watch.failures += 1;
        let failures = watch.failures;
        warn!(%err, id, failures, "task status fetch failed; retrying next tick");
        if failures < limit {
            return None;
        }
        self.abandon(id, AbandonReason::Unreachable)
    }

    fn abandon(&mut self, id: &str, reason: AbandonReason) -> Option<TaskEvent> {
        self.active.remove(id)?;
        let task = self.tasks.get(id)?.clone();
        warn!(id, ?reason, status = %task.status, "giving up on task");
        Some(TaskEvent::Abandoned { task, reason })
    }

    fn expire(&mut self, max_observation: Duration) -> Vec<TaskEvent> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, w)| now.duration_since(w.since) >= max_observation)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.abandon(id, AbandonReason::TimedOut))
            .collect()
    }
}

struct Shared {
    source: Arc<dyn TaskSource>,
    config: PollerConfig,
    state: Mutex<PollerState>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, events: Vec<TaskEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                debug!("task event receiver dropped");
            }
        }
    }
}

/// Owns the local task records and the set of tasks still being polled.
pub struct TaskPoller {
    shared: Arc<Shared>,
}

impl TaskPoller {
    pub fn new(
        source: Arc<dyn TaskSource>,
        config: PollerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            source,
            config,
            state: Mutex::new(PollerState::default()),
            events: tx,
        });
        (Self { shared }, rx)
    }

    /// Start tracking `task`. Returns `false` when the id is already tracked.
    ///
    /// A task that is already terminal is recorded and notified immediately
    /// without ever being polled.
    pub fn watch(&self, task: Task) -> bool {
        let mut events = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.tasks.contains_key(&task.id) {
                debug!(id = %task.id, "task already tracked");
                return false;
            }
            let id = task.id.clone();
            if task.is_terminal() {
                events.push(TaskEvent::terminal(task.clone()));
                state.tasks.insert(id, task);
            } else {
                info!(id = %id, kind = %task.kind, "watching task");
                state.tasks.insert(id.clone(), task);
                state.active.insert(
                    id,
                    Watch {
                        since: Instant::now(),
                        failures: 0,
                    },
                );
                if state.ticker.is_none() {
                    state.epoch += 1;
                    let epoch = state.epoch;
                    state.ticker = Some(tokio::spawn(run_ticker(Arc::clone(&self.shared), epoch)));
                    debug!("poller ticker started");
                }
            }
        }
        self.shared.notify(events);
        true
    }

    /// Drop a task from local state and from polling, whatever its remote status.
    pub fn remove(&self, id: &str) -> Option<Task> {
        let mut state = self.shared.lock();
        state.active.remove(id);
        let removed = state.tasks.remove(id);
        if state.active.is_empty() && state.ticker.is_some() {
            state.stop_ticker();
            debug!("poller ticker stopped: no active tasks");
        }
        removed
    }

    /// Optimistic local update. A terminal snapshot ends polling for the task
    /// and notifies just like a polled one.
    pub fn apply_local(&self, id: &str, snapshot: &TaskSnapshot) -> bool {
        let event = {
            let mut state = self.shared.lock();
            let legal = match state.tasks.get(id) {
                Some(task) => task.status.can_transition_to(snapshot.status),
                None => return false,
            };
            if !legal {
                return false;
            }
            state.apply_snapshot(id, snapshot)
        };
        self.shared.notify(event.into_iter().collect());
        true
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.shared.lock().tasks.get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.shared.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_ticking(&self) -> bool {
        self.shared.lock().ticker.is_some()
    }

    /// Number of polling rounds performed so far.
    pub fn ticks(&self) -> u64 {
        self.shared.lock().ticks
    }

    /// Stop polling. Local records are kept; active tasks are no longer observed.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.active.clear();
        state.stop_ticker();
    }
}

impl Drop for TaskPoller {
    fn drop(&mut self) {
        self.shared.lock().stop_ticker();
    }
}

async fn run_ticker(shared: Arc<Shared>, epoch: u64) {
    let period = shared.config.poll_interval;
    loop {
        tokio::time::sleep(period).await;

        let ids: Vec<String> = {
            let mut state = shared.lock();
            if state.epoch != epoch {
                return;
            }
            if state.active.is_empty() {
                state.ticker = None;
                debug!("poller idle");
                return;
            }
            state.ticks += 1;
            state.active.keys().cloned().collect()
        };

        let fetches = ids.into_iter().map(|id| {
            let source = Arc::clone(&shared.source);
            async move {
                let outcome = source.fetch_task(&id).await;
                (id, outcome)
            }
        });
        let outcomes = join_all(fetches).await;

        let (events, idle) = {
            let mut state = shared.lock();
            if state.epoch != epoch {
                return;
            }
            let mut events = Vec::new();
            for (id, outcome) in outcomes {
                if !state.active.contains_key(&id) {
                    debug!(id, "discarding result for task no longer watched");
                    continue;
                }
                let event = match outcome {
                    Ok(snapshot) => state.apply_snapshot(&id, &snapshot),
                    Err(err) => {
                        state.apply_failure(&id, &err, shared.config.max_consecutive_failures)
                    }
                };
                events.extend(event);
            }
            events.extend(state.expire(shared.config.max_observation));
            let idle = state.active.is_empty();
            if idle {
                state.ticker = None;
                debug!("poller idle");
            }
            (events, idle)
        };

        shared.notify(events);
        if idle {
            return;
        }
    }
}
