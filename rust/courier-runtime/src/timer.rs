//! Per-component timer scheduling.
//!
//! One lazily started scheduler thread per component sleeps until the
//! earliest deadline, then posts a [`TimeoutMessage`] into the owning
//! component's queue at timeout priority. The user callback therefore always
//! runs on the component thread, never on the scheduler thread.
//!
//! Timer ids are never reused, so a timeout already sitting in the queue
//! when its timer is stopped is recognized as stale at delivery time and
//! dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::component::{ComponentShared, Posted};
use crate::queue::TIMEOUT_PRIORITY;

/// Identifies one scheduled timer. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Posted into the component queue when a timer fires. Carries the callback
/// so the component loop can invoke it after the staleness check.
pub struct TimeoutMessage {
    timer_id: TimerId,
    callback: TimerCallback,
}

struct TimerJob {
    deadline: Instant,
    period: Duration,
    cyclic: bool,
    callback: TimerCallback,
}

struct TimerState {
    jobs: HashMap<TimerId, TimerJob>,
    /// One-shot timers that fired but whose timeout has not yet been
    /// delivered on the component thread. `stop()` clears entries here too,
    /// which is what makes in-queue timeouts droppable.
    fired: HashSet<TimerId>,
    shutdown: bool,
    scheduler: Option<thread::JoinHandle<()>>,
}

struct TimerShared {
    component_name: String,
    component: Weak<ComponentShared>,
    state: Mutex<TimerState>,
    tick: Condvar,
    next_id: AtomicU64,
}

/// One-shot and cyclic timer scheduler local to a component.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub(crate) fn new(component_name: String, component: Weak<ComponentShared>) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                component_name,
                component,
                state: Mutex::new(TimerState {
                    jobs: HashMap::new(),
                    fired: HashSet::new(),
                    shutdown: false,
                    scheduler: None,
                }),
                tick: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Schedule a timer. Cyclic timers reschedule themselves at fire time
    /// (not at callback completion time) until stopped.
    pub fn start(
        &self,
        period: Duration,
        callback: impl Fn() + Send + Sync + 'static,
        cyclic: bool,
    ) -> TimerId {
        let id = TimerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return id;
        }
        state.jobs.insert(
            id,
            TimerJob {
                deadline: Instant::now() + period,
                period,
                cyclic,
                callback: Arc::new(callback),
            },
        );
        self.ensure_scheduler(&mut state);
        drop(state);
        self.shared.tick.notify_all();
        id
    }

    /// Push the timer's deadline out to a full period from now. Returns
    /// false for timers that are not running.
    pub fn restart(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return false;
        };
        job.deadline = Instant::now() + job.period;
        drop(state);
        self.shared.tick.notify_all();
        true
    }

    /// Stop a timer. A timeout already queued for it will be dropped at
    /// delivery. Returns whether the timer was live.
    pub fn stop(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        let scheduled = state.jobs.remove(&id).is_some();
        let pending = state.fired.remove(&id);
        drop(state);
        self.shared.tick.notify_all();
        scheduled || pending
    }

    /// Flip a running timer between one-shot and cyclic.
    pub fn set_cyclic(&self, id: TimerId, cyclic: bool) -> bool {
        let mut state = self.shared.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.cyclic = cyclic;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.shared.state.lock().jobs.contains_key(&id)
    }

    /// Invoke a delivered timeout's callback, unless the timer was stopped
    /// after the timeout was queued.
    pub(crate) fn deliver(&self, message: TimeoutMessage) {
        let live = {
            let mut state = self.shared.state.lock();
            state.jobs.contains_key(&message.timer_id) || state.fired.remove(&message.timer_id)
        };
        if live {
            (message.callback)();
        } else {
            trace!(timer = %message.timer_id, "dropping stale timeout");
        }
    }

    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.jobs.clear();
            state.fired.clear();
            state.scheduler.take()
        };
        self.shared.tick.notify_all();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn ensure_scheduler(&self, state: &mut TimerState) {
        if state.scheduler.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-timers", self.shared.component_name))
            .spawn(move || scheduler_loop(shared));
        match spawned {
            Ok(handle) => state.scheduler = Some(handle),
            Err(error) => {
                warn!(component = %self.shared.component_name, %error, "failed to spawn timer scheduler")
            }
        }
    }
}

fn scheduler_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();

        let due_ids: Vec<TimerId> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        if due_ids.is_empty() {
            match state.jobs.values().map(|job| job.deadline).min() {
                Some(next) => {
                    let _ = shared.tick.wait_until(&mut state, next);
                }
                None => shared.tick.wait(&mut state),
            }
            continue;
        }

        let mut due = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            due.push((id, Arc::clone(&job.callback)));
            if job.cyclic {
                job.deadline += job.period;
            } else {
                state.jobs.remove(&id);
                state.fired.insert(id);
            }
        }

        // Post outside the state lock; the component queue has its own.
        drop(state);
        if let Some(component) = shared.component.upgrade() {
            for (timer_id, callback) in due {
                let posted = Posted::timeout(TimeoutMessage { timer_id, callback });
                if component.post(posted, TIMEOUT_PRIORITY).is_err() {
                    trace!(timer = %timer_id, "component queue closed, timeout dropped");
                }
            }
        }
        state = shared.state.lock();
    }
}
