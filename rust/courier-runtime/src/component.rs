//! Single-threaded cooperative executor.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::queue::{MessageQueue, DEFAULT_PRIORITY};
use crate::timer::{TimeoutMessage, TimerManager};

type AnyMessage = Box<dyn Any + Send>;
type Handler = Arc<dyn Fn(AnyMessage) + Send + Sync>;

/// Consuming this message ends the component's loop. Post it to let already
/// queued messages drain first; call [`Component::stop`] to end immediately.
pub struct StopMessage;

/// Error returned by [`Component::post`] after the component stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostError;

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("component stopped")
    }
}

impl std::error::Error for PostError {}

/// A message as it travels through the queue: the concrete type's tag plus
/// the erased payload.
pub(crate) struct Posted {
    pub(crate) type_id: TypeId,
    pub(crate) payload: AnyMessage,
}

impl Posted {
    pub(crate) fn timeout(message: TimeoutMessage) -> Self {
        Self {
            type_id: TypeId::of::<TimeoutMessage>(),
            payload: Box::new(message),
        }
    }
}

pub(crate) struct ComponentShared {
    name: String,
    queue: MessageQueue<Posted>,
    handlers: Mutex<HashMap<TypeId, Handler>>,
    timers: TimerManager,
    running: AtomicBool,
}

impl ComponentShared {
    pub(crate) fn post(&self, posted: Posted, priority: u32) -> Result<(), PostError> {
        self.queue.push(posted, priority).map_err(|_| PostError)
    }
}

impl Drop for ComponentShared {
    fn drop(&mut self) {
        self.timers.shutdown();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Component>> = const { RefCell::new(None) };
}

/// Scoped binding of the active component: set on entry to `run()`, restored
/// on exit, including exit by panic.
struct CurrentGuard {
    prev: Option<Component>,
}

impl CurrentGuard {
    fn enter(component: Component) -> Self {
        let prev = CURRENT.with(|slot| slot.borrow_mut().replace(component));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|slot| *slot.borrow_mut() = prev);
    }
}

/// Clears the running flag when `run()` exits, including exit by panic.
struct RunningGuard {
    shared: Arc<ComponentShared>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Single-threaded executor bound to one OS thread for the duration of
/// [`run`](Self::run).
///
/// A component owns a priority message queue, a handler registry keyed by
/// message type, and a [`TimerManager`]. Handlers and timer callbacks always
/// execute on the component's thread, so they need no locking of their own;
/// concurrency between components is message passing.
///
/// `Component` is a cheap handle: clones share the same executor.
#[derive(Clone)]
pub struct Component {
    shared: Arc<ComponentShared>,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let shared = Arc::new_cyclic(|weak: &Weak<ComponentShared>| ComponentShared {
            name: name.clone(),
            queue: MessageQueue::new(),
            handlers: Mutex::new(HashMap::new()),
            timers: TimerManager::new(name, weak.clone()),
            running: AtomicBool::new(false),
        });
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The component whose `run()` loop the calling code executes on, if any.
    pub fn current() -> Option<Component> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Register the handler for message type `M`, replacing any previous one.
    pub fn handle<M, F>(&self, handler: F)
    where
        M: Any + Send,
        F: Fn(M) + Send + Sync + 'static,
    {
        let wrapped: Handler = Arc::new(move |payload: AnyMessage| {
            if let Ok(message) = payload.downcast::<M>() {
                handler(*message);
            }
        });
        self.shared
            .handlers
            .lock()
            .insert(TypeId::of::<M>(), wrapped);
    }

    /// Enqueue a message at the default priority.
    pub fn post<M: Any + Send>(&self, message: M) -> Result<(), PostError> {
        self.post_with_priority(message, DEFAULT_PRIORITY)
    }

    /// Enqueue a message. Higher priorities are delivered first.
    pub fn post_with_priority<M: Any + Send>(
        &self,
        message: M,
        priority: u32,
    ) -> Result<(), PostError> {
        self.shared.post(
            Posted {
                type_id: TypeId::of::<M>(),
                payload: Box::new(message),
            },
            priority,
        )
    }

    /// Pop and dispatch messages until a [`StopMessage`] is consumed or
    /// [`stop`](Self::stop) closes the queue. Binds the component to the
    /// calling thread; [`Component::current`] resolves inside handlers.
    pub fn run(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!(component = %self.shared.name, "run() called while already running");
            return;
        }
        let _running = RunningGuard {
            shared: Arc::clone(&self.shared),
        };
        let _guard = CurrentGuard::enter(self.clone());
        while let Some(posted) = self.shared.queue.pop() {
            if posted.type_id == TypeId::of::<StopMessage>() {
                debug!(component = %self.shared.name, "stop message consumed");
                break;
            }
            if posted.type_id == TypeId::of::<TimeoutMessage>() {
                if let Ok(timeout) = posted.payload.downcast::<TimeoutMessage>() {
                    self.shared.timers.deliver(*timeout);
                }
                continue;
            }
            let handler = self.shared.handlers.lock().get(&posted.type_id).cloned();
            match handler {
                Some(handler) => handler(posted.payload),
                None => {
                    debug!(component = %self.shared.name, "dropping message with no registered handler")
                }
            }
        }
    }

    /// Run the component on a new named OS thread.
    pub fn spawn(&self) -> io::Result<thread::JoinHandle<()>> {
        let component = self.clone();
        thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || component.run())
    }

    /// Close the queue: the loop exits as soon as the current handler
    /// returns, and queued messages are dropped.
    pub fn stop(&self) {
        self.shared.queue.close();
    }

    /// This component's timer manager. Timer callbacks are posted back into
    /// the queue at timeout priority and run on the component thread.
    pub fn timers(&self) -> &TimerManager {
        &self.shared.timers
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.shared.name)
            .finish()
    }
}
