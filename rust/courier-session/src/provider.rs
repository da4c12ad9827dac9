//! Server-side service state machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use courier_wire::{Address, Availability, CsMessage, OpCode, OpId, Payload, RequestId, ServiceId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{ActionError, ActionResult};
use crate::request_keeper::RequestKeeper;
use crate::router::ServerLink;

/// Handler invoked for every incoming request of one operation.
pub type RequestHandler = Arc<dyn Fn(Arc<RequestKeeper>) + Send + Sync>;

/// Server-side owner of a service.
///
/// Holds the request-handler registry, the set of live [`RequestKeeper`]s,
/// the per-client subscription table, and the authoritative status values.
/// Each table sits under its own lock and no two are held at once; handlers
/// run outside every lock.
pub struct ServiceProvider {
    service_id: ServiceId,
    availability: AtomicU8,
    handlers: Mutex<HashMap<OpId, RequestHandler>>,
    active: Mutex<HashMap<OpId, Vec<Arc<RequestKeeper>>>>,
    subscribers: Mutex<HashMap<Address, HashSet<OpId>>>,
    statuses: Mutex<HashMap<OpId, Payload>>,
    link: Mutex<Weak<dyn ServerLink>>,
}

impl ServiceProvider {
    pub fn new(service_id: ServiceId) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            availability: AtomicU8::new(Availability::Unavailable as u8),
            handlers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            link: Mutex::new(Weak::<crate::router::InProcessRouter>::new()),
        })
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn availability(&self) -> Availability {
        Availability::from_u8(self.availability.load(Ordering::SeqCst))
            .unwrap_or(Availability::Unavailable)
    }

    /// Wire this provider to the router that owns it.
    pub fn attach_link(&self, link: Weak<dyn ServerLink>) {
        *self.link.lock() = link;
    }

    // ========================================================================
    // Handler registry
    // ========================================================================

    /// Register the handler for one operation. A second registration for the
    /// same operation is rejected.
    pub fn register_request_handler(
        &self,
        op_id: &OpId,
        handler: impl Fn(Arc<RequestKeeper>) + Send + Sync + 'static,
    ) -> bool {
        use std::collections::hash_map::Entry;
        match self.handlers.lock().entry(op_id.clone()) {
            Entry::Occupied(_) => {
                warn!(service = %self.service_id, op = %op_id, "request handler already registered");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                true
            }
        }
    }

    pub fn unregister_request_handler(&self, op_id: &OpId) -> bool {
        self.handlers.lock().remove(op_id).is_some()
    }

    // ========================================================================
    // Statuses & signals
    // ========================================================================

    /// Store the authoritative value of a status property and push it to
    /// every subscriber. Setting a value equal to the stored one (byte
    /// equality of the encoded payload) skips the broadcast.
    pub fn set_status(&self, op_id: &OpId, payload: Payload) -> ActionResult<()> {
        let changed = {
            let mut statuses = self.statuses.lock();
            match statuses.get(op_id) {
                Some(previous) if *previous == payload => false,
                _ => {
                    statuses.insert(op_id.clone(), payload.clone());
                    true
                }
            }
        };
        if !changed {
            debug!(service = %self.service_id, op = %op_id, "status unchanged, broadcast skipped");
            return Ok(());
        }
        self.broadcast(op_id, OpCode::StatusRegister, Some(payload))
    }

    /// Push a signal to every subscriber. Signals are not cached.
    pub fn broadcast_signal(&self, op_id: &OpId, payload: Payload) -> ActionResult<()> {
        self.broadcast(op_id, OpCode::SignalRegister, Some(payload))
    }

    /// The stored value of a status property.
    pub fn get_status(&self, op_id: &OpId) -> Option<Payload> {
        self.statuses.lock().get(op_id).cloned()
    }

    // ========================================================================
    // Serving lifecycle
    // ========================================================================

    /// Become available and announce the transition through the router.
    pub fn start_serving(&self) {
        let old = self.swap_availability(Availability::Available);
        if old != Availability::Available {
            self.notify_availability(old, Availability::Available);
        }
    }

    /// Become unavailable: every live request keeper is invalidated, the
    /// subscriber table and status store are cleared, and the transition is
    /// broadcast.
    pub fn stop_serving(&self) {
        let old = self.swap_availability(Availability::Unavailable);
        if old == Availability::Unavailable {
            return;
        }
        let keepers: Vec<Arc<RequestKeeper>> = {
            let mut active = self.active.lock();
            active.drain().flat_map(|(_, keepers)| keepers).collect()
        };
        for keeper in &keepers {
            keeper.invalidate();
        }
        self.subscribers.lock().clear();
        self.statuses.lock().clear();
        self.notify_availability(old, Availability::Unavailable);
    }

    // ========================================================================
    // Incoming envelopes
    // ========================================================================

    /// Dispatch an envelope from a requester. Returns whether this provider
    /// consumed it.
    pub fn on_incoming_message(self: &Arc<Self>, msg: &CsMessage) -> bool {
        if msg.service_id() != &self.service_id {
            return false;
        }
        match msg.op_code() {
            OpCode::Register | OpCode::StatusRegister => self.subscribe(msg, true),
            OpCode::SignalRegister => self.subscribe(msg, false),
            OpCode::Unregister => self.unsubscribe(msg),
            OpCode::Request => self.handle_request(msg),
            OpCode::StatusGet => self.answer_status_get(msg),
            OpCode::Abort => self.abort_active(msg),
            OpCode::ServiceStatusUpdate => self.client_gone(msg.source()),
            other => {
                warn!(service = %self.service_id, op_code = %other, "unexpected op code at provider");
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Subscribe `(source, op)`. Status subscriptions get the stored value
    /// echoed back immediately, carrying the subscriber's request id.
    fn subscribe(&self, msg: &CsMessage, replay_status: bool) {
        {
            let mut subscribers = self.subscribers.lock();
            subscribers
                .entry(msg.source().clone())
                .or_default()
                .insert(msg.op_id().clone());
        }
        if replay_status {
            let stored = self.statuses.lock().get(msg.op_id()).cloned();
            if let Some(value) = stored {
                let update = CsMessage::new(
                    self.service_id.clone(),
                    msg.op_id().clone(),
                    OpCode::StatusRegister,
                    msg.request_id(),
                    Some(value),
                );
                if let Err(error) = self.send_to_client(update, msg.source()) {
                    warn!(
                        service = %self.service_id,
                        client = %msg.source(),
                        %error,
                        "failed to replay status to new subscriber"
                    );
                }
            }
        }
    }

    fn unsubscribe(&self, msg: &CsMessage) {
        let mut subscribers = self.subscribers.lock();
        if let Some(ops) = subscribers.get_mut(msg.source()) {
            ops.remove(msg.op_id());
            if ops.is_empty() {
                subscribers.remove(msg.source());
            }
        }
    }

    fn handle_request(self: &Arc<Self>, msg: &CsMessage) {
        let handler = self.handlers.lock().get(msg.op_id()).cloned();
        let Some(handler) = handler else {
            warn!(
                service = %self.service_id,
                op = %msg.op_id(),
                "no handler registered, answering with an empty payload"
            );
            if let Err(error) = self.reply_to(msg, None) {
                debug!(service = %self.service_id, %error, "empty answer not delivered");
            }
            return;
        };
        let keeper = RequestKeeper::new(msg.clone(), Arc::downgrade(self));
        self.active
            .lock()
            .entry(msg.op_id().clone())
            .or_default()
            .push(Arc::clone(&keeper));
        handler(keeper);
    }

    fn answer_status_get(&self, msg: &CsMessage) {
        let value = self.statuses.lock().get(msg.op_id()).cloned();
        if let Err(error) = self.reply_to(msg, value) {
            warn!(service = %self.service_id, %error, "status get answer not delivered");
        }
    }

    fn abort_active(&self, msg: &CsMessage) {
        match self.take_active(msg.op_id(), msg.request_id()) {
            Some(keeper) => {
                if keeper.invalidate() {
                    keeper.fire_abort_callback();
                }
            }
            None => debug!(
                service = %self.service_id,
                op = %msg.op_id(),
                request = %msg.request_id(),
                "abort for a request that is no longer live"
            ),
        }
    }

    /// A client went away: drop its subscriptions and abort its in-flight
    /// requests.
    fn client_gone(&self, addr: &Address) {
        debug!(service = %self.service_id, client = %addr, "client went away");
        self.subscribers.lock().remove(addr);
        let orphaned: Vec<Arc<RequestKeeper>> = {
            let mut active = self.active.lock();
            let mut orphaned = Vec::new();
            active.retain(|_, keepers| {
                keepers.retain(|keeper| {
                    if keeper.source() == addr {
                        orphaned.push(Arc::clone(keeper));
                        false
                    } else {
                        true
                    }
                });
                !keepers.is_empty()
            });
            orphaned
        };
        for keeper in orphaned {
            if keeper.invalidate() {
                keeper.fire_abort_callback();
            }
        }
    }

    fn broadcast(&self, op_id: &OpId, op_code: OpCode, payload: Option<Payload>) -> ActionResult<()> {
        let targets: Vec<Address> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(_, ops)| ops.contains(op_id))
                .map(|(addr, _)| addr.clone())
                .collect()
        };
        for to in targets {
            let msg = CsMessage::new(
                self.service_id.clone(),
                op_id.clone(),
                op_code,
                RequestId::INVALID,
                payload.clone(),
            );
            if let Err(error) = self.send_to_client(msg, &to) {
                warn!(
                    service = %self.service_id,
                    op = %op_id,
                    client = %to,
                    %error,
                    "broadcast not delivered"
                );
            }
        }
        Ok(())
    }

    /// Answer a request envelope, echoing its op code so the requester's
    /// pending lookup matches for requests and status gets alike.
    pub(crate) fn reply_to(&self, request: &CsMessage, payload: Option<Payload>) -> ActionResult<()> {
        let reply = CsMessage::new(
            self.service_id.clone(),
            request.op_id().clone(),
            request.op_code(),
            request.request_id(),
            payload,
        );
        self.send_to_client(reply, request.source())
    }

    pub(crate) fn remove_active(&self, op_id: &OpId, request_id: RequestId) {
        let _ = self.take_active(op_id, request_id);
    }

    fn take_active(&self, op_id: &OpId, request_id: RequestId) -> Option<Arc<RequestKeeper>> {
        let mut active = self.active.lock();
        let keepers = active.get_mut(op_id)?;
        let pos = keepers
            .iter()
            .position(|keeper| keeper.request_id() == request_id)?;
        let keeper = keepers.remove(pos);
        if keepers.is_empty() {
            active.remove(op_id);
        }
        Some(keeper)
    }

    fn send_to_client(&self, msg: CsMessage, to: &Address) -> ActionResult<()> {
        let link = self.link.lock().upgrade();
        match link {
            Some(link) => link.send_to_client(msg, to),
            None => Err(ActionError::ReceiverUnavailable),
        }
    }

    fn notify_availability(&self, old: Availability, new: Availability) {
        let link = self.link.lock().upgrade();
        match link {
            Some(link) => link.notify_service_status(&self.service_id, old, new),
            None => debug!(
                service = %self.service_id,
                %old,
                %new,
                "availability changed with no router attached"
            ),
        }
    }

    fn swap_availability(&self, new: Availability) -> Availability {
        Availability::from_u8(self.availability.swap(new as u8, Ordering::SeqCst))
            .unwrap_or(Availability::Unavailable)
    }
}
