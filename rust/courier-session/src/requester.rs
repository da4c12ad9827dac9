//! Client-side service state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_wire::{Availability, CsMessage, OpCode, OpId, Payload, RegId, RequestId, ServiceId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{ActionError, ActionResult};
use crate::id_manager::IdManager;
use crate::observer::{ObserverHealth, ServiceStatusObserver};
use crate::reply::{SyncOutcome, SyncReply};
use crate::router::ClientLink;

/// Callback receiving a response, signal, or status payload. Abort and
/// availability loss deliver `None`.
pub type PayloadCallback = Arc<dyn Fn(Option<Payload>) + Send + Sync>;

struct CallbackEntry {
    request_id: RequestId,
    callback: PayloadCallback,
}

type CallbackTable = Mutex<HashMap<OpId, Vec<CallbackEntry>>>;

/// Client-side handle to one service.
///
/// Tracks pending requests, signal/status registrations, and the property
/// cache, and dispatches requests asynchronously or synchronously. Each
/// table sits under its own lock and no two are held at once; user callbacks
/// and observers are always invoked outside every lock.
pub struct ServiceRequester {
    service_id: ServiceId,
    status: AtomicU8,
    pending: CallbackTable,
    registrations: CallbackTable,
    property_cache: Mutex<HashMap<OpId, Payload>>,
    sync_replies: Mutex<Vec<Arc<SyncReply>>>,
    observers: Mutex<Vec<Arc<dyn ServiceStatusObserver>>>,
    ids: IdManager,
    link: Mutex<Weak<dyn ClientLink>>,
}

impl ServiceRequester {
    pub fn new(service_id: ServiceId) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            status: AtomicU8::new(Availability::Unknown as u8),
            pending: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            property_cache: Mutex::new(HashMap::new()),
            sync_replies: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            ids: IdManager::new(),
            link: Mutex::new(Weak::<crate::router::InProcessRouter>::new()),
        })
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn availability(&self) -> Availability {
        Availability::from_u8(self.status.load(Ordering::SeqCst)).unwrap_or(Availability::Unknown)
    }

    /// Wire this requester to the router that owns it. The handle is
    /// non-owning; a dead router surfaces as `ReceiverUnavailable`.
    pub fn attach_link(&self, link: Weak<dyn ClientLink>) {
        *self.link.lock() = link;
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Dispatch a request asynchronously. The callback fires exactly once:
    /// with the response payload, or with `None` on abort or availability
    /// loss.
    pub fn send_request_async(
        &self,
        op_id: &OpId,
        payload: Option<Payload>,
        callback: impl Fn(Option<Payload>) + Send + Sync + 'static,
    ) -> ActionResult<RegId> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.send_message_async(op_id, OpCode::Request, payload, Arc::new(callback))
    }

    /// Dispatch a request and block for the response up to `timeout`. On
    /// timeout the request is aborted upstream and `Timeout` reported; on
    /// availability loss the waiter is unblocked with `ServiceUnavailable`.
    pub fn send_request(
        &self,
        op_id: &OpId,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> ActionResult<Option<Payload>> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.send_message_sync(op_id, OpCode::Request, payload, timeout)
    }

    /// Drop the pending entry and tell the provider to abort the request.
    /// Unknown (already completed) requests are a no-op; the request id is
    /// reclaimed only once the link accepted the abort.
    pub fn abort_request(&self, reg_id: &RegId) -> ActionResult<()> {
        if !reg_id.valid() {
            return Err(ActionError::InvalidParam);
        }
        if !self.take_pending(reg_id) {
            return Ok(());
        }
        let msg = CsMessage::new(
            self.service_id.clone(),
            reg_id.op_id.clone(),
            OpCode::Abort,
            reg_id.request_id,
            None,
        );
        self.send_to_server(msg)?;
        self.ids.release(reg_id.request_id);
        Ok(())
    }

    // ========================================================================
    // Registrations & properties
    // ========================================================================

    /// Subscribe to a status property. The provider pushes the current value
    /// immediately and every change afterwards.
    pub fn register_status(
        &self,
        op_id: &OpId,
        callback: impl Fn(Option<Payload>) + Send + Sync + 'static,
    ) -> ActionResult<RegId> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.register_notification(op_id, OpCode::StatusRegister, Arc::new(callback))
    }

    /// Subscribe to a signal.
    pub fn register_signal(
        &self,
        op_id: &OpId,
        callback: impl Fn(Option<Payload>) + Send + Sync + 'static,
    ) -> ActionResult<RegId> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.register_notification(op_id, OpCode::SignalRegister, Arc::new(callback))
    }

    /// Drop one registration. When the last registration for the operation
    /// goes, the provider is told to unregister and the cached property is
    /// dropped.
    pub fn unregister(&self, reg_id: &RegId) -> ActionResult<()> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        if !reg_id.valid() {
            warn!(service = %self.service_id, "unregister called with an invalid reg id");
            return Err(ActionError::InvalidParam);
        }
        if let Some(0) = self.remove_entry(&self.registrations, reg_id) {
            self.property_cache.lock().remove(&reg_id.op_id);
            let msg = CsMessage::new(
                self.service_id.clone(),
                reg_id.op_id.clone(),
                OpCode::Unregister,
                reg_id.request_id,
                None,
            );
            if let Err(error) = self.send_to_server(msg) {
                debug!(service = %self.service_id, %error, "unregister not delivered");
            }
        }
        Ok(())
    }

    /// Drop every registration for one operation.
    pub fn unregister_all(&self, op_id: &OpId) -> ActionResult<()> {
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        let removed = self.registrations.lock().remove(op_id);
        let request_id = removed
            .as_ref()
            .and_then(|entries| entries.first())
            .map(|entry| entry.request_id)
            .unwrap_or(RequestId::INVALID);
        if let Some(entries) = removed {
            for entry in &entries {
                self.ids.release(entry.request_id);
            }
        }
        self.property_cache.lock().remove(op_id);
        let msg = CsMessage::new(
            self.service_id.clone(),
            op_id.clone(),
            OpCode::Unregister,
            request_id,
            None,
        );
        if let Err(error) = self.send_to_server(msg) {
            debug!(service = %self.service_id, %error, "unregister not delivered");
        }
        Ok(())
    }

    /// Current value of a status property. The cached value is used iff an
    /// active registration exists for the operation (the provider is
    /// contractually pushing updates); otherwise the value is pulled with a
    /// synchronous status get.
    pub fn get_status(&self, op_id: &OpId, timeout: Duration) -> ActionResult<Option<Payload>> {
        if self.cached_up_to_date(op_id) {
            return Ok(self.property_cache.lock().get(op_id).cloned());
        }
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.send_message_sync(op_id, OpCode::StatusGet, None, timeout)
    }

    /// Like [`get_status`](Self::get_status) but the value is handed to the
    /// callback: inline when the cache is up to date, otherwise once the
    /// provider answers the status get.
    pub fn get_status_async(
        &self,
        op_id: &OpId,
        callback: impl Fn(Option<Payload>) + Send + Sync + 'static,
    ) -> ActionResult<()> {
        if self.cached_up_to_date(op_id) {
            let cached = self.property_cache.lock().get(op_id).cloned();
            callback(cached);
            return Ok(());
        }
        if self.service_unavailable() {
            return Err(ActionError::ServiceUnavailable);
        }
        self.send_message_async(op_id, OpCode::StatusGet, None, Arc::new(callback))
            .map(|_| ())
    }

    // ========================================================================
    // Availability observation
    // ========================================================================

    /// Add an observer. Appending and reading the current status happen in
    /// one critical section so the observer cannot miss a transition in
    /// between; the notification itself runs outside the lock.
    pub fn register_service_status_observer(&self, observer: Arc<dyn ServiceStatusObserver>) {
        let current = {
            let mut observers = self.observers.lock();
            let current = self.availability();
            observers.push(observer.clone());
            current
        };
        if current == Availability::Available {
            let health = observer.on_service_status_changed(
                &self.service_id,
                Availability::Unknown,
                Availability::Available,
            );
            if health == ObserverHealth::Defunct {
                self.remove_observer(&observer);
            }
        }
    }

    /// Remove an observer by identity.
    pub fn unregister_service_status_observer(&self, observer: &Arc<dyn ServiceStatusObserver>) {
        self.remove_observer(observer);
    }

    /// Router-side entry point for availability transitions.
    ///
    /// Becoming unavailable aborts every sync waiter, drops pending
    /// requests, and clears registrations together with the property cache;
    /// the user is expected to re-register once the service comes back.
    pub fn on_service_status_changed(
        &self,
        service_id: &ServiceId,
        old: Availability,
        new: Availability,
    ) {
        if service_id != &self.service_id || new == self.availability() {
            return;
        }
        debug!(service = %self.service_id, %old, %new, "service availability changed");
        self.status.store(new as u8, Ordering::SeqCst);
        if new == Availability::Unavailable {
            self.abort_all_sync_requests();
            self.clear_table(&self.pending);
            self.clear_table(&self.registrations);
            self.property_cache.lock().clear();
        }
        self.notify_observers(old, new);
    }

    // ========================================================================
    // Incoming envelopes
    // ========================================================================

    /// Dispatch an envelope from the provider side. Returns whether this
    /// requester consumed it.
    pub fn on_incoming_message(&self, msg: &CsMessage) -> bool {
        if msg.service_id() != &self.service_id {
            return false;
        }
        match msg.op_code() {
            OpCode::SignalRegister => {
                self.deliver_updates(msg);
                true
            }
            OpCode::StatusRegister => {
                if self.deliver_updates(msg) {
                    if let Some(payload) = msg.payload_cloned() {
                        self.property_cache
                            .lock()
                            .insert(msg.op_id().clone(), payload);
                    }
                }
                true
            }
            OpCode::Request | OpCode::StatusGet | OpCode::Response => {
                self.complete_pending(msg);
                true
            }
            other => {
                warn!(
                    service = %self.service_id,
                    op_code = %other,
                    "response op code matches no request code"
                );
                false
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn service_unavailable(&self) -> bool {
        self.availability() != Availability::Available
    }

    fn send_to_server(&self, msg: CsMessage) -> ActionResult<()> {
        let link = self.link.lock().upgrade();
        match link {
            Some(link) => link.send_to_server(msg),
            None => Err(ActionError::ReceiverUnavailable),
        }
    }

    fn send_message_async(
        &self,
        op_id: &OpId,
        op_code: OpCode,
        payload: Option<Payload>,
        callback: PayloadCallback,
    ) -> ActionResult<RegId> {
        let (reg_id, _) = self.store_entry(&self.pending, op_id, callback);
        let msg = CsMessage::new(
            self.service_id.clone(),
            op_id.clone(),
            op_code,
            reg_id.request_id,
            payload,
        );
        match self.send_to_server(msg) {
            Ok(()) => Ok(reg_id),
            Err(error) => {
                self.remove_entry(&self.pending, &reg_id);
                Err(error)
            }
        }
    }

    fn send_message_sync(
        &self,
        op_id: &OpId,
        op_code: OpCode,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> ActionResult<Option<Payload>> {
        let reply = Arc::new(SyncReply::new());
        self.sync_replies.lock().push(Arc::clone(&reply));

        let reply_in_callback = Arc::clone(&reply);
        let sent = self.send_message_async(
            op_id,
            op_code,
            payload,
            Arc::new(move |response| {
                reply_in_callback.complete(SyncOutcome::Response(response));
            }),
        );
        let reg_id = match sent {
            Ok(reg_id) => reg_id,
            Err(error) => {
                self.remove_sync_reply(&reply);
                return Err(error);
            }
        };

        let outcome = reply.wait(timeout);
        self.remove_sync_reply(&reply);
        match outcome {
            Some(SyncOutcome::Response(payload)) => Ok(payload),
            Some(SyncOutcome::Aborted) => Err(ActionError::ServiceUnavailable),
            None => {
                warn!(
                    service = %self.service_id,
                    request = %reg_id.request_id,
                    "sync request expired, asking the provider to abort"
                );
                if let Err(error) = self.abort_request(&reg_id) {
                    debug!(service = %self.service_id, %error, "abort after timeout not delivered");
                }
                Err(ActionError::Timeout)
            }
        }
    }

    fn register_notification(
        &self,
        op_id: &OpId,
        op_code: OpCode,
        callback: PayloadCallback,
    ) -> ActionResult<RegId> {
        let (reg_id, count) = self.store_entry(&self.registrations, op_id, Arc::clone(&callback));
        if count == 1 {
            let msg = CsMessage::new(
                self.service_id.clone(),
                op_id.clone(),
                op_code,
                reg_id.request_id,
                None,
            );
            if let Err(error) = self.send_to_server(msg) {
                self.remove_entry(&self.registrations, &reg_id);
                return Err(error);
            }
        } else if op_code == OpCode::StatusRegister {
            // the provider already pushes this property; replay the cache to
            // the new callback
            let cached = self.property_cache.lock().get(op_id).cloned();
            if let Some(value) = cached {
                callback(Some(value));
            }
        }
        Ok(reg_id)
    }

    fn store_entry(
        &self,
        table: &CallbackTable,
        op_id: &OpId,
        callback: PayloadCallback,
    ) -> (RegId, usize) {
        let request_id = self.ids.allocate();
        let mut table = table.lock();
        let entries = table.entry(op_id.clone()).or_default();
        entries.push(CallbackEntry {
            request_id,
            callback,
        });
        (RegId::new(op_id.clone(), request_id), entries.len())
    }

    /// Remove one entry and reclaim its id. Returns how many entries remain
    /// for the operation, or `None` when the entry was not present.
    fn remove_entry(&self, table: &CallbackTable, reg_id: &RegId) -> Option<usize> {
        let remaining = {
            let mut table = table.lock();
            let entries = table.get_mut(&reg_id.op_id)?;
            let pos = entries
                .iter()
                .position(|entry| entry.request_id == reg_id.request_id)?;
            entries.remove(pos);
            let remaining = entries.len();
            if remaining == 0 {
                table.remove(&reg_id.op_id);
            }
            remaining
        };
        self.ids.release(reg_id.request_id);
        Some(remaining)
    }

    /// Remove a pending entry without reclaiming the id; aborts reclaim only
    /// once the link accepted the abort envelope.
    fn take_pending(&self, reg_id: &RegId) -> bool {
        let mut pending = self.pending.lock();
        let Some(entries) = pending.get_mut(&reg_id.op_id) else {
            return false;
        };
        let Some(pos) = entries
            .iter()
            .position(|entry| entry.request_id == reg_id.request_id)
        else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            pending.remove(&reg_id.op_id);
        }
        true
    }

    fn deliver_updates(&self, msg: &CsMessage) -> bool {
        let callbacks: Vec<PayloadCallback> = {
            let registrations = self.registrations.lock();
            registrations
                .get(msg.op_id())
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.callback)).collect())
                .unwrap_or_default()
        };
        for callback in &callbacks {
            // every callback gets its own copy, decoding may consume the bytes
            callback(msg.payload_cloned());
        }
        !callbacks.is_empty()
    }

    fn complete_pending(&self, msg: &CsMessage) {
        let callback = {
            let mut pending = self.pending.lock();
            let mut found = None;
            if let Some(entries) = pending.get_mut(msg.op_id()) {
                if let Some(pos) = entries
                    .iter()
                    .position(|entry| entry.request_id == msg.request_id())
                {
                    found = Some(entries.remove(pos).callback);
                    if entries.is_empty() {
                        pending.remove(msg.op_id());
                    }
                }
            }
            found
        };
        match callback {
            Some(callback) => {
                self.ids.release(msg.request_id());
                callback(msg.payload_cloned());
            }
            None => warn!(
                service = %self.service_id,
                op = %msg.op_id(),
                request = %msg.request_id(),
                "no pending entry for this response"
            ),
        }
    }

    fn cached_up_to_date(&self, op_id: &OpId) -> bool {
        self.registrations.lock().contains_key(op_id)
    }

    fn abort_all_sync_requests(&self) {
        let replies: Vec<Arc<SyncReply>> = {
            let mut sync_replies = self.sync_replies.lock();
            sync_replies.drain(..).collect()
        };
        if !replies.is_empty() {
            debug!(
                service = %self.service_id,
                count = replies.len(),
                "unblocking sync waiters"
            );
        }
        for reply in replies {
            reply.complete(SyncOutcome::Aborted);
        }
    }

    fn clear_table(&self, table: &CallbackTable) {
        let dropped: Vec<CallbackEntry> = {
            let mut table = table.lock();
            table.drain().flat_map(|(_, entries)| entries).collect()
        };
        for entry in &dropped {
            self.ids.release(entry.request_id);
        }
    }

    fn notify_observers(&self, old: Availability, new: Availability) {
        let snapshot: Vec<Arc<dyn ServiceStatusObserver>> = self.observers.lock().clone();
        let mut defunct = Vec::new();
        for observer in &snapshot {
            let health = observer.on_service_status_changed(&self.service_id, old, new);
            if health == ObserverHealth::Defunct {
                defunct.push(Arc::clone(observer));
            }
        }
        if !defunct.is_empty() {
            warn!(
                service = %self.service_id,
                count = defunct.len(),
                "removing defunct service status observers"
            );
            let mut observers = self.observers.lock();
            observers.retain(|o| !defunct.iter().any(|d| Arc::ptr_eq(o, d)));
        }
    }

    fn remove_observer(&self, observer: &Arc<dyn ServiceStatusObserver>) {
        self.observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn remove_sync_reply(&self, reply: &Arc<SyncReply>) {
        self.sync_replies
            .lock()
            .retain(|r| !Arc::ptr_eq(r, reply));
    }
}

impl Drop for ServiceRequester {
    fn drop(&mut self) {
        self.abort_all_sync_requests();
    }
}
