//! Provider-side handle for one live request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use courier_wire::{Address, CsMessage, OpCode, OpId, Payload, RequestId};
use parking_lot::Mutex;

use crate::errors::{ActionError, ActionResult};
use crate::provider::ServiceProvider;

/// Whether a response finishes the request or is an intermediate update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Complete,
    Incomplete,
}

type AbortCallback = Box<dyn FnOnce() + Send>;

/// Handle given to a request handler, representing one request the provider
/// accepted but has not yet completed.
///
/// The keeper stays valid until it responds with
/// [`ResponseStatus::Complete`], the client aborts, or the provider stops
/// serving; after that every respond attempt fails and emits nothing.
pub struct RequestKeeper {
    request: CsMessage,
    valid: AtomicBool,
    abort_callback: Mutex<Option<AbortCallback>>,
    provider: Weak<ServiceProvider>,
}

impl RequestKeeper {
    pub(crate) fn new(request: CsMessage, provider: Weak<ServiceProvider>) -> Arc<Self> {
        Arc::new(Self {
            request,
            valid: AtomicBool::new(true),
            abort_callback: Mutex::new(None),
            provider,
        })
    }

    pub fn op_id(&self) -> &OpId {
        self.request.op_id()
    }

    pub fn op_code(&self) -> OpCode {
        self.request.op_code()
    }

    /// The request's payload, cloned out of the envelope.
    pub fn request_payload(&self) -> Option<Payload> {
        self.request.payload_cloned()
    }

    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Answer the request. `Complete` atomically invalidates the keeper and
    /// removes it from the provider's live set; `Incomplete` sends an
    /// intermediate update and keeps the keeper alive. An invalid keeper
    /// reports `InvalidParam` and sends nothing.
    pub fn respond(&self, payload: Option<Payload>, status: ResponseStatus) -> ActionResult<()> {
        match status {
            ResponseStatus::Complete => {
                if self
                    .valid
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(ActionError::InvalidParam);
                }
                match self.provider.upgrade() {
                    Some(provider) => {
                        provider.remove_active(self.op_id(), self.request_id());
                        provider.reply_to(&self.request, payload)
                    }
                    None => Err(ActionError::ReceiverUnavailable),
                }
            }
            ResponseStatus::Incomplete => {
                if !self.valid() {
                    return Err(ActionError::InvalidParam);
                }
                match self.provider.upgrade() {
                    Some(provider) => provider.reply_to(&self.request, payload),
                    None => Err(ActionError::ReceiverUnavailable),
                }
            }
        }
    }

    /// Send an intermediate update; the request stays live.
    pub fn update(&self, payload: Option<Payload>) -> ActionResult<()> {
        self.respond(payload, ResponseStatus::Incomplete)
    }

    /// Register the callback invoked when the client aborts the request or
    /// goes away. At most one callback per keeper; it fires at most once.
    pub fn aborted_by(&self, callback: impl FnOnce() + Send + 'static) {
        *self.abort_callback.lock() = Some(Box::new(callback));
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request.request_id()
    }

    pub(crate) fn source(&self) -> &Address {
        self.request.source()
    }

    /// Mark the keeper dead. Returns whether it was alive, so the abort
    /// callback fires at most once.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn fire_abort_callback(&self) {
        let callback = self.abort_callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
