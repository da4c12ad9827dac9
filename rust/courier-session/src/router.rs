//! Pairing requesters with providers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use courier_wire::{Address, Availability, CsMessage, ServiceId};
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{ActionError, ActionResult};
use crate::provider::ServiceProvider;
use crate::requester::ServiceRequester;

/// The requester-facing side of a router: the non-owning handle a requester
/// keeps back to whatever delivers its envelopes to the provider side.
pub trait ClientLink: Send + Sync {
    fn send_to_server(&self, msg: CsMessage) -> ActionResult<()>;
}

/// The provider-facing side of a router.
pub trait ServerLink: Send + Sync {
    fn send_to_client(&self, msg: CsMessage, to: &Address) -> ActionResult<()>;
    fn notify_service_status(&self, service_id: &ServiceId, old: Availability, new: Availability);
}

/// Joins requesters and providers living in the same address space by
/// direct call. No serialization happens on this path.
///
/// The router owns its endpoints: requesters and providers hold only
/// non-owning links back, so dropping the router (or calling
/// [`deinit`](Self::deinit)) leaves them answering `ReceiverUnavailable`.
pub struct InProcessRouter {
    providers: Mutex<HashMap<ServiceId, Arc<ServiceProvider>>>,
    requesters: Mutex<HashMap<ServiceId, Vec<Arc<ServiceRequester>>>>,
}

impl InProcessRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            providers: Mutex::new(HashMap::new()),
            requesters: Mutex::new(HashMap::new()),
        })
    }

    /// Create and register a requester for a service.
    pub fn requester(self: &Arc<Self>, service_id: ServiceId) -> Arc<ServiceRequester> {
        let requester = ServiceRequester::new(service_id);
        self.register_requester(&requester);
        requester
    }

    /// Create and register a provider for a service, or hand back the one
    /// already registered.
    pub fn provider(self: &Arc<Self>, service_id: ServiceId) -> Arc<ServiceProvider> {
        if let Some(existing) = self.providers.lock().get(&service_id) {
            return Arc::clone(existing);
        }
        let provider = ServiceProvider::new(service_id);
        self.register_provider(&provider);
        provider
    }

    /// Register an externally created requester. If the service's provider
    /// is already serving, the requester immediately observes the
    /// `Unavailable -> Available` transition.
    pub fn register_requester(self: &Arc<Self>, requester: &Arc<ServiceRequester>) {
        requester.attach_link(self.client_link());
        self.requesters
            .lock()
            .entry(requester.service_id().clone())
            .or_default()
            .push(Arc::clone(requester));

        let serving = self
            .providers
            .lock()
            .get(requester.service_id())
            .map(|provider| provider.availability())
            == Some(Availability::Available);
        if serving {
            requester.on_service_status_changed(
                requester.service_id(),
                Availability::Unavailable,
                Availability::Available,
            );
        }
    }

    /// Register an externally created provider. A second provider for the
    /// same service is rejected. A provider that is already serving makes
    /// every waiting requester observe `Unavailable -> Available` at once.
    pub fn register_provider(self: &Arc<Self>, provider: &Arc<ServiceProvider>) -> bool {
        use std::collections::hash_map::Entry;
        let registered = match self.providers.lock().entry(provider.service_id().clone()) {
            Entry::Occupied(_) => {
                debug!(service = %provider.service_id(), "provider already registered");
                false
            }
            Entry::Vacant(slot) => {
                provider.attach_link(self.server_link());
                slot.insert(Arc::clone(provider));
                true
            }
        };
        if registered && provider.availability() == Availability::Available {
            self.notify_service_status(
                provider.service_id(),
                Availability::Unavailable,
                Availability::Available,
            );
        }
        registered
    }

    /// Drop both endpoint registries exactly once each.
    pub fn deinit(&self) {
        self.requesters.lock().clear();
        self.providers.lock().clear();
    }

    fn client_link(self: &Arc<Self>) -> Weak<dyn ClientLink> {
        let strong: Arc<dyn ClientLink> = Arc::clone(self) as Arc<dyn ClientLink>;
        Arc::downgrade(&strong)
    }

    fn server_link(self: &Arc<Self>) -> Weak<dyn ServerLink> {
        let strong: Arc<dyn ServerLink> = Arc::clone(self) as Arc<dyn ServerLink>;
        Arc::downgrade(&strong)
    }
}

impl ClientLink for InProcessRouter {
    fn send_to_server(&self, mut msg: CsMessage) -> ActionResult<()> {
        msg.set_source(Address::local());
        let provider = self.providers.lock().get(msg.service_id()).cloned();
        match provider {
            Some(provider) if provider.on_incoming_message(&msg) => Ok(()),
            _ => Err(ActionError::ReceiverUnavailable),
        }
    }
}

impl ServerLink for InProcessRouter {
    fn send_to_client(&self, msg: CsMessage, _to: &Address) -> ActionResult<()> {
        let targets: Vec<Arc<ServiceRequester>> = self
            .requesters
            .lock()
            .get(msg.service_id())
            .cloned()
            .unwrap_or_default();
        let mut handled = false;
        for requester in &targets {
            handled |= requester.on_incoming_message(&msg);
        }
        if handled {
            Ok(())
        } else {
            Err(ActionError::ReceiverUnavailable)
        }
    }

    fn notify_service_status(&self, service_id: &ServiceId, old: Availability, new: Availability) {
        let targets: Vec<Arc<ServiceRequester>> = self
            .requesters
            .lock()
            .get(service_id)
            .cloned()
            .unwrap_or_default();
        for requester in targets {
            requester.on_service_status_changed(service_id, old, new);
        }
    }
}
