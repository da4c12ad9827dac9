//! Transport-backed routing.
//!
//! A transport is anything that can move opaque frames between named peers
//! and report connection events. The routers here do the rest: framing
//! envelopes with the wire codec, demultiplexing received frames to local
//! requesters or providers by service id, translating availability
//! transitions, and synthesizing client-gone-off when a peer disconnects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_wire::{
    frame, Address, Availability, CsMessage, OpCode, OpId, Payload, RequestId, ServiceId,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{ActionError, ActionResult, TransportError};
use crate::provider::ServiceProvider;
use crate::requester::ServiceRequester;
use crate::router::{ClientLink, ServerLink};

/// Event a transport feeds into its router.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame arrived from a peer.
    FrameReceived { from: Address, frame: Vec<u8> },
    /// A peer connected.
    PeerConnected { addr: Address },
    /// A peer disconnected or its connection was lost.
    PeerDisconnected { addr: Address },
}

/// Byte-framed channel to named peers. Implementations live outside the
/// core; local-socket and shared-memory transports only need to deliver
/// complete frames and report connection events.
pub trait FrameTransport: Send + Sync {
    fn send_frame(&self, to: &Address, frame: &[u8]) -> Result<(), TransportError>;
}

/// Requester-side router over a transport: frames outgoing envelopes toward
/// the server peer and demuxes incoming frames to local requesters.
pub struct TransportClientRouter {
    transport: Arc<dyn FrameTransport>,
    server: Address,
    requesters: Mutex<HashMap<ServiceId, Vec<Arc<ServiceRequester>>>>,
}

impl TransportClientRouter {
    pub fn new(transport: Arc<dyn FrameTransport>, server: Address) -> Arc<Self> {
        Arc::new(Self {
            transport,
            server,
            requesters: Mutex::new(HashMap::new()),
        })
    }

    /// Create and register a requester for a service.
    pub fn requester(self: &Arc<Self>, service_id: ServiceId) -> Arc<ServiceRequester> {
        let requester = ServiceRequester::new(service_id);
        self.register_requester(&requester);
        requester
    }

    pub fn register_requester(self: &Arc<Self>, requester: &Arc<ServiceRequester>) {
        let strong: Arc<dyn ClientLink> = Arc::clone(self) as Arc<dyn ClientLink>;
        requester.attach_link(Arc::downgrade(&strong));
        self.requesters
            .lock()
            .entry(requester.service_id().clone())
            .or_default()
            .push(Arc::clone(requester));
    }

    /// Entry point for the transport's event stream.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::FrameReceived { from, frame } => match frame::decode(&frame) {
                Ok(msg) => self.deliver(msg),
                Err(error) => {
                    warn!(peer = %from, %error, "dropping undecodable frame");
                }
            },
            TransportEvent::PeerConnected { addr } => {
                debug!(peer = %addr, "peer connected");
            }
            TransportEvent::PeerDisconnected { addr } => {
                if addr != self.server {
                    return;
                }
                debug!(peer = %addr, "server connection lost");
                let all: Vec<Arc<ServiceRequester>> = {
                    let requesters = self.requesters.lock();
                    requesters.values().flatten().cloned().collect()
                };
                for requester in all {
                    requester.on_service_status_changed(
                        requester.service_id(),
                        Availability::Available,
                        Availability::Unavailable,
                    );
                }
            }
        }
    }

    fn deliver(&self, msg: CsMessage) {
        let targets: Vec<Arc<ServiceRequester>> = self
            .requesters
            .lock()
            .get(msg.service_id())
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            warn!(service = %msg.service_id(), "frame for a service with no local requester");
            return;
        }
        if msg.op_code() == OpCode::ServiceStatusUpdate {
            match decode_availability(msg.payload()) {
                Some((old, new)) => {
                    for requester in targets {
                        requester.on_service_status_changed(msg.service_id(), old, new);
                    }
                }
                None => warn!(
                    service = %msg.service_id(),
                    "service status update with a malformed payload"
                ),
            }
            return;
        }
        let mut handled = false;
        for requester in &targets {
            handled |= requester.on_incoming_message(&msg);
        }
        if !handled {
            warn!(message = %msg, "no requester consumed the frame");
        }
    }
}

impl ClientLink for TransportClientRouter {
    fn send_to_server(&self, msg: CsMessage) -> ActionResult<()> {
        let frame = frame::encode(&msg).map_err(|error| {
            warn!(%error, "envelope does not fit the wire frame");
            ActionError::InvalidParam
        })?;
        self.transport
            .send_frame(&self.server, &frame)
            .map_err(|error| {
                warn!(%error, "failed to send frame to the server");
                ActionError::ReceiverUnavailable
            })
    }
}

/// Provider-side router over a transport: demuxes incoming frames to local
/// providers (stamping the sender as the envelope source), frames outgoing
/// envelopes to their destination peers, and broadcasts availability
/// transitions.
pub struct TransportServerRouter {
    transport: Arc<dyn FrameTransport>,
    providers: Mutex<HashMap<ServiceId, Arc<ServiceProvider>>>,
    peers: Mutex<HashSet<Address>>,
}

impl TransportServerRouter {
    pub fn new(transport: Arc<dyn FrameTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            providers: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashSet::new()),
        })
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

    pub fn register_provider(self: &Arc<Self>, provider: &Arc<ServiceProvider>) -> bool {
        use std::collections::hash_map::Entry;
        let registered = match self.providers.lock().entry(provider.service_id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let strong: Arc<dyn ServerLink> = Arc::clone(self) as Arc<dyn ServerLink>;
                provider.attach_link(Arc::downgrade(&strong));
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

    /// Entry point for the transport's event stream.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::FrameReceived { from, frame } => match frame::decode(&frame) {
                Ok(mut msg) => {
                    msg.set_source(from);
                    let provider = self.providers.lock().get(msg.service_id()).cloned();
                    match provider {
                        Some(provider) => {
                            provider.on_incoming_message(&msg);
                        }
                        None => {
                            warn!(service = %msg.service_id(), "frame for an unknown service")
                        }
                    }
                }
                Err(error) => {
                    warn!(peer = %from, %error, "dropping undecodable frame");
                }
            },
            TransportEvent::PeerConnected { addr } => {
                self.peers.lock().insert(addr.clone());
                // late joiners still learn which services are up
                let serving: Vec<Arc<ServiceProvider>> = {
                    let providers = self.providers.lock();
                    providers
                        .values()
                        .filter(|p| p.availability() == Availability::Available)
                        .cloned()
                        .collect()
                };
                for provider in serving {
                    self.send_status_update(
                        provider.service_id(),
                        Availability::Unknown,
                        Availability::Available,
                        &addr,
                    );
                }
            }
            TransportEvent::PeerDisconnected { addr } => {
                self.peers.lock().remove(&addr);
                let providers: Vec<Arc<ServiceProvider>> =
                    self.providers.lock().values().cloned().collect();
                for provider in providers {
                    let gone = CsMessage::new(
                        provider.service_id().clone(),
                        OpId::none(),
                        OpCode::ServiceStatusUpdate,
                        RequestId::INVALID,
                        None,
                    )
                    .with_source(addr.clone());
                    provider.on_incoming_message(&gone);
                }
            }
        }
    }

    fn send_status_update(
        &self,
        service_id: &ServiceId,
        old: Availability,
        new: Availability,
        to: &Address,
    ) {
        let msg = CsMessage::new(
            service_id.clone(),
            OpId::none(),
            OpCode::ServiceStatusUpdate,
            RequestId::INVALID,
            Some(encode_availability(old, new)),
        );
        match frame::encode(&msg) {
            Ok(frame) => {
                if let Err(error) = self.transport.send_frame(to, &frame) {
                    debug!(peer = %to, %error, "status update not delivered");
                }
            }
            Err(error) => warn!(%error, "status update does not fit the wire frame"),
        }
    }
}

impl ServerLink for TransportServerRouter {
    fn send_to_client(&self, msg: CsMessage, to: &Address) -> ActionResult<()> {
        let frame = frame::encode(&msg).map_err(|error| {
            warn!(%error, "envelope does not fit the wire frame");
            ActionError::InvalidParam
        })?;
        self.transport.send_frame(to, &frame).map_err(|error| {
            warn!(peer = %to, %error, "failed to send frame to client");
            ActionError::ReceiverUnavailable
        })
    }

    fn notify_service_status(&self, service_id: &ServiceId, old: Availability, new: Availability) {
        let peers: Vec<Address> = self.peers.lock().iter().cloned().collect();
        for peer in peers {
            self.send_status_update(service_id, old, new, &peer);
        }
    }
}

/// Payload of a `ServiceStatusUpdate` envelope: the transition as two bytes.
fn encode_availability(old: Availability, new: Availability) -> Payload {
    vec![old as u8, new as u8]
}

fn decode_availability(payload: Option<&Payload>) -> Option<(Availability, Availability)> {
    let bytes = payload?;
    if bytes.len() != 2 {
        return None;
    }
    Some((Availability::from_u8(bytes[0])?, Availability::from_u8(bytes[1])?))
}
