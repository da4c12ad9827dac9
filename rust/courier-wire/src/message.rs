//! The envelope exchanged between requesters and providers.

use std::fmt;

use crate::{Address, OpId, Payload, RequestId, ServiceId};

/// Operation code of an envelope.
///
/// Discriminants are wire-significant and frozen. `Register` is the legacy
/// alias of `StatusRegister`; providers accept either as a status
/// subscription.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Invalid = 0,
    /// Client-to-server action request.
    Request = 1,
    /// Client cancels an in-flight request identified by its request id.
    Abort = 2,
    /// Legacy status subscription code, equivalent to `StatusRegister`.
    Register = 3,
    /// Client drops every subscription it holds for one operation.
    Unregister = 4,
    /// Client pulls the current value of a status property.
    StatusGet = 5,
    /// Status subscription (client to server) or status update (server to
    /// client, payload carries the property value).
    StatusRegister = 6,
    /// Signal subscription (client to server) or signal delivery (server to
    /// client, payload carries the signal).
    SignalRegister = 7,
    /// Response to a request; in-process providers echo the request's own
    /// code instead, and requesters accept both.
    Response = 8,
    /// Availability transition of a service or of a peer endpoint. The only
    /// code whose request id is meaningless.
    ServiceStatusUpdate = 9,
}

impl OpCode {
    /// Decode a wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Invalid),
            1 => Some(OpCode::Request),
            2 => Some(OpCode::Abort),
            3 => Some(OpCode::Register),
            4 => Some(OpCode::Unregister),
            5 => Some(OpCode::StatusGet),
            6 => Some(OpCode::StatusRegister),
            7 => Some(OpCode::SignalRegister),
            8 => Some(OpCode::Response),
            9 => Some(OpCode::ServiceStatusUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Invalid => "invalid",
            OpCode::Request => "request",
            OpCode::Abort => "abort",
            OpCode::Register => "register",
            OpCode::Unregister => "unregister",
            OpCode::StatusGet => "status-get",
            OpCode::StatusRegister => "status-register",
            OpCode::SignalRegister => "signal-register",
            OpCode::Response => "response",
            OpCode::ServiceStatusUpdate => "service-status-update",
        };
        f.write_str(name)
    }
}

/// A requester's view of whether its provider is reachable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Availability {
    #[default]
    Unknown = 0,
    Available = 1,
    Unavailable = 2,
}

impl Availability {
    /// Decode a wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Availability::Unknown),
            1 => Some(Availability::Available),
            2 => Some(Availability::Unavailable),
            _ => None,
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Availability::Unknown => "unknown",
            Availability::Available => "available",
            Availability::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Envelope carried between a requester and a provider.
///
/// Immutable in transit: routers stamp the source address before delivery,
/// but nothing else mutates an envelope once it leaves the sender. `Clone`
/// duplicates the payload bytes, since decoding may consume the byte stream
/// on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsMessage {
    service_id: ServiceId,
    op_id: OpId,
    op_code: OpCode,
    request_id: RequestId,
    source: Address,
    payload: Option<Payload>,
}

impl CsMessage {
    /// Create a new envelope with the local source address.
    pub fn new(
        service_id: ServiceId,
        op_id: OpId,
        op_code: OpCode,
        request_id: RequestId,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            service_id,
            op_id,
            op_code,
            request_id,
            source: Address::local(),
            payload,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn op_id(&self) -> &OpId {
        &self.op_id
    }

    pub fn op_code(&self) -> OpCode {
        self.op_code
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Clone the payload out of the envelope.
    pub fn payload_cloned(&self) -> Option<Payload> {
        self.payload.clone()
    }

    /// Stamp the source address. Routers call this on ingress; the envelope
    /// is otherwise immutable.
    pub fn set_source(&mut self, source: Address) {
        self.source = source;
    }

    /// Builder-style source override, used when constructing replies.
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }
}

impl fmt::Display for CsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} from {}",
            self.service_id, self.op_id, self.op_code, self.request_id, self.source
        )
    }
}
