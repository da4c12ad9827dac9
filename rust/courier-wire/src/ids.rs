//! Identifiers shared by requesters, providers, and routers.

use std::fmt;

/// Identifies a logical service endpoint. Unique within a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a new service id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

/// Identifies one operation within a service: a request type, a signal, or a
/// status property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(String);

impl OpId {
    /// Create a new operation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The empty operation id, used by envelopes that address the whole
    /// service rather than one operation (service status updates).
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Get the raw string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OpId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for OpId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

/// Identifies an in-flight request or registration within a requester.
///
/// Zero is reserved as the invalid id; allocators start at one and ids are
/// reused only after reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// The reserved invalid id.
    pub const INVALID: Self = Self(0);

    /// Create a new request id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check whether this id is valid (non-zero).
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// Identity of one active registration or pending request: the operation it
/// targets plus the request id allocated for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegId {
    pub op_id: OpId,
    pub request_id: RequestId,
}

impl RegId {
    /// Create a new registration id.
    pub fn new(op_id: OpId, request_id: RequestId) -> Self {
        Self { op_id, request_id }
    }

    /// An id that identifies nothing, returned on caller-error paths.
    pub fn invalid() -> Self {
        Self {
            op_id: OpId::none(),
            request_id: RequestId::INVALID,
        }
    }

    /// Check whether this id refers to a live allocation.
    pub fn valid(&self) -> bool {
        self.request_id.is_valid()
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op_id, self.request_id)
    }
}

/// Opaque endpoint identity. The intra-process router uses the local address
/// (empty name, port zero); transports assign whatever names their peers go
/// by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub name: String,
    pub port: u16,
}

impl Address {
    /// Create a new address.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// The address of the local (intra-process) endpoint.
    pub fn local() -> Self {
        Self::default()
    }

    /// Check whether this is the local endpoint address.
    pub fn is_local(&self) -> bool {
        self.name.is_empty() && self.port == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "addr:local")
        } else {
            write!(f, "addr:{}:{}", self.name, self.port)
        }
    }
}
