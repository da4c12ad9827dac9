#![deny(unsafe_code)]

//! courier - client-server messaging framework
//!
//! This crate provides a unified API for the courier messaging runtime.
//! Users should depend on this crate rather than the individual component
//! crates.
//!
//! Two layers live here:
//!
//! - **Components**: single-threaded executors with a priority message loop
//!   and a timer manager ([`Component`], [`TimerManager`]).
//! - **Services**: requesters and providers exchanging requests, signals,
//!   and status properties through a router ([`ServiceRequester`],
//!   [`ServiceProvider`], [`InProcessRouter`], and the transport-backed
//!   routers).
//!
//! ```
//! use courier::{InProcessRouter, OpId, ResponseStatus, ServiceId};
//! use std::time::Duration;
//!
//! let router = InProcessRouter::new();
//! let provider = router.provider(ServiceId::from("greeter"));
//! provider.register_request_handler(&OpId::from("hello"), |keeper| {
//!     let name = keeper.request_payload();
//!     let _ = keeper.respond(name, ResponseStatus::Complete);
//! });
//! provider.start_serving();
//!
//! let requester = router.requester(ServiceId::from("greeter"));
//! let reply = requester
//!     .send_request(&OpId::from("hello"), Some(b"ada".to_vec()), Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(reply, Some(b"ada".to_vec()));
//! ```

// Wire-level types, frames, and the payload codec seam.
pub use courier_wire::{
    frame, Address, Availability, CsMessage, FrameDecodeError, FrameEncodeError, JsonCodec, OpCode,
    OpId, Payload, PayloadCodec, RegId, RequestId, ServiceId, TranslationError,
};

// The component runtime.
pub use courier_runtime::{
    Component, MessageQueue, PostError, QueueClosed, StopMessage, TimeoutMessage, TimerId,
    TimerManager, DEFAULT_PRIORITY, TIMEOUT_PRIORITY,
};

// Service endpoints and routers.
pub use courier_session::{
    ActionError, ActionResult, ClientLink, FrameTransport, IdManager, InProcessRouter,
    ObserverHealth, RequestHandler, RequestKeeper, ResponseStatus, ServerLink, ServiceProvider,
    ServiceRequester, ServiceStatusObserver, TransportClientRouter, TransportError,
    TransportEvent, TransportServerRouter,
};
