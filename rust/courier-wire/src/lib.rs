#![deny(unsafe_code)]

//! Wire-level types for the courier messaging framework.
//!
//! This crate defines everything both ends of a service conversation agree
//! on: identifiers, the operation-code grammar, the `CsMessage` envelope, the
//! length-prefixed frame format used by transport-backed routers, and the
//! pluggable payload codec seam. It interprets no user payload bytes itself.

pub mod codec;
pub mod frame;

mod ids;
mod message;

pub use codec::{JsonCodec, PayloadCodec, TranslationError};
pub use frame::{FrameDecodeError, FrameEncodeError};
pub use ids::{Address, OpId, RegId, RequestId, ServiceId};
pub use message::{Availability, CsMessage, OpCode};

/// Opaque payload blob carried by an envelope.
///
/// The core only clones, stores, and forwards these bytes; interpretation is
/// the job of a [`PayloadCodec`] on either side of the wire.
pub type Payload = Vec<u8>;
