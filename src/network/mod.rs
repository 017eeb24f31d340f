//! Client side of the broker link.
//!
//! A [`Session`] owns one [`BrokerTransport`] through a background task and
//! serialises the typed requests of [`request`] over it, reconnecting across
//! the bootstrap endpoints when the link drops.

pub use errors::ErrorCode;
pub use request::*;
pub use session::{EndpointState, Session};
pub use transport::{BrokerTransport, TransportError};

mod errors;
mod request;
mod session;
mod transport;
