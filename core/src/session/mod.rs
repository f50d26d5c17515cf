//! Client and server connection state machines.
//!
//! Both sides share the same framing, codec, and outgoing queue; what
//! differs is who drives the handshake and who owns net-id allocation.
//! Neither session type holds a back-pointer to the [`crate::reactor::Reactor`]
//! beyond the [`mio::Token`] its socket was registered under — registration
//! and teardown happen from the tick functions below, which are handed a
//! `&mut Reactor` explicitly.

pub mod client;
pub mod server;

/// One frame's payload never exceeds the wire maximum; sessions size their
/// serializer scratch buffer to match.
pub const FRAME_CAPACITY: usize = crate::wire::frame::MAX_LENGTH as usize;
