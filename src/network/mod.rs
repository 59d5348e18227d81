//! UDP frame transport
//!
//! One socket bound to the local receive port and one unbound socket
//! sending to the peer's receive port. Sends are fire-and-forget; receives
//! poll with a short timeout so the pipelines stay responsive to stop.

pub mod transport;
pub mod udp;

pub use transport::{FrameReceiver, FrameSender, FrameTransport};
pub use udp::{bind_receiver, bind_sender, is_transient};
