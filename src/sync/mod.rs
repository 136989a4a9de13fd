mod channel;
mod ports;

pub use channel::{Inbound, PeerEndpoint, SeqTracker};
pub use ports::SessionPorts;
