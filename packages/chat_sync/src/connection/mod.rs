//! The shared push connection: state, backoff, transport and the manager actor.

mod backoff;
mod manager;
mod state;
mod transport;

pub use backoff::{Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
pub(crate) use manager::wait_until;
pub use manager::{ConnectionConfig, ConnectionHandle, ConnectionManager};
pub use state::{ConnectionState, ConnectionStatus};
pub use transport::{SseTransport, SseTransportConfig, Transport, TransportSignal};
