// Push-channel transport: one authenticated, multiplexed event link per
// signed-in session, with typed handler dispatch and bounded reconnects.

pub mod backoff;
pub mod error;
pub mod handlers;
pub mod link;
pub mod memory;
pub mod transport;
pub mod ws;

pub use backoff::Backoff;
pub use error::TransportError;
pub use handlers::{HandlerRegistry, SubscriptionId};
pub use link::{Connector, Link};
pub use memory::{MemoryConnector, MemoryMode, MemoryPeer, MemoryServer};
pub use transport::{ConnectionState, Transport, TransportConfig};
pub use ws::WsConnector;
