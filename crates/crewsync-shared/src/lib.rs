//! Types shared by every crewsync crate: identifiers, the closed role
//! union, the synchronized data model and the push-channel wire protocol.

pub mod constants;
pub mod error;
pub mod model;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use model::*;
pub use protocol::{ClientEvent, EventKind, ReadScope, ServerEvent};
pub use types::*;
