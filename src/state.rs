//! In-process mixer state: the single source of truth for channels,
//! routing, master, meters, and connection status.

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{ConnectionInfo, ConnectionStatus, StoreUpdate};
