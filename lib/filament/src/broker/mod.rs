//! The long-running broker: client records and queues, the registry, UID
//! allocation, routing, discovery coordination and the service loop.

pub mod client;
pub mod core;
pub mod discovery;
pub mod handles;
pub mod registry;
pub mod responder;
pub mod routing;
pub mod socket_manager;
pub mod threads;
pub mod uid;

/// Dense integer identifying one client connection for its whole life.
pub type ClientHandle = i32;

/// Never assigned to a live connection.
pub const INVALID_HANDLE: ClientHandle = -1;
