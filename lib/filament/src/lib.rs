//! The broker engine: wire protocol plumbing and the message-routing core.
//!
//! `net` owns everything that touches bytes (framing constants, the typed
//! message model, the resumable parser and the packers). `broker` owns the
//! long-running server state (client records and queues, the registry, UID
//! allocation, routing, discovery coordination and the service loop).

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod broker;
pub mod net;
