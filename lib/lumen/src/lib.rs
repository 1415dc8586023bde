#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Highest E1.33 protocol version spoken by this implementation.
pub const E133_VERSION: u16 = 1;

/// Scope joined by components that have not been configured otherwise.
pub const DEFAULT_SCOPE: &str = "default";

/// Padded on-wire width of a scope string, including the NUL terminator.
pub const SCOPE_STRING_PADDED_LENGTH: usize = 63;
/// Padded on-wire width of a DNS search domain string.
pub const DOMAIN_STRING_PADDED_LENGTH: usize = 231;
/// Padded on-wire width of the manufacturer, model and service name strings.
pub const LABEL_STRING_PADDED_LENGTH: usize = 63;

pub mod logging;
pub mod shared;
pub mod time;
pub mod uid;

pub use crate::shared::{BrokerError, BrokerResult};
pub use crate::uid::{Cid, Uid};
