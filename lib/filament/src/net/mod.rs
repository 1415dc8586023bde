//! Wire-level plumbing: framing constants, the typed message model, the
//! resumable stream parser and the exact-size packers.

pub mod codec;
pub mod msgs;
pub mod parser;
pub mod proto;
