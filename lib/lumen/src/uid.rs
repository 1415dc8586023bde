//! RDM unique identifiers and component identifiers.
//!
//! A UID is 48 bits split 16/32 into (manufacturer, device). A handful of
//! reserved forms carry addressing semantics on the wire:
//!
//! - `(0xFFFF, 0xFFFFFFFF)` broadcasts to every device on the scope,
//! - `(0xFFFC, 0xFFFFFFFF)` broadcasts to every controller,
//! - `(manu, 0xFFFFFFFF)` broadcasts to every device of one manufacturer,
//! - a device field with the high bit set requests a dynamic UID.

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Manufacturer field of the all-device broadcast UID.
pub const BROADCAST_ALL_MANU: u16 = 0xffff;
/// Manufacturer field of the all-controller broadcast UID.
pub const BROADCAST_CONTROLLER_MANU: u16 = 0xfffc;
/// Device field shared by every broadcast form.
pub const BROADCAST_DEVICE_ID: u32 = 0xffff_ffff;

/// Flag bit marking a device field as a dynamic UID request.
pub const DYNAMIC_UID_FLAG: u32 = 0x8000_0000;

/// A 48-bit RDM unique identifier.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub manu: u16,
    pub device: u32,
}

impl Uid {
    #[inline]
    pub const fn new(manu: u16, device: u32) -> Uid {
        Uid { manu, device }
    }

    /// The UID addressing every device on the scope.
    #[inline]
    pub const fn all_devices() -> Uid {
        Uid::new(BROADCAST_ALL_MANU, BROADCAST_DEVICE_ID)
    }

    /// The UID addressing every controller on the scope.
    #[inline]
    pub const fn all_controllers() -> Uid {
        Uid::new(BROADCAST_CONTROLLER_MANU, BROADCAST_DEVICE_ID)
    }

    /// The UID addressing every device made by `manu`.
    #[inline]
    pub const fn manufacturer_devices(manu: u16) -> Uid {
        Uid::new(manu, BROADCAST_DEVICE_ID)
    }

    #[inline]
    pub fn is_device_broadcast(&self) -> bool {
        *self == Uid::all_devices()
    }

    #[inline]
    pub fn is_controller_broadcast(&self) -> bool {
        *self == Uid::all_controllers()
    }

    /// True for the per-manufacturer device broadcast form. The manufacturer
    /// in question is the UID's own manu field.
    #[inline]
    pub fn is_manufacturer_broadcast(&self) -> bool {
        self.device == BROADCAST_DEVICE_ID
            && self.manu != BROADCAST_ALL_MANU
            && self.manu != BROADCAST_CONTROLLER_MANU
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.device == BROADCAST_DEVICE_ID
    }

    /// True if this UID asks the broker to assign a dynamic UID.
    #[inline]
    pub fn is_dynamic_request(&self) -> bool {
        !self.is_broadcast() && (self.device & DYNAMIC_UID_FLAG) != 0
    }

    /// True for a concrete static UID a client claims to own.
    #[inline]
    pub fn is_static(&self) -> bool {
        !self.is_broadcast()
            && (self.device & DYNAMIC_UID_FLAG) == 0
            && self.manu != BROADCAST_ALL_MANU
            && self.manu != BROADCAST_CONTROLLER_MANU
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.manu, self.device)
    }
}

/// A 128-bit component identifier, assigned by each client and used as the
/// ACN root-layer sender identifier.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(Uuid);

impl Cid {
    #[inline]
    pub fn new(uuid: Uuid) -> Cid {
        Cid(uuid)
    }

    #[inline]
    pub fn generate() -> Cid {
        Cid(Uuid::new_v4())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Cid {
        Cid(Uuid::from_bytes(bytes))
    }

    /// The 16 canonical UUID bytes, as packed on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Cid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_classification() {
        assert!(Uid::all_devices().is_device_broadcast());
        assert!(Uid::all_controllers().is_controller_broadcast());
        assert!(Uid::manufacturer_devices(0x6574).is_manufacturer_broadcast());

        assert!(!Uid::all_devices().is_manufacturer_broadcast());
        assert!(!Uid::all_controllers().is_manufacturer_broadcast());
        assert!(!Uid::new(0x6574, 1).is_broadcast());
    }

    #[test]
    fn test_dynamic_request_form() {
        assert!(Uid::new(0x6574, 0x8000_0001).is_dynamic_request());
        assert!(!Uid::new(0x6574, 0x8000_0001).is_static());

        assert!(Uid::new(0x6574, 0x0000_0001).is_static());
        assert!(!Uid::new(0x6574, 0x0000_0001).is_dynamic_request());

        // Broadcast forms are neither static nor dynamic requests.
        assert!(!Uid::all_devices().is_static());
        assert!(!Uid::all_devices().is_dynamic_request());
        assert!(!Uid::manufacturer_devices(0x6574).is_static());
    }

    #[test]
    fn test_cid_roundtrip() {
        let cid: Cid = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        assert_eq!(
            cid.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(Cid::from_bytes(*cid.as_bytes()), cid);
        assert!(!cid.is_nil());
        assert!(Cid::default().is_nil());
    }

    #[test]
    fn test_uid_display() {
        assert_eq!(Uid::new(0x6574, 0x8000_0001).to_string(), "6574:80000001");
    }
}
