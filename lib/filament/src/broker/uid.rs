//! UID allocation and lookup.
//!
//! Tracks every UID owned by a connected client and hands out dynamic UIDs
//! on request. Components are sticky: a reservation keyed by the
//! requesting CID outlives the connection, so a client that reconnects with
//! the same CID gets its previous dynamic UID back. Validation of UID forms
//! happens before this table is consulted.

use hashbrown::HashMap;
use lumen::{BrokerError, BrokerResult, Cid, Uid};
use std::sync::RwLock;

use crate::broker::ClientHandle;

pub const DEFAULT_MAX_UID_CAPACITY: usize = 1_000_000;

struct UidData {
    handle: ClientHandle,
    /// Key into the reservation table, for dynamic UIDs.
    reservation: Option<Cid>,
}

struct Reservation {
    assigned_uid: Uid,
    currently_connected: bool,
}

struct UidManagerInner {
    uid_lookup: HashMap<Uid, UidData>,
    reservations: HashMap<Cid, Reservation>,
    next_device_id: u32,
}

pub struct UidManager {
    inner: RwLock<UidManagerInner>,
    broker_manu: u16,
    max_capacity: usize,
}

impl UidManager {
    pub fn new(broker_manu: u16) -> UidManager {
        UidManager::with_capacity(broker_manu, DEFAULT_MAX_UID_CAPACITY)
    }

    pub fn with_capacity(broker_manu: u16, max_capacity: usize) -> UidManager {
        UidManager {
            inner: RwLock::new(UidManagerInner {
                uid_lookup: HashMap::new(),
                reservations: HashMap::new(),
                next_device_id: 1,
            }),
            broker_manu,
            max_capacity,
        }
    }

    pub fn set_next_device_id(&self, next_device_id: u32) {
        let mut inner = self.inner.write().expect("uid manager lock poisoned");
        inner.next_device_id = next_device_id;
    }

    /// Claims a static UID for a client.
    pub fn add_static(&self, handle: ClientHandle, static_uid: Uid) -> BrokerResult<()> {
        let mut inner = self.inner.write().expect("uid manager lock poisoned");

        if inner.uid_lookup.len() >= self.max_capacity {
            return Err(BrokerError::Capacity);
        }
        if inner.uid_lookup.contains_key(&static_uid) {
            return Err(BrokerError::DuplicateId);
        }

        inner.uid_lookup.insert(static_uid, UidData { handle, reservation: None });
        Ok(())
    }

    /// Assigns a dynamic UID for the component identified by `cid`,
    /// honoring a prior reservation when one exists.
    pub fn add_dynamic(&self, handle: ClientHandle, cid: Cid) -> BrokerResult<Uid> {
        let mut inner = self.inner.write().expect("uid manager lock poisoned");

        if inner.uid_lookup.len() >= self.max_capacity {
            return Err(BrokerError::Capacity);
        }

        let new_uid;
        if let Some(reservation) = inner.reservations.get_mut(&cid) {
            if reservation.currently_connected {
                return Err(BrokerError::DuplicateId);
            }
            new_uid = reservation.assigned_uid;
            reservation.currently_connected = true;
        } else {
            let mut device_id = inner.next_device_id;
            while inner.uid_lookup.contains_key(&Uid::new(self.broker_manu, device_id)) {
                device_id = advance_device_id(device_id);
            }
            new_uid = Uid::new(self.broker_manu, device_id);
            inner.next_device_id = advance_device_id(device_id);
            inner.reservations.insert(
                cid,
                Reservation { assigned_uid: new_uid, currently_connected: true },
            );
        }

        inner.uid_lookup.insert(new_uid, UidData { handle, reservation: Some(cid) });
        Ok(new_uid)
    }

    /// Releases a UID when its client goes away. The reservation (if any)
    /// survives with its connected flag cleared.
    pub fn remove(&self, uid: Uid) {
        let mut inner = self.inner.write().expect("uid manager lock poisoned");

        if let Some(data) = inner.uid_lookup.remove(&uid) {
            if let Some(cid) = data.reservation {
                if let Some(reservation) = inner.reservations.get_mut(&cid) {
                    reservation.currently_connected = false;
                }
            }
        }
    }

    /// Releases every UID owned by one connection, e.g. at teardown. A
    /// client may hold several (its own plus responder UIDs it requested).
    pub fn release_handle(&self, handle: ClientHandle) {
        let mut inner = self.inner.write().expect("uid manager lock poisoned");

        let owned: Vec<Uid> = inner
            .uid_lookup
            .iter()
            .filter(|(_, data)| data.handle == handle)
            .map(|(&uid, _)| uid)
            .collect();
        for uid in owned {
            if let Some(data) = inner.uid_lookup.remove(&uid) {
                if let Some(cid) = data.reservation {
                    if let Some(reservation) = inner.reservations.get_mut(&cid) {
                        reservation.currently_connected = false;
                    }
                }
            }
        }
    }

    pub fn lookup(&self, uid: Uid) -> Option<ClientHandle> {
        let inner = self.inner.read().expect("uid manager lock poisoned");
        inner.uid_lookup.get(&uid).map(|data| data.handle)
    }

    /// The CID holding the reservation for `uid`, if it was dynamically
    /// assigned.
    pub fn reservation_holder(&self, uid: Uid) -> Option<Cid> {
        let inner = self.inner.read().expect("uid manager lock poisoned");
        inner.uid_lookup.get(&uid).and_then(|data| data.reservation)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("uid manager lock poisoned");
        inner.uid_lookup.len()
    }
}

/// Device ids 0 and 0xFFFFFFFF are never assigned; allocation wraps past
/// the top of the space.
#[inline]
fn advance_device_id(device_id: u32) -> u32 {
    let mut next = device_id.wrapping_add(1);
    if next == 0 || next == 0xffff_ffff {
        next = 1;
    }
    next
}
