//! The client registry: handle-keyed records plus the secondary indices
//! used for broadcasts and capacity checks.
//!
//! A single readers-writer lock guards the maps; each record carries its own
//! mutex. Lock order is registry before record, and no record lock is ever
//! held while taking the registry write lock.

use hashbrown::HashMap;
use indexmap::IndexSet;
use std::sync::{Arc, Mutex, RwLock};

use crate::broker::client::{ClientRecord, ClientRole};
use crate::broker::handles::HandleGenerator;
use crate::broker::ClientHandle;

pub type SharedRecord = Arc<Mutex<ClientRecord>>;

struct RegistryInner {
    clients: HashMap<ClientHandle, SharedRecord>,
    controllers: IndexSet<ClientHandle>,
    /// Devices along with their UID manufacturer, for manufacturer
    /// broadcasts.
    devices: HashMap<ClientHandle, u16>,
    device_order: IndexSet<ClientHandle>,
    marked: IndexSet<ClientHandle>,
    handles: HandleGenerator,
}

pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            inner: RwLock::new(RegistryInner {
                clients: HashMap::new(),
                controllers: IndexSet::new(),
                devices: HashMap::new(),
                device_order: IndexSet::new(),
                marked: IndexSet::new(),
                handles: HandleGenerator::new(),
            }),
        }
    }

    /// Reserves a handle for a new connection. The record is built by the
    /// caller (it needs the handle) and attached with `insert`.
    pub fn allocate_handle(&self) -> ClientHandle {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let RegistryInner { clients, handles, .. } = &mut *inner;
        handles.next_handle(|h| clients.contains_key(&h))
    }

    pub fn insert(&self, handle: ClientHandle, record: SharedRecord) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.clients.insert(handle, record);
    }

    pub fn get(&self, handle: ClientHandle) -> Option<SharedRecord> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.clients.get(&handle).cloned()
    }

    pub fn contains(&self, handle: ClientHandle) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.clients.contains_key(&handle)
    }

    /// Adds a freshly connected client to its role index.
    pub fn index_connected(&self, handle: ClientHandle, role: ClientRole, manu: u16) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        match role {
            ClientRole::Controller => {
                inner.controllers.insert(handle);
            }
            ClientRole::Device => {
                inner.devices.insert(handle, manu);
                inner.device_order.insert(handle);
            }
            ClientRole::Pending => {}
        }
    }

    pub fn mark(&self, handle: ClientHandle) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.clients.contains_key(&handle) {
            inner.marked.insert(handle);
        }
    }

    /// Handles currently marked for destruction (the set stays marked until
    /// `remove`).
    pub fn marked_handles(&self) -> Vec<ClientHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.marked.iter().copied().collect()
    }

    /// Removes a record from the registry and every index, releasing its
    /// handle for eventual reuse.
    pub fn remove(&self, handle: ClientHandle) -> Option<SharedRecord> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.controllers.shift_remove(&handle);
        inner.devices.remove(&handle);
        inner.device_order.shift_remove(&handle);
        inner.marked.shift_remove(&handle);
        inner.clients.remove(&handle)
    }

    pub fn client_count(&self) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.clients.len()
    }

    pub fn controller_count(&self) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.controllers.len()
    }

    pub fn device_count(&self) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.devices.len()
    }

    /// Snapshot of every record, for the service pass.
    pub fn snapshot_all(&self) -> Vec<(ClientHandle, SharedRecord)> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.clients.iter().map(|(&h, rec)| (h, rec.clone())).collect()
    }

    /// Connected controllers, optionally excluding one handle (e.g. the
    /// client a notification is about).
    pub fn snapshot_controllers(&self, except: Option<ClientHandle>) -> Vec<ClientHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .controllers
            .iter()
            .copied()
            .filter(|&h| Some(h) != except)
            .collect()
    }

    /// Connected devices, optionally restricted to one UID manufacturer.
    pub fn snapshot_devices(&self, manu_filter: Option<u16>) -> Vec<ClientHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .device_order
            .iter()
            .copied()
            .filter(|h| match manu_filter {
                Some(manu) => inner.devices.get(h) == Some(&manu),
                None => true,
            })
            .collect()
    }
}
