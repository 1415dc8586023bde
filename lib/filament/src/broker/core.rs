//! The broker core: settings, lifecycle, the connect handshake, broker
//! message handling and the client service pass.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use lumen::logging::{debug, info, warn, Logger};
use lumen::{BrokerError, BrokerResult, Cid, Uid};

use crate::broker::client::{ClientRecord, ClientRole, ConnectionState, SendOutcome, DRAIN_TIMEOUT};
use crate::broker::discovery::{
    BrokerDiscInfo, CoordinatorAction, DiscoveryCoordinator, DiscoveryPlatform,
};
use crate::broker::registry::ClientRegistry;
use crate::broker::responder::BrokerResponder;
use crate::broker::socket_manager::{SocketManager, SocketNotify};
use crate::broker::threads::{ListenNotify, ListenerPool, ServiceNotify, ServiceThread};
use crate::broker::uid::{UidManager, DEFAULT_MAX_UID_CAPACITY};
use crate::broker::{ClientHandle, INVALID_HANDLE};
use crate::net::msgs::*;

/// DNS-SD metadata advertised alongside the broker service.
#[derive(Debug, Clone)]
pub struct DnsAttributes {
    pub manufacturer: String,
    pub model: String,
    pub service_instance_name: String,
    pub additional_txt_items: Vec<(String, Vec<u8>)>,
}

impl Default for DnsAttributes {
    fn default() -> DnsAttributes {
        DnsAttributes {
            manufacturer: "Filament Works".to_string(),
            model: "RDMnet Broker".to_string(),
            service_instance_name: "RDMnet Broker".to_string(),
            additional_txt_items: Vec::new(),
        }
    }
}

/// The broker's own UID: either a configured static UID or a dynamic one
/// generated at startup from the manufacturer id.
#[derive(Debug, Copy, Clone)]
pub enum BrokerUidConfig {
    Static(Uid),
    Dynamic { manu: u16 },
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub cid: Cid,
    pub uid: BrokerUidConfig,
    pub scope: String,
    pub listen_port: u16,
    pub listen_addrs: Vec<IpAddr>,
    /// Interface selection by MAC; accepted but not resolved.
    pub listen_macs: Vec<String>,
    pub max_connections: usize,
    pub max_controllers: usize,
    pub max_devices: usize,
    /// Extra accept slots so a refusal reply can be sent before close.
    pub max_reject_connections: usize,
    pub max_controller_messages: usize,
    pub max_device_messages: usize,
    pub max_uid_capacity: usize,
    pub dns: DnsAttributes,
}

impl Default for BrokerSettings {
    fn default() -> BrokerSettings {
        BrokerSettings {
            cid: Cid::default(),
            uid: BrokerUidConfig::Dynamic { manu: 0 },
            scope: lumen::DEFAULT_SCOPE.to_string(),
            listen_port: 0,
            listen_addrs: Vec::new(),
            listen_macs: Vec::new(),
            max_connections: 0,
            max_controllers: 0,
            max_devices: 0,
            max_reject_connections: 5,
            max_controller_messages: 500,
            max_device_messages: 500,
            max_uid_capacity: 0,
            dns: DnsAttributes::default(),
        }
    }
}

pub struct BrokerCore {
    pub(crate) settings: BrokerSettings,
    pub(crate) my_uid: Uid,
    pub(crate) log: Logger,
    pub(crate) registry: ClientRegistry,
    pub(crate) uids: UidManager,
    pub(crate) responder: BrokerResponder,
    socket_manager: Arc<dyn SocketManager>,
    discovery: Mutex<DiscoveryCoordinator>,
    pending_listeners: Mutex<Option<Vec<TcpListener>>>,
    listeners: Mutex<Option<ListenerPool>>,
    service_thread: Mutex<Option<ServiceThread>>,
    self_ref: Mutex<Weak<BrokerCore>>,
    shutting_down: AtomicBool,
    started: AtomicBool,
}

impl BrokerCore {
    pub fn new(
        settings: BrokerSettings,
        socket_manager: Arc<dyn SocketManager>,
        discovery_platform: Arc<dyn DiscoveryPlatform>,
        log: &Logger,
    ) -> BrokerResult<Arc<BrokerCore>> {
        if settings.cid.is_nil() {
            return Err(BrokerError::InvalidConfig("a non-nil CID is required".into()));
        }
        if settings.scope.is_empty()
            || settings.scope.len() >= lumen::SCOPE_STRING_PADDED_LENGTH
        {
            return Err(BrokerError::InvalidConfig("scope must be 1-62 bytes".into()));
        }
        if settings.listen_port == 0 && settings.listen_addrs.len() > 1 {
            return Err(BrokerError::InvalidConfig(
                "an ephemeral port needs a single listen address".into(),
            ));
        }

        let my_uid = match settings.uid {
            BrokerUidConfig::Static(uid) => {
                if !uid.is_static() {
                    return Err(BrokerError::InvalidConfig(
                        "the configured static UID is not a valid static UID".into(),
                    ));
                }
                uid
            }
            BrokerUidConfig::Dynamic { manu } => {
                if manu == 0 || manu >= 0x8000 {
                    return Err(BrokerError::InvalidConfig(
                        "a dynamic broker UID needs a manufacturer id below 0x8000".into(),
                    ));
                }
                Uid::new(manu, 1)
            }
        };

        let capacity = if settings.max_uid_capacity == 0 {
            DEFAULT_MAX_UID_CAPACITY
        } else {
            settings.max_uid_capacity
        };
        let uids = UidManager::with_capacity(my_uid.manu, capacity);
        match settings.uid {
            // Keep dynamic assignment clear of the broker's own UID.
            BrokerUidConfig::Static(uid) => uids.add_static(INVALID_HANDLE, uid)?,
            BrokerUidConfig::Dynamic { .. } => uids.set_next_device_id(2),
        }

        let disc_info = BrokerDiscInfo {
            cid: settings.cid,
            uid: my_uid,
            service_instance_name: settings.dns.service_instance_name.clone(),
            scope: settings.scope.clone(),
            port: settings.listen_port,
            listen_addrs: settings.listen_addrs.clone(),
            model: settings.dns.model.clone(),
            manufacturer: settings.dns.manufacturer.clone(),
            txt_items: settings.dns.additional_txt_items.clone(),
        };
        let discovery = DiscoveryCoordinator::new(discovery_platform, disc_info, String::new(), log);

        let core = Arc::new(BrokerCore {
            settings,
            my_uid,
            log: log.clone(),
            registry: ClientRegistry::new(),
            uids,
            responder: BrokerResponder::new(),
            socket_manager,
            discovery: Mutex::new(discovery),
            pending_listeners: Mutex::new(None),
            listeners: Mutex::new(None),
            service_thread: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
            shutting_down: AtomicBool::new(false),
            started: AtomicBool::new(false),
        });
        *core.self_ref.lock().expect("core lock poisoned") = Arc::downgrade(&core);
        Ok(core)
    }

    #[inline]
    pub fn my_uid(&self) -> Uid {
        self.my_uid
    }

    pub fn assigned_service_name(&self) -> Option<String> {
        self.discovery
            .lock()
            .expect("core lock poisoned")
            .assigned_service_name()
            .map(str::to_string)
    }

    /// Binds the listen sockets, starts scope monitoring and the service
    /// thread. Accepting begins once discovery confirms our registration.
    pub fn startup(&self) -> BrokerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        let now = Instant::now();

        let this = self
            .self_ref
            .lock()
            .expect("core lock poisoned")
            .upgrade()
            .ok_or(BrokerError::ShuttingDown)?;

        self.socket_manager.startup(this.clone())?;

        let (listeners, port) = self.bind_listeners()?;
        *self.pending_listeners.lock().expect("core lock poisoned") = Some(listeners);

        {
            let mut discovery = self.discovery.lock().expect("core lock poisoned");
            discovery.set_port(port);
            discovery.start(now)?;
        }

        let service_notify: Arc<dyn ServiceNotify> = this;
        let service = ServiceThread::start(
            service_notify,
            crate::broker::threads::DEFAULT_SERVICE_INTERVAL,
        );
        *self.service_thread.lock().expect("core lock poisoned") = Some(service);

        info!(self.log, "broker starting";
              "scope" => &self.settings.scope,
              "uid" => %self.my_uid,
              "port" => port);
        Ok(())
    }

    /// Two-phase stop: listeners close, every client gets a Disconnect and
    /// a bounded chance to drain, then the reader machinery goes away.
    pub fn shutdown(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.log, "broker shutting down");

        self.discovery.lock().expect("core lock poisoned").stop();
        *self.listeners.lock().expect("core lock poisoned") = None;
        *self.pending_listeners.lock().expect("core lock poisoned") = None;

        for (handle, _) in self.registry.snapshot_all() {
            self.mark_for_destruction(handle, Some(DisconnectReason::Shutdown));
        }

        if let Some(mut service) = self.service_thread.lock().expect("core lock poisoned").take() {
            service.stop();
        }

        let deadline = Instant::now() + 2 * DRAIN_TIMEOUT;
        while self.registry.client_count() > 0 && Instant::now() < deadline {
            self.service_pass(Instant::now());
            thread::sleep(Duration::from_millis(1));
        }

        self.socket_manager.shutdown();
        self.started.store(false, Ordering::SeqCst);
    }

    /// Blocks until shutdown is requested from another thread.
    pub fn run(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(250));
        }
    }

    fn bind_listeners(&self) -> BrokerResult<(Vec<TcpListener>, u16)> {
        if !self.settings.listen_macs.is_empty() {
            warn!(self.log, "interface selection by MAC is not supported; using listen_addrs");
        }

        let addrs: Vec<IpAddr> = if self.settings.listen_addrs.is_empty() {
            vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)]
        } else {
            self.settings.listen_addrs.clone()
        };

        let mut port = self.settings.listen_port;
        let mut sockets = Vec::with_capacity(addrs.len());
        for ip in addrs {
            let socket = TcpListener::bind(SocketAddr::new(ip, port))?;
            if port == 0 {
                port = socket.local_addr()?.port();
            }
            sockets.push(socket);
        }
        Ok((sockets, port))
    }

    // ------------------------------------------------------------ accepting

    /// Takes ownership of an accepted socket if there is room for it.
    fn accept_client(&self, stream: std::net::TcpStream, addr: SocketAddr) -> Option<ClientHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        if !self.has_accept_room() {
            warn!(self.log, "refusing connection; accept slots exhausted"; "peer" => %addr);
            return None;
        }

        if stream.set_nonblocking(true).is_err() {
            return None;
        }
        let stream = match mio::net::TcpStream::from_stream(stream) {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                warn!(self.log, "could not adopt accepted socket"; "error" => %err);
                return None;
            }
        };

        self.attach_client(Some(stream), addr)
    }

    fn has_accept_room(&self) -> bool {
        let max = self.settings.max_connections;
        max == 0 || self.registry.client_count() < max + self.settings.max_reject_connections
    }

    /// Creates the client record and hands the socket to the socket
    /// manager. Also the entry point for tests, which pass no socket.
    pub(crate) fn attach_client(
        &self,
        stream: Option<Arc<mio::net::TcpStream>>,
        addr: SocketAddr,
    ) -> Option<ClientHandle> {
        let now = Instant::now();
        let handle = self.registry.allocate_handle();

        let mut record = ClientRecord::new(handle, addr, stream.clone(), now, &self.log);
        record.begin_handshake(now);
        self.registry.insert(handle, Arc::new(Mutex::new(record)));

        if let Some(stream) = stream {
            if let Err(err) = self.socket_manager.add_socket(handle, stream) {
                warn!(self.log, "socket manager refused a new socket"; "error" => %err);
                self.registry.remove(handle);
                return None;
            }
        }

        debug!(self.log, "client accepted"; "handle" => handle, "peer" => %addr);
        Some(handle)
    }

    // ------------------------------------------------------ message handling

    pub(crate) fn process_message(&self, handle: ClientHandle, msg: RdmnetMessage) {
        match msg.content {
            MessageContent::Broker(bmsg) => match bmsg {
                BrokerMessage::ClientConnect(cmsg) => {
                    self.process_connect_request(handle, cmsg);
                }
                BrokerMessage::FetchClientList => {
                    debug!(self.log, "client fetched the client list"; "handle" => handle);
                    self.send_client_list(handle);
                }
                BrokerMessage::RequestDynamicUids(list) => {
                    self.process_dynamic_uid_request(handle, list);
                }
                BrokerMessage::FetchDynamicUidList(list) => {
                    self.process_fetch_uid_assignments(handle, list);
                }
                BrokerMessage::ClientEntryUpdate(update) => {
                    self.process_client_entry_update(handle, update);
                }
                BrokerMessage::Disconnect(reason) => {
                    info!(self.log, "client sent a graceful disconnect";
                          "handle" => handle, "reason" => reason.as_u16());
                    self.mark_for_destruction(handle, None);
                }
                BrokerMessage::Null => {}
                other => {
                    warn!(self.log, "dropping broker message a broker never receives";
                          "handle" => handle, "message" => ?other);
                }
            },
            MessageContent::Rpt(rmsg) => self.route_rpt_message(handle, rmsg),
        }
    }

    fn process_connect_request(&self, handle: ClientHandle, cmsg: ClientConnectMsg) {
        {
            let record = match self.registry.get(handle) {
                Some(record) => record,
                None => return,
            };
            let state = record.lock().expect("record lock poisoned").state;
            if state != ConnectionState::AwaitingConnect {
                warn!(self.log, "connect request on an already-connected client";
                      "handle" => handle);
                self.mark_for_destruction(handle, None);
                return;
            }
        }

        let mut status = ConnectStatus::ScopeMismatch;
        let mut accepted = false;

        if cmsg.e133_version <= lumen::E133_VERSION && cmsg.scope == self.settings.scope {
            match &cmsg.client_entry {
                ClientEntry::Rpt(entry) => {
                    let (s, ok) = self.process_rpt_connect(handle, entry, &cmsg);
                    status = s;
                    accepted = ok;
                }
                ClientEntry::Ept(_) => {
                    // EPT clients are refused until that sub-protocol lands.
                    status = ConnectStatus::InvalidClientEntry;
                }
            }
        }

        if !accepted {
            if let Some(record) = self.registry.get(handle) {
                let reply = BrokerMessage::ConnectReply(ConnectReplyMsg {
                    status,
                    e133_version: lumen::E133_VERSION,
                    broker_uid: self.my_uid,
                    client_uid: Uid::default(),
                });
                let _ = record
                    .lock()
                    .expect("record lock poisoned")
                    .push_broker(&self.settings.cid, &reply);
            }
            info!(self.log, "refused connect request";
                  "handle" => handle, "status" => status.as_u16(), "scope" => &cmsg.scope);
            self.mark_for_destruction(handle, None);
        }
    }

    fn process_rpt_connect(
        &self,
        handle: ClientHandle,
        entry: &RptClientEntry,
        cmsg: &ClientConnectMsg,
    ) -> (ConnectStatus, bool) {
        let max_connections = self.settings.max_connections;
        if max_connections != 0 && self.connected_count() >= max_connections {
            return (ConnectStatus::CapacityExceeded, false);
        }

        // Resolve the client's UID.
        let uid = if entry.uid.is_dynamic_request() {
            match self.uids.add_dynamic(handle, entry.cid) {
                Ok(uid) => uid,
                Err(BrokerError::DuplicateId) => return (ConnectStatus::DuplicateUid, false),
                Err(_) => return (ConnectStatus::CapacityExceeded, false),
            }
        } else if entry.uid.is_static() {
            match self.uids.add_static(handle, entry.uid) {
                Ok(()) => entry.uid,
                Err(BrokerError::DuplicateId) => return (ConnectStatus::DuplicateUid, false),
                Err(_) => return (ConnectStatus::CapacityExceeded, false),
            }
        } else {
            return (ConnectStatus::InvalidUid, false);
        };

        // Per-type capacity.
        let (role, max_q_size) = match entry.client_type {
            RptClientType::Controller => {
                if self.settings.max_controllers != 0
                    && self.registry.controller_count() >= self.settings.max_controllers
                {
                    self.uids.remove(uid);
                    return (ConnectStatus::CapacityExceeded, false);
                }
                (ClientRole::Controller, self.settings.max_controller_messages)
            }
            RptClientType::Device => {
                if self.settings.max_devices != 0
                    && self.registry.device_count() >= self.settings.max_devices
                {
                    self.uids.remove(uid);
                    return (ConnectStatus::CapacityExceeded, false);
                }
                (ClientRole::Device, self.settings.max_device_messages)
            }
            RptClientType::Unknown => {
                self.uids.remove(uid);
                return (ConnectStatus::InvalidClientEntry, false);
            }
        };

        let record = match self.registry.get(handle) {
            Some(record) => record,
            None => {
                self.uids.remove(uid);
                return (ConnectStatus::InvalidClientEntry, false);
            }
        };

        let now = Instant::now();
        {
            let mut record = record.lock().expect("record lock poisoned");
            record.promote(entry, uid, max_q_size, now);
            let reply = BrokerMessage::ConnectReply(ConnectReplyMsg {
                status: ConnectStatus::Ok,
                e133_version: lumen::E133_VERSION,
                broker_uid: self.my_uid,
                client_uid: uid,
            });
            let _ = record.push_broker(&self.settings.cid, &reply);
        }
        self.registry.index_connected(handle, role, uid.manu);

        info!(self.log, "client connected";
              "handle" => handle,
              "type" => match role { ClientRole::Controller => "controller", _ => "device" },
              "uid" => %uid,
              "scope" => &cmsg.scope);

        let announced = RptClientEntry {
            cid: entry.cid,
            uid,
            client_type: entry.client_type,
            binding_cid: entry.binding_cid,
        };
        self.send_client_notification(ClientListAction::Add, vec![announced], Some(handle));

        (ConnectStatus::Ok, true)
    }

    fn connected_count(&self) -> usize {
        self.registry.controller_count() + self.registry.device_count()
    }

    /// Answers a FetchClientList with every connected client the requester
    /// can talk to.
    fn send_client_list(&self, handle: ClientHandle) {
        let mut entries = Vec::new();
        for (_, record) in self.registry.snapshot_all() {
            let record = record.lock().expect("record lock poisoned");
            if record.state == ConnectionState::Connected {
                entries.push(record.rpt_entry());
            }
        }
        if entries.is_empty() {
            return;
        }

        if let Some(record) = self.registry.get(handle) {
            let msg = BrokerMessage::ClientList(ClientListMsg {
                action: ClientListAction::Connected,
                entries,
                more_coming: false,
            });
            if record
                .lock()
                .expect("record lock poisoned")
                .push_broker(&self.settings.cid, &msg)
                .is_err()
            {
                warn!(self.log, "client list dropped; queue full"; "handle" => handle);
            }
        }
    }

    fn process_dynamic_uid_request(&self, handle: ClientHandle, list: DynamicUidRequestList) {
        let mut mappings = Vec::with_capacity(list.requests.len());
        for request in &list.requests {
            let (uid, status) = if !request.uid.is_dynamic_request() {
                (request.uid, DynamicUidStatus::InvalidRequest)
            } else {
                match self.uids.add_dynamic(handle, request.rid) {
                    Ok(uid) => (uid, DynamicUidStatus::Ok),
                    Err(BrokerError::DuplicateId) => (request.uid, DynamicUidStatus::DuplicateUid),
                    Err(_) => (request.uid, DynamicUidStatus::CapacityExhausted),
                }
            };
            mappings.push(DynamicUidMapping { uid, rid: request.rid, status });
        }

        self.push_broker_to(
            handle,
            &BrokerMessage::AssignedDynamicUids(DynamicUidAssignmentList {
                mappings,
                more_coming: false,
            }),
        );
    }

    fn process_fetch_uid_assignments(&self, handle: ClientHandle, list: FetchUidList) {
        let mappings = list
            .uids
            .iter()
            .map(|&uid| match self.uids.lookup(uid) {
                Some(_) => DynamicUidMapping {
                    uid,
                    rid: self.uids.reservation_holder(uid).unwrap_or_default(),
                    status: DynamicUidStatus::Ok,
                },
                None => DynamicUidMapping {
                    uid,
                    rid: Cid::default(),
                    status: DynamicUidStatus::UidNotFound,
                },
            })
            .collect();

        self.push_broker_to(
            handle,
            &BrokerMessage::AssignedDynamicUids(DynamicUidAssignmentList {
                mappings,
                more_coming: false,
            }),
        );
    }

    fn process_client_entry_update(&self, handle: ClientHandle, update: ClientEntryUpdateMsg) {
        let record = match self.registry.get(handle) {
            Some(record) => record,
            None => return,
        };

        let announced = {
            let mut record = record.lock().expect("record lock poisoned");
            let valid = match &update.client_entry {
                ClientEntry::Rpt(entry) => {
                    record.state == ConnectionState::Connected
                        && entry.cid == record.cid
                        && entry.uid == record.uid
                        && entry.client_type == record.client_type()
                }
                ClientEntry::Ept(_) => false,
            };
            if !valid {
                None
            } else if let ClientEntry::Rpt(entry) = &update.client_entry {
                record.binding_cid = entry.binding_cid;
                Some(record.rpt_entry())
            } else {
                None
            }
        };

        match announced {
            Some(entry) => {
                self.send_client_notification(ClientListAction::Change, vec![entry], Some(handle));
            }
            None => {
                warn!(self.log, "invalid client entry update"; "handle" => handle);
                self.mark_for_destruction(handle, None);
            }
        }
    }

    fn push_broker_to(&self, handle: ClientHandle, msg: &BrokerMessage) {
        if let Some(record) = self.registry.get(handle) {
            if record
                .lock()
                .expect("record lock poisoned")
                .push_broker(&self.settings.cid, msg)
                .is_err()
            {
                warn!(self.log, "broker message dropped; queue full"; "handle" => handle);
            }
        }
    }

    /// Pushes a client list message to every connected controller, except
    /// the client the notification is about.
    pub(crate) fn send_client_notification(
        &self,
        action: ClientListAction,
        entries: Vec<RptClientEntry>,
        except: Option<ClientHandle>,
    ) {
        for target in self.registry.snapshot_controllers(except) {
            if let Some(record) = self.registry.get(target) {
                let mut record = record.lock().expect("record lock poisoned");
                if record.state != ConnectionState::Connected {
                    continue;
                }
                let msg = BrokerMessage::ClientList(ClientListMsg {
                    action,
                    entries: entries.clone(),
                    more_coming: false,
                });
                if record.push_broker(&self.settings.cid, &msg).is_err() {
                    record.overflow_drops += 1;
                    warn!(self.log, "client list notification dropped; queue full";
                          "handle" => target);
                }
            }
        }
    }

    // ----------------------------------------------------------- destruction

    /// Flags a connection for teardown. With a reason, a Disconnect message
    /// is queued first and given a bounded chance to drain.
    pub(crate) fn mark_for_destruction(
        &self,
        handle: ClientHandle,
        reason: Option<DisconnectReason>,
    ) {
        let record = match self.registry.get(handle) {
            Some(record) => record,
            None => return,
        };
        {
            let mut record = record.lock().expect("record lock poisoned");
            if record.state == ConnectionState::MarkedForDestruction {
                return;
            }
            if let Some(reason) = reason {
                let _ = record.push_broker(&self.settings.cid, &BrokerMessage::Disconnect(reason));
            }
            record.mark_for_destruction(Instant::now());
        }
        self.registry.mark(handle);
        debug!(self.log, "connection marked for destruction"; "handle" => handle);
    }

    /// Reaps marked connections whose farewells have drained, scrubs their
    /// UIDs and queue partitions, and tells the controllers.
    fn destroy_marked_clients(&self, now: Instant) {
        let marked = self.registry.marked_handles();
        if marked.is_empty() {
            return;
        }

        let mut removed_entries = Vec::new();
        let mut removed_controllers = Vec::new();

        for handle in marked {
            let record = match self.registry.get(handle) {
                Some(record) => record,
                None => continue,
            };
            let ready = record.lock().expect("record lock poisoned").ready_to_reap(now);
            if !ready {
                continue;
            }

            self.socket_manager.remove_socket(handle);
            if let Some(record) = self.registry.remove(handle) {
                let record = record.lock().expect("record lock poisoned");
                self.uids.release_handle(handle);
                if record.role != ClientRole::Pending {
                    removed_entries.push(record.rpt_entry());
                }
                if record.role == ClientRole::Controller {
                    removed_controllers.push(handle);
                }
                info!(self.log, "connection destroyed";
                      "handle" => handle, "uid" => %record.uid);
            }
        }

        // Queued traffic from dead controllers will never be wanted.
        if !removed_controllers.is_empty() {
            for device in self.registry.snapshot_devices(None) {
                if let Some(record) = self.registry.get(device) {
                    let mut record = record.lock().expect("record lock poisoned");
                    for &controller in &removed_controllers {
                        record.drop_partition(controller);
                    }
                }
            }
        }

        if !removed_entries.is_empty() {
            self.send_client_notification(ClientListAction::Remove, removed_entries, None);
        }
    }

    // --------------------------------------------------------- service loop

    /// One scheduler pass over discovery, reaping and every client.
    /// Returns true if any client transmitted.
    pub fn service_pass(&self, now: Instant) -> bool {
        self.tick_discovery(now);
        self.destroy_marked_clients(now);

        let mut wrote = false;
        let mut to_kill = Vec::new();

        for (handle, record) in self.registry.snapshot_all() {
            let mut record = record.lock().expect("record lock poisoned");

            if record.heartbeat_expired(now) {
                warn!(self.log, "heartbeat timeout"; "handle" => handle);
                to_kill.push(handle);
                continue;
            }

            record.maybe_enqueue_null(&self.settings.cid, now);

            let outcome = match record.stream() {
                Some(stream) => {
                    let mut writer = &*stream;
                    record.send_one(&mut writer, now)
                }
                None => SendOutcome::Idle,
            };
            match outcome {
                SendOutcome::Wrote => wrote = true,
                SendOutcome::Idle => {}
                SendOutcome::Fatal => {
                    warn!(self.log, "socket send failed"; "handle" => handle);
                    to_kill.push(handle);
                }
            }
        }

        for handle in to_kill {
            self.mark_for_destruction(handle, None);
        }

        wrote
    }

    fn tick_discovery(&self, now: Instant) {
        let actions = self.discovery.lock().expect("core lock poisoned").tick(now);
        for action in actions {
            match action {
                CoordinatorAction::StartServing => self.open_listeners(),
                CoordinatorAction::EnterStandby => self.enter_standby(),
            }
        }
    }

    fn open_listeners(&self) {
        let notify: Arc<dyn ListenNotify> =
            match self.self_ref.lock().expect("core lock poisoned").upgrade() {
                Some(core) => core,
                None => return,
            };

        let sockets = match self.pending_listeners.lock().expect("core lock poisoned").take() {
            Some(sockets) => sockets,
            None => match self.bind_listeners() {
                Ok((sockets, _)) => sockets,
                Err(err) => {
                    warn!(self.log, "could not reopen listeners"; "error" => %err);
                    return;
                }
            },
        };

        info!(self.log, "accepting client connections"; "scope" => &self.settings.scope);
        let pool = ListenerPool::start(sockets, notify, &self.log);
        *self.listeners.lock().expect("core lock poisoned") = Some(pool);
    }

    /// Another broker owns the scope: stop accepting and shed every client.
    fn enter_standby(&self) {
        warn!(self.log, "entering standby; disconnecting all clients");
        *self.listeners.lock().expect("core lock poisoned") = None;
        for (handle, _) in self.registry.snapshot_all() {
            self.mark_for_destruction(handle, Some(DisconnectReason::Shutdown));
        }
    }
}

impl ListenNotify for BrokerCore {
    fn new_connection(&self, stream: std::net::TcpStream, addr: SocketAddr) -> bool {
        self.accept_client(stream, addr).is_some()
    }
}

impl ServiceNotify for BrokerCore {
    fn service_clients(&self) -> bool {
        self.service_pass(Instant::now())
    }
}

impl SocketNotify for BrokerCore {
    fn socket_data(&self, handle: ClientHandle, data: &[u8]) {
        let record = match self.registry.get(handle) {
            Some(record) => record,
            None => return,
        };

        let now = Instant::now();
        let (msgs, kill) = record
            .lock()
            .expect("record lock poisoned")
            .drain_messages(data, now);

        for msg in msgs {
            self.process_message(handle, msg);
        }
        if kill {
            self.mark_for_destruction(handle, None);
        }
    }

    fn socket_closed(&self, handle: ClientHandle, graceful: bool) {
        info!(self.log, "peer closed connection"; "handle" => handle, "graceful" => graceful);
        self.mark_for_destruction(handle, None);
    }
}
