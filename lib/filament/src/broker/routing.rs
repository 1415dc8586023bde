//! The routing engine: applies destination-UID semantics to inbound RPT
//! traffic.
//!
//! Senders are classified by role first (controllers issue requests,
//! devices issue status and notifications), destinations are validated
//! against the UID index, then the message fans out to its unicast or
//! broadcast targets. Broadcasts snapshot the recipient handles under the
//! registry lock and push one record at a time, so no two record locks are
//! ever held together. Every forwarded frame is re-packed with the
//! broker's own CID as the root-layer sender.

use lumen::logging::{debug, warn};
use lumen::Uid;

use crate::broker::client::{ClientRole, ConnectionState};
use crate::broker::core::BrokerCore;
use crate::broker::ClientHandle;
use crate::net::msgs::*;

impl BrokerCore {
    pub(crate) fn route_rpt_message(&self, handle: ClientHandle, msg: RptMessage) {
        let record = match self.registry.get(handle) {
            Some(record) => record,
            None => return,
        };
        let (role, state) = {
            let record = record.lock().expect("record lock poisoned");
            (record.role, record.state)
        };
        if state != ConnectionState::Connected {
            // Clients receive and send no routed traffic before the
            // handshake completes.
            warn!(self.log, "dropping RPT message from unconnected client"; "handle" => handle);
            return;
        }

        match &msg.content {
            RptContent::Request(list) => {
                if role != ClientRole::Controller {
                    debug!(self.log, "request from a non-controller"; "handle" => handle);
                    self.reply_status(handle, &msg.header, RptStatusCode::InvalidCommandClass);
                    return;
                }
                if !self.valid_request_destination(msg.header.dest_uid) {
                    debug!(self.log, "request to invalid or unknown UID";
                           "handle" => handle, "dest" => %msg.header.dest_uid);
                    self.reply_status(handle, &msg.header, RptStatusCode::UnknownRptUid);
                    return;
                }
                if list.buffers.len() != 1 {
                    // A request carries exactly one RDM command.
                    debug!(self.log, "request with multiple RDM commands"; "handle" => handle);
                    self.reply_status(handle, &msg.header, RptStatusCode::InvalidMessage);
                    return;
                }
                if msg.header.dest_uid == self.my_uid {
                    let (reply_header, status) =
                        self.responder.process_request(&msg.header, &list.buffers);
                    self.push_status_to(handle, reply_header, status);
                    return;
                }
                self.dispatch_rpt(handle, &msg);
            }
            RptContent::Status(status) => {
                if role != ClientRole::Device {
                    debug!(self.log, "status from a non-device"; "handle" => handle);
                    self.reply_status(handle, &msg.header, RptStatusCode::InvalidCommandClass);
                    return;
                }
                if !self.valid_reply_destination(msg.header.dest_uid) {
                    debug!(self.log, "status to invalid or unknown UID";
                           "handle" => handle, "dest" => %msg.header.dest_uid);
                    self.reply_status(handle, &msg.header, RptStatusCode::UnknownRptUid);
                    return;
                }
                if status.status_code == RptStatusCode::BroadcastComplete {
                    // Broadcast-complete indicators terminate at the broker.
                    debug!(self.log, "broadcast complete"; "handle" => handle);
                    return;
                }
                self.dispatch_rpt(handle, &msg);
            }
            RptContent::Notification(_) => {
                if !self.valid_reply_destination(msg.header.dest_uid) {
                    debug!(self.log, "notification to invalid or unknown UID";
                           "handle" => handle, "dest" => %msg.header.dest_uid);
                    self.reply_status(handle, &msg.header, RptStatusCode::UnknownRptUid);
                    return;
                }
                self.dispatch_rpt(handle, &msg);
            }
        }
    }

    /// Destinations a request may name: a connected client, the broker
    /// itself, or one of the device broadcast forms.
    fn valid_request_destination(&self, dest: Uid) -> bool {
        dest == self.my_uid
            || dest.is_device_broadcast()
            || dest.is_manufacturer_broadcast()
            || self.uids.lookup(dest).is_some()
    }

    /// Destinations a status or notification may name: a connected client
    /// or the all-controllers broadcast.
    fn valid_reply_destination(&self, dest: Uid) -> bool {
        dest.is_controller_broadcast() || self.uids.lookup(dest).is_some()
    }

    fn dispatch_rpt(&self, from: ClientHandle, msg: &RptMessage) {
        let dest = msg.header.dest_uid;

        if dest.is_controller_broadcast() {
            debug!(self.log, "broadcasting to all controllers"; "source" => %msg.header.source_uid);
            let targets = self.registry.snapshot_controllers(Some(from));
            self.push_broadcast(from, &targets, msg);
        } else if dest.is_device_broadcast() {
            debug!(self.log, "broadcasting to all devices"; "source" => %msg.header.source_uid);
            let targets: Vec<ClientHandle> = self
                .registry
                .snapshot_devices(None)
                .into_iter()
                .filter(|&h| h != from)
                .collect();
            self.push_broadcast(from, &targets, msg);
        } else if dest.is_manufacturer_broadcast() {
            debug!(self.log, "broadcasting to one manufacturer's devices";
                   "source" => %msg.header.source_uid, "manu" => dest.manu);
            let targets: Vec<ClientHandle> = self
                .registry
                .snapshot_devices(Some(dest.manu))
                .into_iter()
                .filter(|&h| h != from)
                .collect();
            self.push_broadcast(from, &targets, msg);
        } else {
            self.push_unicast(from, dest, msg);
        }
    }

    fn push_unicast(&self, from: ClientHandle, dest: Uid, msg: &RptMessage) {
        let dest_handle = match self.uids.lookup(dest) {
            Some(handle) => handle,
            None => {
                self.reply_status(from, &msg.header, RptStatusCode::UnknownRptUid);
                return;
            }
        };
        let record = match self.registry.get(dest_handle) {
            Some(record) => record,
            None => {
                self.reply_status(from, &msg.header, RptStatusCode::UnknownRptUid);
                return;
            }
        };

        let pushed = {
            let mut record = record.lock().expect("record lock poisoned");
            let result = match &msg.content {
                RptContent::Status(status) => record.push_status(
                    &self.settings.cid,
                    msg.header,
                    status.clone(),
                ),
                _ => record.push_rpt(from, &self.settings.cid, msg),
            };
            if result.is_err() {
                record.overflow_drops += 1;
            }
            result.is_ok()
        };

        if pushed {
            debug!(self.log, "routed RPT message";
                   "source" => %msg.header.source_uid, "dest" => %dest);
        } else {
            // The destination is saturated; tell the sender its traffic is
            // going nowhere rather than silently eating it.
            warn!(self.log, "destination queue overflow"; "dest" => %dest);
            self.reply_status_with_string(
                from,
                &msg.header,
                RptStatusCode::RdmTimeout,
                "destination queue overflow",
            );
        }
    }

    /// Pushes to each broadcast target. A full queue drops that copy and
    /// bumps the destination's overflow counter; the broadcast goes on.
    fn push_broadcast(&self, from: ClientHandle, targets: &[ClientHandle], msg: &RptMessage) {
        for &target in targets {
            if let Some(record) = self.registry.get(target) {
                let mut record = record.lock().expect("record lock poisoned");
                if record.state != ConnectionState::Connected {
                    continue;
                }
                if record.push_rpt(from, &self.settings.cid, msg).is_err() {
                    record.overflow_drops += 1;
                    warn!(self.log, "broadcast copy dropped; queue full"; "handle" => target);
                }
            }
        }
    }

    /// Status reply toward the sender of a faulty message.
    pub(crate) fn reply_status(
        &self,
        handle: ClientHandle,
        header: &RptHeader,
        code: RptStatusCode,
    ) {
        self.push_status_to(
            handle,
            header.swapped_for_reply(),
            RptStatusMsg { status_code: code, status_string: None },
        );
    }

    fn reply_status_with_string(
        &self,
        handle: ClientHandle,
        header: &RptHeader,
        code: RptStatusCode,
        text: &str,
    ) {
        self.push_status_to(
            handle,
            header.swapped_for_reply(),
            RptStatusMsg { status_code: code, status_string: Some(text.to_string()) },
        );
    }

    pub(crate) fn push_status_to(
        &self,
        handle: ClientHandle,
        header: RptHeader,
        status: RptStatusMsg,
    ) {
        if let Some(record) = self.registry.get(handle) {
            let mut record = record.lock().expect("record lock poisoned");
            if record.push_status(&self.settings.cid, header, status).is_err() {
                record.overflow_drops += 1;
            }
        }
    }
}
