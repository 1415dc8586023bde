//! Typed message model for the broker and RPT protocol layers.
//!
//! Every message that can cross the wire has a variant here; the parser
//! builds these and the codec consumes them. Lists carry a `more_coming`
//! flag so a partially delivered list can be handed to the caller while the
//! parser keeps working through the enclosing block.

use crate::net::proto;
use lumen::{Cid, Uid};
use std::net::SocketAddr;

/// Status field of a ConnectReply.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectStatus {
    Ok,
    ScopeMismatch,
    CapacityExceeded,
    DuplicateUid,
    InvalidClientEntry,
    InvalidUid,
}

impl ConnectStatus {
    #[inline]
    pub fn as_u16(self) -> u16 {
        match self {
            ConnectStatus::Ok => 0,
            ConnectStatus::ScopeMismatch => 2,
            ConnectStatus::CapacityExceeded => 5,
            ConnectStatus::DuplicateUid => 6,
            ConnectStatus::InvalidClientEntry => 7,
            ConnectStatus::InvalidUid => 8,
        }
    }

    #[inline]
    pub fn from_u16(raw: u16) -> Option<ConnectStatus> {
        match raw {
            0 => Some(ConnectStatus::Ok),
            2 => Some(ConnectStatus::ScopeMismatch),
            5 => Some(ConnectStatus::CapacityExceeded),
            6 => Some(ConnectStatus::DuplicateUid),
            7 => Some(ConnectStatus::InvalidClientEntry),
            8 => Some(ConnectStatus::InvalidUid),
            _ => None,
        }
    }
}

/// Reason field of a Disconnect message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    Shutdown,
    CapacityExhausted,
    HardwareFault,
    SoftwareFault,
    SoftwareReset,
    IncorrectScope,
    RptReconfigure,
    LlrpReconfigure,
    UserReconfigure,
}

impl DisconnectReason {
    #[inline]
    pub fn as_u16(self) -> u16 {
        match self {
            DisconnectReason::Shutdown => 0,
            DisconnectReason::CapacityExhausted => 1,
            DisconnectReason::HardwareFault => 2,
            DisconnectReason::SoftwareFault => 3,
            DisconnectReason::SoftwareReset => 4,
            DisconnectReason::IncorrectScope => 5,
            DisconnectReason::RptReconfigure => 6,
            DisconnectReason::LlrpReconfigure => 7,
            DisconnectReason::UserReconfigure => 8,
        }
    }

    #[inline]
    pub fn from_u16(raw: u16) -> Option<DisconnectReason> {
        match raw {
            0 => Some(DisconnectReason::Shutdown),
            1 => Some(DisconnectReason::CapacityExhausted),
            2 => Some(DisconnectReason::HardwareFault),
            3 => Some(DisconnectReason::SoftwareFault),
            4 => Some(DisconnectReason::SoftwareReset),
            5 => Some(DisconnectReason::IncorrectScope),
            6 => Some(DisconnectReason::RptReconfigure),
            7 => Some(DisconnectReason::LlrpReconfigure),
            8 => Some(DisconnectReason::UserReconfigure),
            _ => None,
        }
    }
}

/// Status code of an RPT Status message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RptStatusCode {
    UnknownRptUid,
    RdmTimeout,
    RdmInvalidResponse,
    UnknownRdmUid,
    UnknownEndpoint,
    BroadcastComplete,
    UnknownVector,
    InvalidMessage,
    InvalidCommandClass,
}

impl RptStatusCode {
    #[inline]
    pub fn as_u16(self) -> u16 {
        match self {
            RptStatusCode::UnknownRptUid => 1,
            RptStatusCode::RdmTimeout => 2,
            RptStatusCode::RdmInvalidResponse => 3,
            RptStatusCode::UnknownRdmUid => 4,
            RptStatusCode::UnknownEndpoint => 5,
            RptStatusCode::BroadcastComplete => 6,
            RptStatusCode::UnknownVector => 7,
            RptStatusCode::InvalidMessage => 8,
            RptStatusCode::InvalidCommandClass => 9,
        }
    }

    #[inline]
    pub fn from_u16(raw: u16) -> Option<RptStatusCode> {
        match raw {
            1 => Some(RptStatusCode::UnknownRptUid),
            2 => Some(RptStatusCode::RdmTimeout),
            3 => Some(RptStatusCode::RdmInvalidResponse),
            4 => Some(RptStatusCode::UnknownRdmUid),
            5 => Some(RptStatusCode::UnknownEndpoint),
            6 => Some(RptStatusCode::BroadcastComplete),
            7 => Some(RptStatusCode::UnknownVector),
            8 => Some(RptStatusCode::InvalidMessage),
            9 => Some(RptStatusCode::InvalidCommandClass),
            _ => None,
        }
    }

    /// Codes that may be followed by a status string on the wire.
    #[inline]
    pub fn allows_string(self) -> bool {
        !matches!(
            self,
            RptStatusCode::InvalidMessage | RptStatusCode::InvalidCommandClass
        )
    }
}

/// Per-item result in an AssignedDynamicUids message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DynamicUidStatus {
    Ok,
    InvalidRequest,
    UidNotFound,
    DuplicateUid,
    CapacityExhausted,
}

impl DynamicUidStatus {
    #[inline]
    pub fn as_u16(self) -> u16 {
        match self {
            DynamicUidStatus::Ok => 0,
            DynamicUidStatus::InvalidRequest => 1,
            DynamicUidStatus::UidNotFound => 2,
            DynamicUidStatus::DuplicateUid => 3,
            DynamicUidStatus::CapacityExhausted => 4,
        }
    }

    #[inline]
    pub fn from_u16(raw: u16) -> Option<DynamicUidStatus> {
        match raw {
            0 => Some(DynamicUidStatus::Ok),
            1 => Some(DynamicUidStatus::InvalidRequest),
            2 => Some(DynamicUidStatus::UidNotFound),
            3 => Some(DynamicUidStatus::DuplicateUid),
            4 => Some(DynamicUidStatus::CapacityExhausted),
            _ => None,
        }
    }
}

/// Role declared in an RPT client entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RptClientType {
    Device,
    Controller,
    Unknown,
}

impl RptClientType {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            RptClientType::Device => 0x00,
            RptClientType::Controller => 0x01,
            RptClientType::Unknown => 0xff,
        }
    }

    #[inline]
    pub fn from_u8(raw: u8) -> RptClientType {
        match raw {
            0x00 => RptClientType::Device,
            0x01 => RptClientType::Controller,
            _ => RptClientType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RptClientEntry {
    pub cid: Cid,
    pub uid: Uid,
    pub client_type: RptClientType,
    pub binding_cid: Cid,
}

/// EPT is reserved; entries are parsed for their CID and refused at the
/// handshake, so no sub-protocol list is modeled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EptClientEntry {
    pub cid: Cid,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientEntry {
    Rpt(RptClientEntry),
    Ept(EptClientEntry),
}

impl ClientEntry {
    #[inline]
    pub fn cid(&self) -> Cid {
        match self {
            ClientEntry::Rpt(e) => e.cid,
            ClientEntry::Ept(e) => e.cid,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientConnectMsg {
    pub scope: String,
    pub e133_version: u16,
    pub search_domain: String,
    pub connect_flags: u8,
    pub client_entry: ClientEntry,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectReplyMsg {
    pub status: ConnectStatus,
    pub e133_version: u16,
    pub broker_uid: Uid,
    pub client_uid: Uid,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientEntryUpdateMsg {
    pub connect_flags: u8,
    pub client_entry: ClientEntry,
}

/// Operation conveyed by a client list message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientListAction {
    Connected,
    Add,
    Remove,
    Change,
}

impl ClientListAction {
    #[inline]
    pub fn as_vector(self) -> u16 {
        match self {
            ClientListAction::Connected => proto::VECTOR_BROKER_CONNECTED_CLIENT_LIST,
            ClientListAction::Add => proto::VECTOR_BROKER_CLIENT_ADD,
            ClientListAction::Remove => proto::VECTOR_BROKER_CLIENT_REMOVE,
            ClientListAction::Change => proto::VECTOR_BROKER_CLIENT_ENTRY_CHANGE,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientListMsg {
    pub action: ClientListAction,
    pub entries: Vec<RptClientEntry>,
    pub more_coming: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicUidRequest {
    pub uid: Uid,
    pub rid: Cid,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicUidRequestList {
    pub requests: Vec<DynamicUidRequest>,
    pub more_coming: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicUidMapping {
    pub uid: Uid,
    pub rid: Cid,
    pub status: DynamicUidStatus,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicUidAssignmentList {
    pub mappings: Vec<DynamicUidMapping>,
    pub more_coming: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FetchUidList {
    pub uids: Vec<Uid>,
    pub more_coming: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BrokerMessage {
    ClientConnect(ClientConnectMsg),
    ConnectReply(ConnectReplyMsg),
    ClientEntryUpdate(ClientEntryUpdateMsg),
    Redirect(SocketAddr),
    FetchClientList,
    ClientList(ClientListMsg),
    RequestDynamicUids(DynamicUidRequestList),
    AssignedDynamicUids(DynamicUidAssignmentList),
    FetchDynamicUidList(FetchUidList),
    Disconnect(DisconnectReason),
    Null,
}

/// Addressing and sequencing fields shared by all RPT messages.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RptHeader {
    pub source_uid: Uid,
    pub source_endpoint: u16,
    pub dest_uid: Uid,
    pub dest_endpoint: u16,
    pub seqnum: u32,
}

impl RptHeader {
    /// Header for a reply travelling back toward the original source.
    #[inline]
    pub fn swapped_for_reply(&self) -> RptHeader {
        RptHeader {
            source_uid: self.dest_uid,
            source_endpoint: self.dest_endpoint,
            dest_uid: self.source_uid,
            dest_endpoint: self.source_endpoint,
            seqnum: self.seqnum,
        }
    }
}

/// One RDM packet, carried opaquely.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RdmBuffer {
    pub data: Vec<u8>,
}

impl RdmBuffer {
    #[inline]
    pub fn new(data: Vec<u8>) -> RdmBuffer {
        RdmBuffer { data }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RdmBufList {
    pub buffers: Vec<RdmBuffer>,
    pub more_coming: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RptStatusMsg {
    pub status_code: RptStatusCode,
    pub status_string: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RptContent {
    Request(RdmBufList),
    Notification(RdmBufList),
    Status(RptStatusMsg),
}

impl RptContent {
    #[inline]
    pub fn vector(&self) -> u32 {
        match self {
            RptContent::Request(_) => proto::VECTOR_RPT_REQUEST,
            RptContent::Notification(_) => proto::VECTOR_RPT_NOTIFICATION,
            RptContent::Status(_) => proto::VECTOR_RPT_STATUS,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RptMessage {
    pub header: RptHeader,
    pub content: RptContent,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageContent {
    Broker(BrokerMessage),
    Rpt(RptMessage),
}

/// A fully decoded frame: who sent it and what it carries.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RdmnetMessage {
    pub sender_cid: Cid,
    pub content: MessageContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(ConnectStatus::Ok.as_u16(), 0);
        assert_eq!(ConnectStatus::ScopeMismatch.as_u16(), 2);
        assert_eq!(ConnectStatus::CapacityExceeded.as_u16(), 5);
        assert_eq!(ConnectStatus::DuplicateUid.as_u16(), 6);
        assert_eq!(ConnectStatus::InvalidClientEntry.as_u16(), 7);
        assert_eq!(ConnectStatus::InvalidUid.as_u16(), 8);
        assert_eq!(ConnectStatus::from_u16(3), None);

        assert_eq!(DisconnectReason::Shutdown.as_u16(), 0);
        assert_eq!(RptStatusCode::UnknownRptUid.as_u16(), 1);
        assert_eq!(RptStatusCode::InvalidCommandClass.as_u16(), 9);
    }

    #[test]
    fn test_status_string_permission() {
        assert!(RptStatusCode::UnknownRptUid.allows_string());
        assert!(RptStatusCode::BroadcastComplete.allows_string());
        assert!(!RptStatusCode::InvalidMessage.allows_string());
        assert!(!RptStatusCode::InvalidCommandClass.allows_string());
    }

    #[test]
    fn test_client_type_roundtrip() {
        for ty in [RptClientType::Device, RptClientType::Controller, RptClientType::Unknown] {
            assert_eq!(RptClientType::from_u8(ty.as_u8()), ty);
        }
        assert_eq!(RptClientType::from_u8(0x42), RptClientType::Unknown);
    }

    #[test]
    fn test_header_swap() {
        let header = RptHeader {
            source_uid: Uid::new(0x6574, 2),
            source_endpoint: 7,
            dest_uid: Uid::new(0x6574, 3),
            dest_endpoint: 9,
            seqnum: 41,
        };

        let swapped = header.swapped_for_reply();

        assert_eq!(swapped.source_uid, header.dest_uid);
        assert_eq!(swapped.dest_uid, header.source_uid);
        assert_eq!(swapped.source_endpoint, header.dest_endpoint);
        assert_eq!(swapped.dest_endpoint, header.source_endpoint);
        assert_eq!(swapped.seqnum, header.seqnum);
    }
}
