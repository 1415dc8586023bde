//! Resumable stream parser for framed PDU messages.
//!
//! Bytes are appended to a bounded flat buffer; `next_message` locates the
//! TCP preamble and then walks the nested PDU blocks (root layer, then the
//! broker or RPT layer, then sub-messages), consuming input as it goes. The
//! parser may be interrupted at any byte boundary: every nesting level keeps
//! a block state recording how far it got, so a later call resumes without
//! re-reading consumed bytes.
//!
//! Malformed headers and unknown vectors never kill the stream. The
//! offending block is drained (`consuming_bad_block`), a protocol error is
//! reported, and parsing resumes at the next block. Unbounded lists are
//! delivered in batches: when a batch fills mid-list the accumulated items
//! are handed out with `more_coming` set and the list continues on the next
//! call.

use byteorder::{BigEndian, ByteOrder};
use lumen::logging::{warn, Logger};
use lumen::{Cid, Uid};
use std::mem;

use crate::net::msgs::*;
use crate::net::proto;

/// Default inbound buffer bound. Individual list items parse incrementally,
/// so this only needs to hold the largest indivisible chunk of a message
/// plus framing, with generous slack.
pub const DEFAULT_MSG_BUF_CAPACITY: usize = 64 * 1024;

/// Most list items delivered in one message; the remainder arrives in
/// follow-up messages flagged `more_coming`.
const MAX_LIST_BATCH: usize = 256;

/// Outcome of one low-level block parse.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseResult {
    FullBlockOk,
    FullBlockProtErr,
    PartialBlockOk,
    PartialBlockProtErr,
    NoData,
}

/// Outcome of one `next_message` call.
#[derive(Debug)]
pub enum ParseStatus {
    /// A message was decoded; ownership of its lists passes to the caller.
    Message(RdmnetMessage),
    /// A malformed or unrecognized block was drained.
    ProtocolError,
    /// Nothing further can be decoded until more bytes arrive.
    NoData,
}

#[derive(Debug, Default)]
struct PduBlockState {
    block_size: usize,
    size_parsed: usize,
    parsed_header: bool,
    consuming_bad_block: bool,
}

impl PduBlockState {
    fn new(block_size: usize) -> PduBlockState {
        PduBlockState {
            block_size,
            size_parsed: 0,
            parsed_header: false,
            consuming_bad_block: false,
        }
    }
}

/// Discards the remainder of a block that cannot be parsed. Consumes at most
/// what is buffered; the rest is discarded on later calls.
fn consume_bad_block(block: &mut PduBlockState, data_len: usize) -> (usize, ParseResult) {
    let size_remaining = block.block_size - block.size_parsed;
    if data_len >= size_remaining {
        block.size_parsed = block.block_size;
        (size_remaining, ParseResult::FullBlockProtErr)
    } else {
        block.size_parsed += data_len;
        block.consuming_bad_block = true;
        (data_len, ParseResult::NoData)
    }
}

/// A finished PDU inside an unfinished enclosing block is a partial result
/// for the enclosing level, and the next PDU's header is still to come.
fn check_for_full_parse(prev: ParseResult, block: &mut PduBlockState) -> ParseResult {
    match prev {
        ParseResult::FullBlockOk | ParseResult::FullBlockProtErr => {
            let res = if block.size_parsed < block.block_size {
                if prev == ParseResult::FullBlockProtErr {
                    ParseResult::PartialBlockProtErr
                } else {
                    ParseResult::PartialBlockOk
                }
            } else {
                prev
            };
            block.parsed_header = false;
            res
        }
        other => other,
    }
}

struct RlpState {
    block: PduBlockState,
    vector: u32,
    sender_cid: Cid,
    layer: LayerState,
}

enum LayerState {
    None,
    Broker(BrokerState),
    Rpt(RptState),
    Unknown(PduBlockState),
}

impl RlpState {
    fn new(block_size: usize) -> RlpState {
        RlpState {
            block: PduBlockState::new(block_size),
            vector: 0,
            sender_cid: Cid::default(),
            layer: LayerState::None,
        }
    }

    fn init_layer(&mut self, pdu_data_len: usize, log: &Logger) {
        self.layer = match self.vector {
            proto::VECTOR_ROOT_BROKER => LayerState::Broker(BrokerState::new(pdu_data_len)),
            proto::VECTOR_ROOT_RPT => LayerState::Rpt(RptState::new(pdu_data_len)),
            other => {
                warn!(log, "dropping root layer PDU with unknown vector"; "vector" => other);
                LayerState::Unknown(PduBlockState::new(pdu_data_len))
            }
        };
    }
}

struct BrokerState {
    block: PduBlockState,
    vector: u16,
    data: BrokerData,
}

enum BrokerData {
    /// Fixed-size or empty messages; parsed in one piece.
    Fixed,
    ClientConnect(ClientConnectState),
    ClientEntryUpdate(ClientEntryUpdateState),
    ClientList(ClientListState),
    UidRequestList(GenericListState<DynamicUidRequest>),
    UidAssignmentList(GenericListState<DynamicUidMapping>),
    FetchUidList(GenericListState<Uid>),
    Unknown(PduBlockState),
}

struct ClientConnectState {
    pdu_data_size: usize,
    common: Option<ConnectCommon>,
    entry: ClientEntryState,
}

struct ConnectCommon {
    scope: String,
    e133_version: u16,
    search_domain: String,
    connect_flags: u8,
}

struct ClientEntryUpdateState {
    pdu_data_size: usize,
    connect_flags: Option<u8>,
    entry: ClientEntryState,
}

struct ClientEntryState {
    enclosing_block_size: usize,
    protocol: Option<u32>,
    cid: Cid,
    entry_data: PduBlockState,
}

impl ClientEntryState {
    fn new(enclosing_block_size: usize) -> ClientEntryState {
        ClientEntryState {
            enclosing_block_size,
            protocol: None,
            cid: Cid::default(),
            entry_data: PduBlockState::default(),
        }
    }
}

struct ClientListState {
    block: PduBlockState,
    protocol: Option<u32>,
    entry: ClientEntryState,
    entries: Vec<RptClientEntry>,
}

struct GenericListState<T> {
    size_parsed: usize,
    full_size: usize,
    items: Vec<T>,
}

impl<T> GenericListState<T> {
    fn new(full_size: usize) -> GenericListState<T> {
        GenericListState { size_parsed: 0, full_size, items: Vec::new() }
    }
}

impl BrokerState {
    fn new(block_size: usize) -> BrokerState {
        BrokerState {
            block: PduBlockState::new(block_size),
            vector: 0,
            data: BrokerData::Fixed,
        }
    }

    fn init_data(&mut self, pdu_data_len: usize, log: &Logger) {
        let mut bad_length = false;
        self.data = match self.vector {
            proto::VECTOR_BROKER_CONNECT => {
                if pdu_data_len >= proto::CLIENT_CONNECT_DATA_MIN_SIZE {
                    BrokerData::ClientConnect(ClientConnectState {
                        pdu_data_size: pdu_data_len,
                        common: None,
                        entry: ClientEntryState::new(0),
                    })
                } else {
                    bad_length = true;
                    BrokerData::Fixed
                }
            }
            proto::VECTOR_BROKER_CONNECT_REPLY => {
                if pdu_data_len != proto::CONNECT_REPLY_DATA_SIZE {
                    bad_length = true;
                }
                BrokerData::Fixed
            }
            proto::VECTOR_BROKER_CLIENT_ENTRY_UPDATE => {
                if pdu_data_len >= proto::CLIENT_ENTRY_UPDATE_DATA_MIN_SIZE {
                    BrokerData::ClientEntryUpdate(ClientEntryUpdateState {
                        pdu_data_size: pdu_data_len,
                        connect_flags: None,
                        entry: ClientEntryState::new(0),
                    })
                } else {
                    bad_length = true;
                    BrokerData::Fixed
                }
            }
            proto::VECTOR_BROKER_REDIRECT_V4 => {
                if pdu_data_len != proto::REDIRECT_V4_DATA_SIZE {
                    bad_length = true;
                }
                BrokerData::Fixed
            }
            proto::VECTOR_BROKER_REDIRECT_V6 => {
                if pdu_data_len != proto::REDIRECT_V6_DATA_SIZE {
                    bad_length = true;
                }
                BrokerData::Fixed
            }
            proto::VECTOR_BROKER_CONNECTED_CLIENT_LIST
            | proto::VECTOR_BROKER_CLIENT_ADD
            | proto::VECTOR_BROKER_CLIENT_REMOVE
            | proto::VECTOR_BROKER_CLIENT_ENTRY_CHANGE => BrokerData::ClientList(ClientListState {
                block: PduBlockState::new(pdu_data_len),
                protocol: None,
                entry: ClientEntryState::new(0),
                entries: Vec::new(),
            }),
            proto::VECTOR_BROKER_REQUEST_DYNAMIC_UIDS => {
                if pdu_data_len > 0 && pdu_data_len % proto::DYNAMIC_UID_REQUEST_PAIR_SIZE == 0 {
                    BrokerData::UidRequestList(GenericListState::new(pdu_data_len))
                } else {
                    bad_length = true;
                    BrokerData::Fixed
                }
            }
            proto::VECTOR_BROKER_ASSIGNED_DYNAMIC_UIDS => {
                if pdu_data_len > 0 && pdu_data_len % proto::DYNAMIC_UID_MAPPING_SIZE == 0 {
                    BrokerData::UidAssignmentList(GenericListState::new(pdu_data_len))
                } else {
                    bad_length = true;
                    BrokerData::Fixed
                }
            }
            proto::VECTOR_BROKER_FETCH_DYNAMIC_UID_LIST => {
                if pdu_data_len > 0 && pdu_data_len % proto::FETCH_UID_ITEM_SIZE == 0 {
                    BrokerData::FetchUidList(GenericListState::new(pdu_data_len))
                } else {
                    bad_length = true;
                    BrokerData::Fixed
                }
            }
            proto::VECTOR_BROKER_NULL | proto::VECTOR_BROKER_FETCH_CLIENT_LIST => {
                if pdu_data_len != 0 {
                    bad_length = true;
                }
                BrokerData::Fixed
            }
            proto::VECTOR_BROKER_DISCONNECT => {
                if pdu_data_len != proto::DISCONNECT_DATA_SIZE {
                    bad_length = true;
                }
                BrokerData::Fixed
            }
            other => {
                warn!(log, "dropping broker PDU with unknown vector"; "vector" => other);
                BrokerData::Unknown(PduBlockState::new(pdu_data_len))
            }
        };

        if bad_length {
            warn!(log, "dropping broker PDU with invalid length";
                  "vector" => self.vector, "data_len" => pdu_data_len);
            // Artificial unknown vector so the data section is consumed.
            self.vector = 0xffff;
            self.data = BrokerData::Unknown(PduBlockState::new(pdu_data_len));
        }
    }
}

struct RptState {
    block: PduBlockState,
    vector: u32,
    header: RptHeader,
    data: RptData,
}

enum RptData {
    None,
    RdmList(RdmListState),
    Status(RptStatusState),
    Unknown(PduBlockState),
}

struct RdmListState {
    block: PduBlockState,
    parsed_list_header: bool,
    buffers: Vec<RdmBuffer>,
}

struct RptStatusState {
    block: PduBlockState,
    status_code: u16,
}

impl RptState {
    fn new(block_size: usize) -> RptState {
        RptState {
            block: PduBlockState::new(block_size),
            vector: 0,
            header: RptHeader::default(),
            data: RptData::None,
        }
    }

    fn init_data(&mut self, pdu_data_len: usize, log: &Logger) {
        self.data = match self.vector {
            proto::VECTOR_RPT_REQUEST | proto::VECTOR_RPT_NOTIFICATION => {
                if pdu_data_len >= proto::REQUEST_NOTIF_PDU_HEADER_SIZE {
                    RptData::RdmList(RdmListState {
                        block: PduBlockState::new(pdu_data_len),
                        parsed_list_header: false,
                        buffers: Vec::new(),
                    })
                } else {
                    warn!(log, "dropping RPT PDU with invalid length"; "data_len" => pdu_data_len);
                    self.vector = 0xffff_ffff;
                    RptData::Unknown(PduBlockState::new(pdu_data_len))
                }
            }
            proto::VECTOR_RPT_STATUS => {
                if pdu_data_len >= proto::RPT_STATUS_HEADER_SIZE {
                    RptData::Status(RptStatusState {
                        block: PduBlockState::new(pdu_data_len),
                        status_code: 0,
                    })
                } else {
                    warn!(log, "dropping RPT PDU with invalid length"; "data_len" => pdu_data_len);
                    self.vector = 0xffff_ffff;
                    RptData::Unknown(PduBlockState::new(pdu_data_len))
                }
            }
            other => {
                warn!(log, "dropping RPT PDU with unknown vector"; "vector" => other);
                RptData::Unknown(PduBlockState::new(pdu_data_len))
            }
        };
    }
}

/// Per-connection inbound buffer plus the parse state riding on top of it.
pub struct MsgBuf {
    buf: Vec<u8>,
    capacity: usize,
    rlp: Option<RlpState>,
    log: Logger,
}

impl MsgBuf {
    pub fn new(log: &Logger) -> MsgBuf {
        MsgBuf::with_capacity(log, DEFAULT_MSG_BUF_CAPACITY)
    }

    pub fn with_capacity(log: &Logger, capacity: usize) -> MsgBuf {
        MsgBuf {
            buf: Vec::with_capacity(capacity),
            capacity,
            rlp: None,
            log: log.clone(),
        }
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Appends bytes up to the buffer bound; returns how many were taken.
    /// Call `next_message` to drain before re-feeding the remainder.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free_space());
        self.buf.extend_from_slice(&bytes[..take]);
        take
    }

    /// Attempts to decode the next message from the buffered bytes. Call in
    /// a loop until `NoData`; `ProtocolError` means a block was discarded
    /// and parsing can continue.
    pub fn next_message(&mut self) -> ParseStatus {
        if self.rlp.is_none() {
            match self.locate_tcp_preamble() {
                Some(block_len) if block_len > 0 => {
                    self.rlp = Some(RlpState::new(block_len));
                }
                _ => return ParseStatus::NoData,
            }
        }

        let rlp = self.rlp.as_mut().expect("preamble guarantees root state");
        let (consumed, res, content) = parse_rlp_block(rlp, &self.buf, &self.log);
        let sender_cid = rlp.sender_cid;

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        if matches!(res, ParseResult::FullBlockOk | ParseResult::FullBlockProtErr) {
            self.rlp = None;
        }

        match res {
            ParseResult::FullBlockOk | ParseResult::PartialBlockOk => match content {
                Some(content) => ParseStatus::Message(RdmnetMessage { sender_cid, content }),
                None => ParseStatus::NoData,
            },
            ParseResult::FullBlockProtErr | ParseResult::PartialBlockProtErr => {
                ParseStatus::ProtocolError
            }
            ParseResult::NoData => ParseStatus::NoData,
        }
    }

    /// Scans for the packet identifier, discarding bytes that definitively
    /// cannot start a preamble. Returns the RLP block length on a match.
    fn locate_tcp_preamble(&mut self) -> Option<usize> {
        let ident_len = proto::ACN_PACKET_IDENT.len();
        let len = self.buf.len();
        if len < ident_len {
            return None;
        }

        let mut i = 0;
        while i + ident_len <= len {
            if self.buf[i..i + ident_len] == proto::ACN_PACKET_IDENT {
                if i + proto::TCP_PREAMBLE_SIZE <= len {
                    let block_len = BigEndian::read_u32(&self.buf[i + ident_len..]) as usize;
                    self.buf.drain(..i + proto::TCP_PREAMBLE_SIZE);
                    return Some(block_len);
                }
                // Identifier complete, block length still in flight.
                break;
            }
            i += 1;
        }
        if i > 0 {
            self.buf.drain(..i);
        }
        None
    }
}

fn parse_rlp_block(
    rlp: &mut RlpState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<MessageContent>) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;
    let mut out = None;

    if rlp.block.consuming_bad_block {
        let (n, r) = consume_bad_block(&mut rlp.block, data.len());
        bytes_parsed += n;
        res = r;
    } else if !rlp.block.parsed_header {
        let mut parse_err = false;

        if rlp.block.block_size - rlp.block.size_parsed < proto::RLP_HEADER_SIZE {
            parse_err = true;
        } else if data.len() >= proto::RLP_HEADER_SIZE {
            // Inheritance is disallowed at the root layer; only the
            // length-extended flags form is accepted.
            if (data[0] & 0xf0) == proto::PDU_FLAGS {
                let pdu_len = proto::pdu_length(data);
                let vector = BigEndian::read_u32(&data[3..]);
                let sender_cid = read_cid(&data[7..]);
                bytes_parsed += proto::RLP_HEADER_SIZE;
                rlp.block.size_parsed += proto::RLP_HEADER_SIZE;
                if pdu_len >= proto::RLP_HEADER_SIZE
                    && rlp.block.size_parsed + (pdu_len - proto::RLP_HEADER_SIZE)
                        <= rlp.block.block_size
                {
                    rlp.vector = vector;
                    rlp.sender_cid = sender_cid;
                    rlp.block.parsed_header = true;
                    rlp.init_layer(pdu_len - proto::RLP_HEADER_SIZE, log);
                } else {
                    parse_err = true;
                }
            } else {
                parse_err = true;
            }
        }

        if parse_err {
            let (n, r) = consume_bad_block(&mut rlp.block, data.len() - bytes_parsed);
            bytes_parsed += n;
            res = r;
            warn!(log, "protocol error while parsing root layer PDU header");
        }
    }

    if rlp.block.parsed_header {
        let remaining = &data[bytes_parsed..];
        let (n, r, content) = match &mut rlp.layer {
            LayerState::Broker(bstate) => {
                let (n, r, msg) = parse_broker_block(bstate, remaining, log);
                (n, r, msg.map(MessageContent::Broker))
            }
            LayerState::Rpt(rstate) => {
                let (n, r, msg) = parse_rpt_block(rstate, remaining, log);
                (n, r, msg.map(MessageContent::Rpt))
            }
            LayerState::Unknown(block) => {
                let (n, r) = consume_bad_block(block, remaining.len());
                (n, r, None)
            }
            LayerState::None => (0, ParseResult::NoData, None),
        };
        rlp.block.size_parsed += n;
        bytes_parsed += n;
        res = check_for_full_parse(r, &mut rlp.block);
        out = content;
    }

    (bytes_parsed, res, out)
}

fn parse_broker_block(
    b: &mut BrokerState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<BrokerMessage>) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;
    let mut out = None;

    if b.block.consuming_bad_block {
        let (n, r) = consume_bad_block(&mut b.block, data.len());
        bytes_parsed += n;
        res = r;
    } else if !b.block.parsed_header {
        let mut parse_err = false;

        if b.block.block_size - b.block.size_parsed < proto::BROKER_PDU_HEADER_SIZE {
            parse_err = true;
        } else if data.len() >= proto::BROKER_PDU_HEADER_SIZE {
            let pdu_len = proto::pdu_length(data);
            if pdu_len >= proto::BROKER_PDU_HEADER_SIZE
                && b.block.size_parsed + pdu_len <= b.block.block_size
            {
                let pdu_data_len = pdu_len - proto::BROKER_PDU_HEADER_SIZE;
                b.vector = BigEndian::read_u16(&data[3..]);
                bytes_parsed += proto::BROKER_PDU_HEADER_SIZE;
                b.block.size_parsed += proto::BROKER_PDU_HEADER_SIZE;
                b.block.parsed_header = true;
                b.init_data(pdu_data_len, log);
            } else {
                parse_err = true;
            }
        }

        if parse_err {
            let (n, r) = consume_bad_block(&mut b.block, data.len() - bytes_parsed);
            bytes_parsed += n;
            res = r;
            warn!(log, "protocol error while parsing broker PDU header");
        }
    }

    if b.block.parsed_header {
        let remaining = &data[bytes_parsed..];
        let (n, r, msg) = parse_broker_data(b, remaining, log);
        b.block.size_parsed += n;
        bytes_parsed += n;
        res = check_for_full_parse(r, &mut b.block);
        out = msg;
    }

    (bytes_parsed, res, out)
}

fn parse_broker_data(
    b: &mut BrokerState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<BrokerMessage>) {
    let vector = b.vector;
    match &mut b.data {
        BrokerData::ClientConnect(st) => parse_client_connect(st, data, log),
        BrokerData::ClientEntryUpdate(st) => parse_client_entry_update(st, data, log),
        BrokerData::ClientList(st) => {
            let (n, r) = parse_client_list(st, data, log);
            let msg = list_result(r).map(|more| {
                BrokerMessage::ClientList(ClientListMsg {
                    action: action_from_vector(vector),
                    entries: mem::take(&mut st.entries),
                    more_coming: more,
                })
            });
            (n, r, msg)
        }
        BrokerData::UidRequestList(st) => {
            let (n, r) = parse_generic_list(st, data, proto::DYNAMIC_UID_REQUEST_PAIR_SIZE, |d| {
                DynamicUidRequest { uid: read_uid(d), rid: read_cid(&d[6..]) }
            });
            let msg = list_result(r).map(|more| {
                BrokerMessage::RequestDynamicUids(DynamicUidRequestList {
                    requests: mem::take(&mut st.items),
                    more_coming: more,
                })
            });
            (n, r, msg)
        }
        BrokerData::UidAssignmentList(st) => {
            let (n, r) = parse_generic_list(st, data, proto::DYNAMIC_UID_MAPPING_SIZE, |d| {
                DynamicUidMapping {
                    uid: read_uid(d),
                    rid: read_cid(&d[6..]),
                    status: DynamicUidStatus::from_u16(BigEndian::read_u16(&d[22..]))
                        .unwrap_or(DynamicUidStatus::InvalidRequest),
                }
            });
            let msg = list_result(r).map(|more| {
                BrokerMessage::AssignedDynamicUids(DynamicUidAssignmentList {
                    mappings: mem::take(&mut st.items),
                    more_coming: more,
                })
            });
            (n, r, msg)
        }
        BrokerData::FetchUidList(st) => {
            let (n, r) = parse_generic_list(st, data, proto::FETCH_UID_ITEM_SIZE, read_uid);
            let msg = list_result(r).map(|more| {
                BrokerMessage::FetchDynamicUidList(FetchUidList {
                    uids: mem::take(&mut st.items),
                    more_coming: more,
                })
            });
            (n, r, msg)
        }
        BrokerData::Fixed => parse_broker_fixed(vector, data),
        BrokerData::Unknown(block) => {
            let (n, r) = consume_bad_block(block, data.len());
            (n, r, None)
        }
    }
}

/// `Some(more_coming)` when a list parse produced a deliverable message.
#[inline]
fn list_result(res: ParseResult) -> Option<bool> {
    match res {
        ParseResult::FullBlockOk => Some(false),
        ParseResult::PartialBlockOk => Some(true),
        _ => None,
    }
}

fn action_from_vector(vector: u16) -> ClientListAction {
    match vector {
        proto::VECTOR_BROKER_CLIENT_ADD => ClientListAction::Add,
        proto::VECTOR_BROKER_CLIENT_REMOVE => ClientListAction::Remove,
        proto::VECTOR_BROKER_CLIENT_ENTRY_CHANGE => ClientListAction::Change,
        _ => ClientListAction::Connected,
    }
}

/// Messages whose data section has a single fixed layout.
fn parse_broker_fixed(vector: u16, data: &[u8]) -> (usize, ParseResult, Option<BrokerMessage>) {
    match vector {
        proto::VECTOR_BROKER_CONNECT_REPLY => {
            if data.len() < proto::CONNECT_REPLY_DATA_SIZE {
                return (0, ParseResult::NoData, None);
            }
            let raw_status = BigEndian::read_u16(data);
            match ConnectStatus::from_u16(raw_status) {
                Some(status) => {
                    let msg = BrokerMessage::ConnectReply(ConnectReplyMsg {
                        status,
                        e133_version: BigEndian::read_u16(&data[2..]),
                        broker_uid: read_uid(&data[4..]),
                        client_uid: read_uid(&data[10..]),
                    });
                    (proto::CONNECT_REPLY_DATA_SIZE, ParseResult::FullBlockOk, Some(msg))
                }
                None => (proto::CONNECT_REPLY_DATA_SIZE, ParseResult::FullBlockProtErr, None),
            }
        }
        proto::VECTOR_BROKER_REDIRECT_V4 => {
            if data.len() < proto::REDIRECT_V4_DATA_SIZE {
                return (0, ParseResult::NoData, None);
            }
            let ip = std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = BigEndian::read_u16(&data[4..]);
            let msg = BrokerMessage::Redirect(std::net::SocketAddr::from((ip, port)));
            (proto::REDIRECT_V4_DATA_SIZE, ParseResult::FullBlockOk, Some(msg))
        }
        proto::VECTOR_BROKER_REDIRECT_V6 => {
            if data.len() < proto::REDIRECT_V6_DATA_SIZE {
                return (0, ParseResult::NoData, None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = BigEndian::read_u16(&data[16..]);
            let msg = BrokerMessage::Redirect(std::net::SocketAddr::from((ip, port)));
            (proto::REDIRECT_V6_DATA_SIZE, ParseResult::FullBlockOk, Some(msg))
        }
        proto::VECTOR_BROKER_DISCONNECT => {
            if data.len() < proto::DISCONNECT_DATA_SIZE {
                return (0, ParseResult::NoData, None);
            }
            match DisconnectReason::from_u16(BigEndian::read_u16(data)) {
                Some(reason) => (
                    proto::DISCONNECT_DATA_SIZE,
                    ParseResult::FullBlockOk,
                    Some(BrokerMessage::Disconnect(reason)),
                ),
                None => (proto::DISCONNECT_DATA_SIZE, ParseResult::FullBlockProtErr, None),
            }
        }
        proto::VECTOR_BROKER_NULL => (0, ParseResult::FullBlockOk, Some(BrokerMessage::Null)),
        proto::VECTOR_BROKER_FETCH_CLIENT_LIST => {
            (0, ParseResult::FullBlockOk, Some(BrokerMessage::FetchClientList))
        }
        _ => (0, ParseResult::NoData, None),
    }
}

fn parse_client_connect(
    st: &mut ClientConnectState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<BrokerMessage>) {
    let mut bytes_parsed = 0;

    if st.common.is_none() {
        // The common fields parse in one piece.
        if data.len() < proto::CLIENT_CONNECT_COMMON_FIELD_SIZE {
            return (0, ParseResult::NoData, None);
        }
        let scope = read_padded_string(&data[..lumen::SCOPE_STRING_PADDED_LENGTH]);
        let e133_version = BigEndian::read_u16(&data[lumen::SCOPE_STRING_PADDED_LENGTH..]);
        let domain_at = lumen::SCOPE_STRING_PADDED_LENGTH + 2;
        let search_domain =
            read_padded_string(&data[domain_at..domain_at + lumen::DOMAIN_STRING_PADDED_LENGTH]);
        let connect_flags = data[proto::CLIENT_CONNECT_COMMON_FIELD_SIZE - 1];

        st.common = Some(ConnectCommon { scope, e133_version, search_domain, connect_flags });
        bytes_parsed += proto::CLIENT_CONNECT_COMMON_FIELD_SIZE;
        st.entry =
            ClientEntryState::new(st.pdu_data_size - proto::CLIENT_CONNECT_COMMON_FIELD_SIZE);
    }

    let (n, res, entry) = parse_single_client_entry(&mut st.entry, &data[bytes_parsed..], log);
    bytes_parsed += n;

    let msg = entry.map(|client_entry| {
        let c = st.common.take().expect("common fields precede the client entry");
        BrokerMessage::ClientConnect(ClientConnectMsg {
            scope: c.scope,
            e133_version: c.e133_version,
            search_domain: c.search_domain,
            connect_flags: c.connect_flags,
            client_entry,
        })
    });

    (bytes_parsed, res, msg)
}

fn parse_client_entry_update(
    st: &mut ClientEntryUpdateState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<BrokerMessage>) {
    let mut bytes_parsed = 0;

    if st.connect_flags.is_none() {
        if data.is_empty() {
            return (0, ParseResult::NoData, None);
        }
        st.connect_flags = Some(data[0]);
        bytes_parsed += proto::CLIENT_ENTRY_UPDATE_COMMON_FIELD_SIZE;
        st.entry = ClientEntryState::new(
            st.pdu_data_size - proto::CLIENT_ENTRY_UPDATE_COMMON_FIELD_SIZE,
        );
    }

    let (n, res, entry) = parse_single_client_entry(&mut st.entry, &data[bytes_parsed..], log);
    bytes_parsed += n;

    let msg = entry.map(|client_entry| {
        BrokerMessage::ClientEntryUpdate(ClientEntryUpdateMsg {
            connect_flags: st.connect_flags.unwrap_or(0),
            client_entry,
        })
    });

    (bytes_parsed, res, msg)
}

fn parse_single_client_entry(
    st: &mut ClientEntryState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<ClientEntry>) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;
    let mut out = None;

    if st.protocol.is_none() {
        if data.len() >= proto::CLIENT_ENTRY_HEADER_SIZE {
            let entry_pdu_len = proto::pdu_length(data);
            let protocol = BigEndian::read_u32(&data[3..]);
            st.cid = read_cid(&data[7..]);
            bytes_parsed += proto::CLIENT_ENTRY_HEADER_SIZE;
            st.entry_data = PduBlockState::new(
                entry_pdu_len.saturating_sub(proto::CLIENT_ENTRY_HEADER_SIZE),
            );
            st.protocol = Some(protocol);
            if entry_pdu_len < proto::CLIENT_ENTRY_HEADER_SIZE
                || entry_pdu_len > st.enclosing_block_size
            {
                let (n, r) = consume_bad_block(&mut st.entry_data, data.len() - bytes_parsed);
                bytes_parsed += n;
                res = r;
                warn!(log, "dropping client entry with invalid length"; "length" => entry_pdu_len);
            }
        } else {
            return (0, ParseResult::NoData, None);
        }
    }

    if let Some(protocol) = st.protocol {
        let remaining_len = data.len() - bytes_parsed;

        if st.entry_data.consuming_bad_block {
            let (n, r) = consume_bad_block(&mut st.entry_data, remaining_len);
            bytes_parsed += n;
            res = r;
        } else if protocol == proto::VECTOR_ROOT_RPT {
            if st.entry_data.size_parsed + proto::RPT_CLIENT_ENTRY_DATA_SIZE
                == st.entry_data.block_size
            {
                if remaining_len >= proto::RPT_CLIENT_ENTRY_DATA_SIZE {
                    let d = &data[bytes_parsed..];
                    let uid = read_uid(d);
                    let client_type = RptClientType::from_u8(d[6]);
                    let binding_cid = read_cid(&d[7..]);
                    bytes_parsed += proto::RPT_CLIENT_ENTRY_DATA_SIZE;
                    st.entry_data.size_parsed += proto::RPT_CLIENT_ENTRY_DATA_SIZE;
                    res = ParseResult::FullBlockOk;
                    out = Some(ClientEntry::Rpt(RptClientEntry {
                        cid: st.cid,
                        uid,
                        client_type,
                        binding_cid,
                    }));
                }
            } else {
                let (n, r) = consume_bad_block(&mut st.entry_data, remaining_len);
                bytes_parsed += n;
                res = r;
                warn!(log, "dropping RPT client entry with mismatched length");
            }
        } else if protocol == proto::VECTOR_ROOT_EPT {
            // EPT sub-protocol entries are skipped byte-wise; the bare entry
            // is surfaced so the handshake can refuse it.
            let left_in_entry = st.entry_data.block_size - st.entry_data.size_parsed;
            if remaining_len >= left_in_entry {
                bytes_parsed += left_in_entry;
                st.entry_data.size_parsed = st.entry_data.block_size;
                res = ParseResult::FullBlockOk;
                out = Some(ClientEntry::Ept(EptClientEntry { cid: st.cid }));
            } else {
                bytes_parsed += remaining_len;
                st.entry_data.size_parsed += remaining_len;
            }
        } else {
            let (n, r) = consume_bad_block(&mut st.entry_data, remaining_len);
            bytes_parsed += n;
            res = r;
            warn!(log, "dropping client entry with unknown protocol"; "protocol" => protocol);
        }
    }

    (bytes_parsed, res, out)
}

fn parse_client_list(
    st: &mut ClientListState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult) {
    if st.block.consuming_bad_block {
        return consume_bad_block(&mut st.block, data.len());
    }
    if st.block.block_size == 0 {
        // A list message carrying no entries is complete as it stands.
        return (0, ParseResult::FullBlockOk);
    }

    if st.protocol.is_none() && data.len() >= proto::CLIENT_ENTRY_HEADER_SIZE {
        st.protocol = Some(BigEndian::read_u32(&data[3..]));
    }

    match st.protocol {
        Some(proto::VECTOR_ROOT_RPT) => parse_rpt_client_list(st, data, log),
        Some(other) => {
            warn!(log, "dropping client list with unroutable protocol"; "protocol" => other);
            consume_bad_block(&mut st.block, data.len())
        }
        None => (0, ParseResult::NoData),
    }
}

fn parse_rpt_client_list(
    st: &mut ClientListState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;

    while st.block.size_parsed < st.block.block_size {
        let remaining = &data[bytes_parsed..];

        if !st.block.parsed_header {
            if remaining.len() < proto::CLIENT_ENTRY_HEADER_SIZE {
                break;
            }
            if BigEndian::read_u32(&remaining[3..]) != proto::VECTOR_ROOT_RPT {
                warn!(log, "dropping client list mixing client protocols");
                let (n, r) = consume_bad_block(&mut st.block, remaining.len());
                bytes_parsed += n;
                res = r;
                break;
            }
            if st.entries.len() >= MAX_LIST_BATCH {
                // Hand back what we have; the rest follows in another batch.
                res = ParseResult::PartialBlockOk;
                break;
            }
            st.block.parsed_header = true;
            st.entry = ClientEntryState::new(st.block.block_size);
        }

        let (n, r, entry) = parse_single_client_entry(&mut st.entry, &data[bytes_parsed..], log);
        bytes_parsed += n;
        st.block.size_parsed += n;
        res = r;

        match r {
            ParseResult::FullBlockOk => {
                if let Some(ClientEntry::Rpt(e)) = entry {
                    st.entries.push(e);
                }
                st.block.parsed_header = false;
                if st.block.size_parsed != st.block.block_size {
                    // Not the last entry; keep iterating.
                    res = ParseResult::NoData;
                }
            }
            ParseResult::FullBlockProtErr => {
                st.block.parsed_header = false;
                let (n2, r2) = consume_bad_block(&mut st.block, data.len() - bytes_parsed);
                bytes_parsed += n2;
                res = r2;
                break;
            }
            _ => break, // incomplete entry, wait for more data
        }
    }

    (bytes_parsed, res)
}

fn parse_generic_list<T>(
    st: &mut GenericListState<T>,
    data: &[u8],
    item_size: usize,
    parse_item: impl Fn(&[u8]) -> T,
) -> (usize, ParseResult) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;

    while data.len() - bytes_parsed >= item_size && st.size_parsed < st.full_size {
        if st.items.len() >= MAX_LIST_BATCH {
            res = ParseResult::PartialBlockOk;
            break;
        }
        st.items.push(parse_item(&data[bytes_parsed..]));
        bytes_parsed += item_size;
        st.size_parsed += item_size;
        if st.size_parsed >= st.full_size {
            res = ParseResult::FullBlockOk;
        }
    }

    (bytes_parsed, res)
}

fn parse_rpt_block(
    r: &mut RptState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<RptMessage>) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;
    let mut out = None;

    if r.block.consuming_bad_block {
        let (n, pr) = consume_bad_block(&mut r.block, data.len());
        bytes_parsed += n;
        res = pr;
    } else if !r.block.parsed_header {
        let mut parse_err = false;

        if r.block.block_size - r.block.size_parsed < proto::RPT_PDU_HEADER_SIZE {
            parse_err = true;
        } else if data.len() >= proto::RPT_PDU_HEADER_SIZE {
            let pdu_len = proto::pdu_length(data);
            if pdu_len >= proto::RPT_PDU_HEADER_SIZE
                && r.block.size_parsed + pdu_len <= r.block.block_size
            {
                let pdu_data_len = pdu_len - proto::RPT_PDU_HEADER_SIZE;
                r.vector = BigEndian::read_u32(&data[3..]);
                r.header = RptHeader {
                    source_uid: read_uid(&data[7..]),
                    source_endpoint: BigEndian::read_u16(&data[13..]),
                    dest_uid: read_uid(&data[15..]),
                    dest_endpoint: BigEndian::read_u16(&data[21..]),
                    seqnum: BigEndian::read_u32(&data[23..]),
                };
                // data[27] is a reserved byte.
                bytes_parsed += proto::RPT_PDU_HEADER_SIZE;
                r.block.size_parsed += proto::RPT_PDU_HEADER_SIZE;
                r.block.parsed_header = true;
                r.init_data(pdu_data_len, log);
            } else {
                parse_err = true;
            }
        }

        if parse_err {
            let (n, pr) = consume_bad_block(&mut r.block, data.len() - bytes_parsed);
            bytes_parsed += n;
            res = pr;
            warn!(log, "protocol error while parsing RPT PDU header");
        }
    }

    if r.block.parsed_header {
        let remaining = &data[bytes_parsed..];
        let vector = r.vector;
        let header = r.header;
        let (n, pr, content) = match &mut r.data {
            RptData::RdmList(st) => {
                let (n, pr) = parse_rdm_list(st, remaining, log);
                let content = list_result(pr).map(|more| {
                    let list = RdmBufList {
                        buffers: mem::take(&mut st.buffers),
                        more_coming: more,
                    };
                    if vector == proto::VECTOR_RPT_REQUEST {
                        RptContent::Request(list)
                    } else {
                        RptContent::Notification(list)
                    }
                });
                (n, pr, content)
            }
            RptData::Status(st) => {
                let (n, pr, status) = parse_rpt_status(st, remaining, log);
                (n, pr, status.map(RptContent::Status))
            }
            RptData::Unknown(block) => {
                let (n, pr) = consume_bad_block(block, remaining.len());
                (n, pr, None)
            }
            RptData::None => (0, ParseResult::NoData, None),
        };
        r.block.size_parsed += n;
        bytes_parsed += n;
        res = check_for_full_parse(pr, &mut r.block);
        out = content.map(|content| RptMessage { header, content });
    }

    (bytes_parsed, res, out)
}

fn parse_rdm_list(st: &mut RdmListState, data: &[u8], log: &Logger) -> (usize, ParseResult) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;

    if !st.parsed_list_header && data.len() >= proto::REQUEST_NOTIF_PDU_HEADER_SIZE {
        let pdu_len = proto::pdu_length(data);
        let vector = BigEndian::read_u32(&data[3..]);
        if pdu_len != st.block.block_size || vector != proto::VECTOR_RDM_CMD {
            let (n, r) = consume_bad_block(&mut st.block, data.len());
            bytes_parsed += n;
            res = r;
            warn!(log, "dropping RPT message with malformed RDM command block");
        } else {
            st.parsed_list_header = true;
            st.block.block_size -= proto::REQUEST_NOTIF_PDU_HEADER_SIZE;
            bytes_parsed += proto::REQUEST_NOTIF_PDU_HEADER_SIZE;
        }
    }

    if st.parsed_list_header {
        if st.block.consuming_bad_block {
            let (n, r) = consume_bad_block(&mut st.block, data.len() - bytes_parsed);
            bytes_parsed += n;
            res = r;
        } else if st.block.size_parsed >= st.block.block_size {
            // No RDM command PDUs at all; the list is trivially complete.
            res = ParseResult::FullBlockOk;
        } else {
            while st.block.size_parsed < st.block.block_size {
                let remaining = &data[bytes_parsed..];
                if remaining.len() < proto::RDM_CMD_PDU_MIN_SIZE {
                    break;
                }

                let rdm_pdu_len = proto::pdu_length(remaining);
                if rdm_pdu_len < proto::RDM_CMD_PDU_MIN_SIZE
                    || rdm_pdu_len > proto::RDM_CMD_PDU_MAX_SIZE
                    || st.block.size_parsed + rdm_pdu_len > st.block.block_size
                {
                    let (n, r) = consume_bad_block(&mut st.block, remaining.len());
                    bytes_parsed += n;
                    res = r;
                    warn!(log, "dropping RDM command PDU with invalid length"; "length" => rdm_pdu_len);
                    break;
                }
                if remaining.len() < rdm_pdu_len {
                    break;
                }
                if st.buffers.len() >= MAX_LIST_BATCH {
                    res = ParseResult::PartialBlockOk;
                    break;
                }

                st.buffers.push(RdmBuffer::new(remaining[3..rdm_pdu_len].to_vec()));
                bytes_parsed += rdm_pdu_len;
                st.block.size_parsed += rdm_pdu_len;
                if st.block.size_parsed >= st.block.block_size {
                    res = ParseResult::FullBlockOk;
                }
            }
        }
    }

    (bytes_parsed, res)
}

fn parse_rpt_status(
    st: &mut RptStatusState,
    data: &[u8],
    log: &Logger,
) -> (usize, ParseResult, Option<RptStatusMsg>) {
    let mut bytes_parsed = 0;
    let mut res = ParseResult::NoData;
    let mut out = None;

    if st.block.consuming_bad_block {
        let (n, r) = consume_bad_block(&mut st.block, data.len());
        bytes_parsed += n;
        res = r;
    } else if !st.block.parsed_header {
        let mut parse_err = false;

        if st.block.block_size - st.block.size_parsed < proto::RPT_STATUS_HEADER_SIZE {
            parse_err = true;
        } else if data.len() >= proto::RPT_STATUS_HEADER_SIZE {
            let pdu_len = proto::pdu_length(data);
            // A status PDU fills its whole enclosing block.
            if pdu_len >= proto::RPT_STATUS_HEADER_SIZE && pdu_len >= st.block.block_size {
                st.status_code = BigEndian::read_u16(&data[3..]);
                bytes_parsed += proto::RPT_STATUS_HEADER_SIZE;
                st.block.size_parsed += proto::RPT_STATUS_HEADER_SIZE;
                st.block.parsed_header = true;
            } else {
                parse_err = true;
            }
        }

        if parse_err {
            let (n, r) = consume_bad_block(&mut st.block, data.len() - bytes_parsed);
            bytes_parsed += n;
            res = r;
            warn!(log, "protocol error while parsing RPT status PDU header");
        }
    }

    if st.block.parsed_header {
        let remaining = &data[bytes_parsed..];
        match RptStatusCode::from_u16(st.status_code) {
            Some(code) if !code.allows_string() => {
                if st.block.size_parsed == st.block.block_size {
                    res = ParseResult::FullBlockOk;
                    out = Some(RptStatusMsg { status_code: code, status_string: None });
                } else {
                    let (n, r) = consume_bad_block(&mut st.block, remaining.len());
                    bytes_parsed += n;
                    res = r;
                }
            }
            Some(code) => {
                let str_len = st.block.block_size - st.block.size_parsed;
                if str_len == 0 {
                    res = ParseResult::FullBlockOk;
                    out = Some(RptStatusMsg { status_code: code, status_string: None });
                } else if str_len > proto::RPT_STATUS_STRING_MAXLEN {
                    let (n, r) = consume_bad_block(&mut st.block, remaining.len());
                    bytes_parsed += n;
                    res = r;
                    warn!(log, "dropping RPT status with overlong status string"; "length" => str_len);
                } else if remaining.len() >= str_len {
                    let text = String::from_utf8_lossy(&remaining[..str_len]).into_owned();
                    bytes_parsed += str_len;
                    st.block.size_parsed += str_len;
                    res = ParseResult::FullBlockOk;
                    out = Some(RptStatusMsg { status_code: code, status_string: Some(text) });
                }
            }
            None => {
                let (n, r) = consume_bad_block(&mut st.block, remaining.len());
                bytes_parsed += n;
                res = r;
                warn!(log, "dropping RPT status with unknown status code"; "code" => st.status_code);
            }
        }
    }

    (bytes_parsed, res, out)
}

#[inline]
fn read_uid(d: &[u8]) -> Uid {
    Uid::new(BigEndian::read_u16(d), BigEndian::read_u32(&d[2..]))
}

#[inline]
fn read_cid(d: &[u8]) -> Cid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&d[..16]);
    Cid::from_bytes(bytes)
}

/// Fixed-width NUL-padded field to owned string.
fn read_padded_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec;
    use lumen::logging;
    use rand::Rng;
    use std::net::SocketAddr;

    fn cid(n: u8) -> Cid {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        Cid::from_bytes(bytes)
    }

    fn rpt_entry(n: u8) -> RptClientEntry {
        RptClientEntry {
            cid: cid(n),
            uid: Uid::new(0x6574, n as u32),
            client_type: RptClientType::Controller,
            binding_cid: cid(n + 100),
        }
    }

    fn parse_one(frame: &[u8]) -> RdmnetMessage {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);
        assert_eq!(buf.feed(frame), frame.len());
        match buf.next_message() {
            ParseStatus::Message(msg) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    fn roundtrip(content: MessageContent) {
        let sender = cid(42);
        let frame = codec::pack_message(&sender, &content);
        let msg = parse_one(&frame);
        assert_eq!(msg.sender_cid, sender);
        assert_eq!(msg.content, content);
    }

    #[test]
    fn test_roundtrip_connect_reply() {
        roundtrip(MessageContent::Broker(BrokerMessage::ConnectReply(ConnectReplyMsg {
            status: ConnectStatus::Ok,
            e133_version: 1,
            broker_uid: Uid::new(0x6574, 1),
            client_uid: Uid::new(0x6574, 2),
        })));
    }

    #[test]
    fn test_roundtrip_client_connect_rpt() {
        roundtrip(MessageContent::Broker(BrokerMessage::ClientConnect(ClientConnectMsg {
            scope: "default".to_string(),
            e133_version: 1,
            search_domain: "local.".to_string(),
            connect_flags: 0x01,
            client_entry: ClientEntry::Rpt(RptClientEntry {
                cid: cid(7),
                uid: Uid::new(0x6574, 0x8000_0001),
                client_type: RptClientType::Controller,
                binding_cid: Cid::default(),
            }),
        })));
    }

    #[test]
    fn test_roundtrip_client_connect_ept() {
        roundtrip(MessageContent::Broker(BrokerMessage::ClientConnect(ClientConnectMsg {
            scope: "default".to_string(),
            e133_version: 1,
            search_domain: String::new(),
            connect_flags: 0,
            client_entry: ClientEntry::Ept(EptClientEntry { cid: cid(8) }),
        })));
    }

    #[test]
    fn test_roundtrip_client_entry_update() {
        roundtrip(MessageContent::Broker(BrokerMessage::ClientEntryUpdate(
            ClientEntryUpdateMsg {
                connect_flags: 1,
                client_entry: ClientEntry::Rpt(rpt_entry(3)),
            },
        )));
    }

    #[test]
    fn test_roundtrip_redirects() {
        let v4: SocketAddr = "192.168.6.12:8888".parse().unwrap();
        roundtrip(MessageContent::Broker(BrokerMessage::Redirect(v4)));

        let v6: SocketAddr = "[2001:db8::5]:5569".parse().unwrap();
        roundtrip(MessageContent::Broker(BrokerMessage::Redirect(v6)));
    }

    #[test]
    fn test_roundtrip_empty_messages() {
        roundtrip(MessageContent::Broker(BrokerMessage::Null));
        roundtrip(MessageContent::Broker(BrokerMessage::FetchClientList));
    }

    #[test]
    fn test_roundtrip_disconnect() {
        roundtrip(MessageContent::Broker(BrokerMessage::Disconnect(
            DisconnectReason::Shutdown,
        )));
    }

    #[test]
    fn test_roundtrip_client_lists() {
        for action in [
            ClientListAction::Connected,
            ClientListAction::Add,
            ClientListAction::Remove,
            ClientListAction::Change,
        ] {
            roundtrip(MessageContent::Broker(BrokerMessage::ClientList(ClientListMsg {
                action,
                entries: vec![rpt_entry(1), rpt_entry(2), rpt_entry(3)],
                more_coming: false,
            })));
        }
    }

    #[test]
    fn test_roundtrip_uid_lists() {
        roundtrip(MessageContent::Broker(BrokerMessage::RequestDynamicUids(
            DynamicUidRequestList {
                requests: vec![
                    DynamicUidRequest { uid: Uid::new(0x6574, 0x8000_0001), rid: cid(1) },
                    DynamicUidRequest { uid: Uid::new(0x6574, 0x8000_0002), rid: cid(2) },
                ],
                more_coming: false,
            },
        )));

        roundtrip(MessageContent::Broker(BrokerMessage::AssignedDynamicUids(
            DynamicUidAssignmentList {
                mappings: vec![DynamicUidMapping {
                    uid: Uid::new(0x6574, 2),
                    rid: cid(1),
                    status: DynamicUidStatus::Ok,
                }],
                more_coming: false,
            },
        )));

        roundtrip(MessageContent::Broker(BrokerMessage::FetchDynamicUidList(FetchUidList {
            uids: vec![Uid::new(0x6574, 2), Uid::new(0x6574, 3)],
            more_coming: false,
        })));
    }

    #[test]
    fn test_roundtrip_rpt_request() {
        roundtrip(MessageContent::Rpt(RptMessage {
            header: RptHeader {
                source_uid: Uid::new(0x6574, 2),
                source_endpoint: 0,
                dest_uid: Uid::new(0x6574, 3),
                dest_endpoint: 0,
                seqnum: 17,
            },
            content: RptContent::Request(RdmBufList {
                buffers: vec![RdmBuffer::new(vec![0xcc; 26])],
                more_coming: false,
            }),
        }));
    }

    #[test]
    fn test_roundtrip_rpt_notification_multiple_buffers() {
        roundtrip(MessageContent::Rpt(RptMessage {
            header: RptHeader::default(),
            content: RptContent::Notification(RdmBufList {
                buffers: vec![
                    RdmBuffer::new(vec![0x01; 24]),
                    RdmBuffer::new(vec![0x02; 257]),
                    RdmBuffer::new(vec![0x03; 40]),
                ],
                more_coming: false,
            }),
        }));
    }

    #[test]
    fn test_roundtrip_rpt_status() {
        roundtrip(MessageContent::Rpt(RptMessage {
            header: RptHeader::default(),
            content: RptContent::Status(RptStatusMsg {
                status_code: RptStatusCode::UnknownRptUid,
                status_string: None,
            }),
        }));

        roundtrip(MessageContent::Rpt(RptMessage {
            header: RptHeader::default(),
            content: RptContent::Status(RptStatusMsg {
                status_code: RptStatusCode::RdmTimeout,
                status_string: Some("no response".to_string()),
            }),
        }));
    }

    #[test]
    fn test_roundtrip_empty_lists() {
        roundtrip(MessageContent::Broker(BrokerMessage::ClientList(ClientListMsg {
            action: ClientListAction::Connected,
            entries: vec![],
            more_coming: false,
        })));

        roundtrip(MessageContent::Rpt(RptMessage {
            header: RptHeader::default(),
            content: RptContent::Notification(RdmBufList { buffers: vec![], more_coming: false }),
        }));
    }

    #[test]
    fn test_chunked_parse_byte_at_a_time() {
        let content = MessageContent::Broker(BrokerMessage::ClientConnect(ClientConnectMsg {
            scope: "default".to_string(),
            e133_version: 1,
            search_domain: "example.com.".to_string(),
            connect_flags: 0,
            client_entry: ClientEntry::Rpt(rpt_entry(5)),
        }));
        let frame = codec::pack_message(&cid(42), &content);

        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);
        let mut got = None;
        for &byte in &frame {
            assert_eq!(buf.feed(&[byte]), 1);
            if let ParseStatus::Message(msg) = buf.next_message() {
                assert!(got.is_none(), "message delivered twice");
                got = Some(msg);
            }
        }
        assert_eq!(got.expect("message never completed").content, content);
    }

    #[test]
    fn test_chunked_parse_random_partitions() {
        let content = MessageContent::Rpt(RptMessage {
            header: RptHeader {
                source_uid: Uid::new(0x6574, 2),
                source_endpoint: 1,
                dest_uid: Uid::new(0x6574, 3),
                dest_endpoint: 2,
                seqnum: 99,
            },
            content: RptContent::Notification(RdmBufList {
                buffers: vec![RdmBuffer::new(vec![0xab; 30]), RdmBuffer::new(vec![0xcd; 200])],
                more_coming: false,
            }),
        });
        let frame = codec::pack_message(&cid(9), &content);
        let log = logging::discard();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let mut buf = MsgBuf::new(&log);
            let mut got = None;
            let mut offset = 0;
            while offset < frame.len() {
                let chunk = rng.gen_range(1..=32).min(frame.len() - offset);
                assert_eq!(buf.feed(&frame[offset..offset + chunk]), chunk);
                offset += chunk;
                loop {
                    match buf.next_message() {
                        ParseStatus::Message(msg) => {
                            assert!(got.is_none());
                            got = Some(msg);
                        }
                        ParseStatus::NoData => break,
                        ParseStatus::ProtocolError => panic!("unexpected protocol error"),
                    }
                }
            }
            assert_eq!(got.expect("message never completed").content, content);
        }
    }

    #[test]
    fn test_garbage_before_preamble_is_skipped() {
        let frame = codec::pack_broker_message(&cid(1), &BrokerMessage::Null);
        let mut stream = vec![0xde, 0xad, 0xbe, 0xef, 0x41, 0x43]; // includes a lone 'AC'
        stream.extend_from_slice(&frame);

        let msg = parse_one(&stream);
        assert_eq!(msg.content, MessageContent::Broker(BrokerMessage::Null));
    }

    #[test]
    fn test_unknown_root_vector_is_skipped() {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);

        // Root PDU with vector 0x1234 and 4 bytes of data.
        let rlp_len = proto::RLP_HEADER_SIZE + 4;
        let mut frame = Vec::new();
        frame.extend_from_slice(&proto::ACN_PACKET_IDENT);
        frame.extend_from_slice(&(rlp_len as u32).to_be_bytes());
        let mut hdr = [0u8; 3];
        proto::pack_pdu_length(&mut hdr, rlp_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&0x1234u32.to_be_bytes());
        frame.extend_from_slice(cid(5).as_bytes());
        frame.extend_from_slice(&[1, 2, 3, 4]);
        // A valid Null follows on the stream.
        frame.extend_from_slice(&codec::pack_broker_message(&cid(5), &BrokerMessage::Null));

        buf.feed(&frame);
        assert!(matches!(buf.next_message(), ParseStatus::ProtocolError));
        match buf.next_message() {
            ParseStatus::Message(msg) => {
                assert_eq!(msg.content, MessageContent::Broker(BrokerMessage::Null))
            }
            other => panic!("expected the trailing Null, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_broker_vector_does_not_skip_enclosing_block() {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);

        // One root PDU carrying two broker PDUs: an unknown vector with 6
        // bytes of data, then a Null.
        let unknown_pdu_len = proto::BROKER_PDU_HEADER_SIZE + 6;
        let null_pdu_len = proto::BROKER_PDU_HEADER_SIZE;
        let rlp_len = proto::RLP_HEADER_SIZE + unknown_pdu_len + null_pdu_len;

        let mut frame = Vec::new();
        frame.extend_from_slice(&proto::ACN_PACKET_IDENT);
        frame.extend_from_slice(&(rlp_len as u32).to_be_bytes());
        let mut hdr = [0u8; 3];
        proto::pack_pdu_length(&mut hdr, rlp_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_ROOT_BROKER.to_be_bytes());
        frame.extend_from_slice(cid(6).as_bytes());

        proto::pack_pdu_length(&mut hdr, unknown_pdu_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&0x7777u16.to_be_bytes());
        frame.extend_from_slice(&[0; 6]);

        proto::pack_pdu_length(&mut hdr, null_pdu_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_BROKER_NULL.to_be_bytes());

        buf.feed(&frame);
        assert!(matches!(buf.next_message(), ParseStatus::ProtocolError));
        match buf.next_message() {
            ParseStatus::Message(msg) => {
                assert_eq!(msg.content, MessageContent::Broker(BrokerMessage::Null))
            }
            other => panic!("expected the Null from the same block, got {:?}", other),
        }
        assert!(matches!(buf.next_message(), ParseStatus::NoData));
    }

    #[test]
    fn test_overlong_status_string_is_protocol_error() {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);

        let str_len = proto::RPT_STATUS_STRING_MAXLEN + 1;
        let status_pdu_len = proto::RPT_STATUS_HEADER_SIZE + str_len;
        let rpt_len = proto::RPT_PDU_HEADER_SIZE + status_pdu_len;
        let rlp_len = proto::RLP_HEADER_SIZE + rpt_len;

        let mut frame = Vec::new();
        frame.extend_from_slice(&proto::ACN_PACKET_IDENT);
        frame.extend_from_slice(&(rlp_len as u32).to_be_bytes());
        let mut hdr = [0u8; 3];
        proto::pack_pdu_length(&mut hdr, rlp_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_ROOT_RPT.to_be_bytes());
        frame.extend_from_slice(cid(2).as_bytes());

        proto::pack_pdu_length(&mut hdr, rpt_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_RPT_STATUS.to_be_bytes());
        frame.extend_from_slice(&[0; 21]); // header fields + reserved

        proto::pack_pdu_length(&mut hdr, status_pdu_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&RptStatusCode::RdmTimeout.as_u16().to_be_bytes());
        frame.extend_from_slice(&vec![b'x'; str_len]);

        buf.feed(&frame);
        assert!(matches!(buf.next_message(), ParseStatus::ProtocolError));
        assert!(matches!(buf.next_message(), ParseStatus::NoData));
    }

    #[test]
    fn test_uid_list_with_ragged_length_is_protocol_error() {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);

        // Fetch list data must be a multiple of 6; send 7 bytes.
        let pdu_len = proto::BROKER_PDU_HEADER_SIZE + 7;
        let rlp_len = proto::RLP_HEADER_SIZE + pdu_len;
        let mut frame = Vec::new();
        frame.extend_from_slice(&proto::ACN_PACKET_IDENT);
        frame.extend_from_slice(&(rlp_len as u32).to_be_bytes());
        let mut hdr = [0u8; 3];
        proto::pack_pdu_length(&mut hdr, rlp_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_ROOT_BROKER.to_be_bytes());
        frame.extend_from_slice(cid(1).as_bytes());
        proto::pack_pdu_length(&mut hdr, pdu_len);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&proto::VECTOR_BROKER_FETCH_DYNAMIC_UID_LIST.to_be_bytes());
        frame.extend_from_slice(&[0; 7]);

        buf.feed(&frame);
        assert!(matches!(buf.next_message(), ParseStatus::ProtocolError));
    }

    #[test]
    fn test_request_with_two_rdm_buffers_parses() {
        // Payload validation is the routing engine's job; the parser
        // delivers whatever list the frame carries.
        let content = MessageContent::Rpt(RptMessage {
            header: RptHeader::default(),
            content: RptContent::Request(RdmBufList {
                buffers: vec![RdmBuffer::new(vec![1; 26]), RdmBuffer::new(vec![2; 26])],
                more_coming: false,
            }),
        });
        roundtrip(content);
    }

    #[test]
    fn test_two_messages_in_one_feed() {
        let log = logging::discard();
        let mut buf = MsgBuf::new(&log);

        let mut stream = codec::pack_broker_message(&cid(1), &BrokerMessage::Null);
        stream.extend_from_slice(&codec::pack_broker_message(
            &cid(1),
            &BrokerMessage::FetchClientList,
        ));

        buf.feed(&stream);
        assert!(matches!(
            buf.next_message(),
            ParseStatus::Message(RdmnetMessage {
                content: MessageContent::Broker(BrokerMessage::Null),
                ..
            })
        ));
        assert!(matches!(
            buf.next_message(),
            ParseStatus::Message(RdmnetMessage {
                content: MessageContent::Broker(BrokerMessage::FetchClientList),
                ..
            })
        ));
        assert!(matches!(buf.next_message(), ParseStatus::NoData));
    }
}
