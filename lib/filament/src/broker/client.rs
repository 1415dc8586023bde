//! Per-connection client records: connection state, heartbeat bookkeeping,
//! the inbound parse buffer and the prioritized outbound queues.
//!
//! Outbound traffic is pre-serialized into byte buffers at push time and
//! drained one message per service pass. Broker-protocol messages outrank
//! status replies, which outrank RPT data. Device records partition their
//! RPT queue by source controller and drain the partitions round-robin.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen::logging::{warn, Logger};
use lumen::time::Timer;
use lumen::{BrokerError, BrokerResult, Cid, Uid};

use crate::broker::ClientHandle;
use crate::net::codec;
use crate::net::msgs::*;
use crate::net::parser::{MsgBuf, ParseStatus};

/// A connection that stays silent this long is torn down.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
/// If nothing has been transmitted for this long, a heartbeat-null goes out.
pub const SEND_INTERVAL: Duration = Duration::from_millis(7500);
/// How long a marked connection may keep draining farewell messages.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Protocol errors tolerated within [`PROTOCOL_ERROR_WINDOW`] before the
/// connection is killed.
pub const PROTOCOL_ERROR_LIMIT: usize = 3;
pub const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    TcpConnected,
    AwaitingConnect,
    Connected,
    MarkedForDestruction,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientRole {
    Pending,
    Controller,
    Device,
}

/// One pre-serialized outbound message plus its transmit cursor.
pub struct MessageRef {
    data: Box<[u8]>,
    size_sent: usize,
}

impl MessageRef {
    fn new(data: Vec<u8>) -> MessageRef {
        MessageRef { data: data.into_boxed_slice(), size_sent: 0 }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

enum RptQueue {
    /// Controllers (and pending clients) keep one FIFO.
    Single(VecDeque<MessageRef>),
    /// Devices keep one FIFO per source controller, drained round-robin.
    PerSource {
        parts: BTreeMap<ClientHandle, VecDeque<MessageRef>>,
        total: usize,
        last_serviced: ClientHandle,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum QueuePick {
    Broker,
    Status,
    Rpt,
    RptPart(ClientHandle),
}

/// Result of one `send_one` attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// At least one byte left the broker.
    Wrote,
    /// Nothing to send, or the socket is not writable right now.
    Idle,
    /// Unrecoverable socket error; the connection must go.
    Fatal,
}

enum WriteResult {
    Progress,
    WouldBlock,
    Error,
}

pub struct ClientRecord {
    pub handle: ClientHandle,
    pub addr: SocketAddr,
    stream: Option<Arc<mio::net::TcpStream>>,
    pub state: ConnectionState,
    pub role: ClientRole,
    pub cid: Cid,
    pub uid: Uid,
    pub binding_cid: Cid,
    /// Dropped messages for this destination since it connected.
    pub overflow_drops: u64,

    msg_buf: MsgBuf,
    max_q_size: usize,
    broker_q: VecDeque<MessageRef>,
    status_q: VecDeque<MessageRef>,
    rpt_q: RptQueue,
    /// Queue holding a partially transmitted message; it must finish before
    /// any other queue may touch the socket.
    in_flight: Option<QueuePick>,

    heartbeat_timer: Timer,
    send_timer: Timer,
    drain_deadline: Option<Instant>,
    recent_protocol_errors: VecDeque<Instant>,

    log: Logger,
}

impl ClientRecord {
    pub fn new(
        handle: ClientHandle,
        addr: SocketAddr,
        stream: Option<Arc<mio::net::TcpStream>>,
        now: Instant,
        log: &Logger,
    ) -> ClientRecord {
        ClientRecord {
            handle,
            addr,
            stream,
            state: ConnectionState::TcpConnected,
            role: ClientRole::Pending,
            cid: Cid::default(),
            uid: Uid::default(),
            binding_cid: Cid::default(),
            overflow_drops: 0,
            msg_buf: MsgBuf::new(log),
            max_q_size: 0,
            broker_q: VecDeque::new(),
            status_q: VecDeque::new(),
            rpt_q: RptQueue::Single(VecDeque::new()),
            in_flight: None,
            heartbeat_timer: Timer::new(HEARTBEAT_TIMEOUT, now),
            send_timer: Timer::new(SEND_INTERVAL, now),
            drain_deadline: None,
            recent_protocol_errors: VecDeque::new(),
            log: log.clone(),
        }
    }

    /// Socket attached and parser live; the connect handshake may begin.
    pub fn begin_handshake(&mut self, now: Instant) {
        self.state = ConnectionState::AwaitingConnect;
        self.heartbeat_timer.reset(now);
        self.send_timer.reset(now);
    }

    #[inline]
    pub fn stream(&self) -> Option<Arc<mio::net::TcpStream>> {
        self.stream.clone()
    }

    #[inline]
    pub fn client_type(&self) -> RptClientType {
        match self.role {
            ClientRole::Controller => RptClientType::Controller,
            ClientRole::Device => RptClientType::Device,
            ClientRole::Pending => RptClientType::Unknown,
        }
    }

    /// The entry other clients see for this one.
    pub fn rpt_entry(&self) -> RptClientEntry {
        RptClientEntry {
            cid: self.cid,
            uid: self.uid,
            client_type: self.client_type(),
            binding_cid: self.binding_cid,
        }
    }

    /// Completes the handshake: adopt the entry's identity and switch the
    /// queue shape to the role's.
    pub fn promote(&mut self, entry: &RptClientEntry, uid: Uid, max_q_size: usize, now: Instant) {
        self.cid = entry.cid;
        self.uid = uid;
        self.binding_cid = entry.binding_cid;
        self.role = match entry.client_type {
            RptClientType::Controller => ClientRole::Controller,
            _ => ClientRole::Device,
        };
        self.max_q_size = max_q_size;
        self.rpt_q = match self.role {
            ClientRole::Device => RptQueue::PerSource {
                parts: BTreeMap::new(),
                total: 0,
                last_serviced: crate::broker::INVALID_HANDLE,
            },
            _ => RptQueue::Single(VecDeque::new()),
        };
        self.state = ConnectionState::Connected;
        self.heartbeat_timer.reset(now);
        self.send_timer.reset(now);
    }

    // ---------------------------------------------------------------- inbound

    /// Feeds received bytes through the parser, collecting decoded messages.
    /// Returns the messages plus whether the connection must be killed
    /// (repeated protocol errors or a stalled oversized message).
    pub fn drain_messages(&mut self, bytes: &[u8], now: Instant) -> (Vec<RdmnetMessage>, bool) {
        let mut msgs = Vec::new();
        let mut offset = 0;

        loop {
            let taken = self.msg_buf.feed(&bytes[offset..]);
            offset += taken;

            let mut progressed = taken > 0;
            loop {
                match self.msg_buf.next_message() {
                    ParseStatus::Message(msg) => {
                        self.heartbeat_timer.reset(now);
                        progressed = true;
                        msgs.push(msg);
                    }
                    ParseStatus::ProtocolError => {
                        progressed = true;
                        if self.note_protocol_error(now) {
                            warn!(self.log, "closing connection after repeated protocol errors";
                                  "handle" => self.handle);
                            return (msgs, true);
                        }
                    }
                    ParseStatus::NoData => break,
                }
            }

            if offset >= bytes.len() {
                return (msgs, false);
            }
            if !progressed {
                // Buffer full and the parser cannot advance; the peer sent
                // something larger than we are willing to hold.
                warn!(self.log, "inbound message exceeds the parse buffer bound";
                      "handle" => self.handle);
                return (msgs, true);
            }
        }
    }

    fn note_protocol_error(&mut self, now: Instant) -> bool {
        self.recent_protocol_errors.push_back(now);
        while let Some(&oldest) = self.recent_protocol_errors.front() {
            if now.duration_since(oldest) > PROTOCOL_ERROR_WINDOW {
                self.recent_protocol_errors.pop_front();
            } else {
                break;
            }
        }
        self.recent_protocol_errors.len() >= PROTOCOL_ERROR_LIMIT
    }

    // --------------------------------------------------------------- outbound

    #[inline]
    pub fn total_queued(&self) -> usize {
        self.broker_q.len()
            + self.status_q.len()
            + match &self.rpt_q {
                RptQueue::Single(q) => q.len(),
                RptQueue::PerSource { total, .. } => *total,
            }
    }

    #[inline]
    fn at_capacity(&self) -> bool {
        self.max_q_size != 0 && self.total_queued() >= self.max_q_size
    }

    /// Queues a broker-protocol message, packed with the broker's CID.
    pub fn push_broker(&mut self, sender_cid: &Cid, msg: &BrokerMessage) -> BrokerResult<()> {
        if self.at_capacity() {
            return Err(BrokerError::QueueFull);
        }
        self.broker_q.push_back(MessageRef::new(codec::pack_broker_message(sender_cid, msg)));
        Ok(())
    }

    /// Queues an RPT status reply.
    pub fn push_status(
        &mut self,
        sender_cid: &Cid,
        header: RptHeader,
        status: RptStatusMsg,
    ) -> BrokerResult<()> {
        if self.at_capacity() {
            return Err(BrokerError::QueueFull);
        }
        let msg = RptMessage { header, content: RptContent::Status(status) };
        self.status_q.push_back(MessageRef::new(codec::pack_rpt_message(sender_cid, &msg)));
        Ok(())
    }

    /// Queues RPT data (Request or Notification) originating from
    /// `from_client`. On device records the message lands in that source's
    /// partition.
    pub fn push_rpt(
        &mut self,
        from_client: ClientHandle,
        sender_cid: &Cid,
        msg: &RptMessage,
    ) -> BrokerResult<()> {
        if self.at_capacity() {
            return Err(BrokerError::QueueFull);
        }
        let packed = MessageRef::new(codec::pack_rpt_message(sender_cid, msg));
        match &mut self.rpt_q {
            RptQueue::Single(q) => q.push_back(packed),
            RptQueue::PerSource { parts, total, .. } => {
                parts.entry(from_client).or_insert_with(VecDeque::new).push_back(packed);
                *total += 1;
            }
        }
        Ok(())
    }

    /// Enqueues a heartbeat-null at the front of the broker queue if the
    /// send deadline has passed and nothing else is waiting. Idempotent: a
    /// non-empty queue already guarantees a transmission.
    pub fn maybe_enqueue_null(&mut self, sender_cid: &Cid, now: Instant) {
        if self.state == ConnectionState::Connected
            && self.send_timer.is_expired(now)
            && self.total_queued() == 0
        {
            self.broker_q.push_front(MessageRef::new(codec::pack_broker_message(
                sender_cid,
                &BrokerMessage::Null,
            )));
        }
    }

    /// Transmits from the highest-priority non-empty queue. A partially
    /// sent message pins its queue until it drains, so frames never
    /// interleave on the socket.
    pub fn send_one(&mut self, w: &mut impl Write, now: Instant) -> SendOutcome {
        let pick = match self.in_flight.or_else(|| self.pick_queue()) {
            Some(pick) => pick,
            None => return SendOutcome::Idle,
        };

        if let QueuePick::RptPart(part) = pick {
            return self.send_from_partition(part, w, now);
        }

        let q = match pick {
            QueuePick::Broker => &mut self.broker_q,
            QueuePick::Status => &mut self.status_q,
            QueuePick::Rpt => match &mut self.rpt_q {
                RptQueue::Single(q) => q,
                RptQueue::PerSource { .. } => return SendOutcome::Idle,
            },
            QueuePick::RptPart(_) => unreachable!(),
        };

        let res = write_front(q, w);
        let partial = q.front().map_or(false, |m| m.size_sent > 0);
        match res {
            WriteResult::Progress => {
                self.in_flight = if partial { Some(pick) } else { None };
                self.send_timer.reset(now);
                SendOutcome::Wrote
            }
            WriteResult::WouldBlock => SendOutcome::Idle,
            WriteResult::Error => {
                self.in_flight = None;
                SendOutcome::Fatal
            }
        }
    }

    fn send_from_partition(
        &mut self,
        part: ClientHandle,
        w: &mut impl Write,
        now: Instant,
    ) -> SendOutcome {
        let (parts, total, last_serviced) = match &mut self.rpt_q {
            RptQueue::PerSource { parts, total, last_serviced } => (parts, total, last_serviced),
            RptQueue::Single(_) => return SendOutcome::Idle,
        };
        *last_serviced = part;

        let q = match parts.get_mut(&part) {
            Some(q) => q,
            None => {
                self.in_flight = None;
                return SendOutcome::Idle;
            }
        };
        let before = q.len();
        let res = write_front(q, w);
        *total -= before - q.len();
        let now_empty = q.is_empty();
        let partial = q.front().map_or(false, |m| m.size_sent > 0);

        match res {
            WriteResult::Progress => {
                if now_empty {
                    parts.remove(&part);
                }
                self.in_flight = if partial { Some(QueuePick::RptPart(part)) } else { None };
                self.send_timer.reset(now);
                SendOutcome::Wrote
            }
            WriteResult::WouldBlock => SendOutcome::Idle,
            WriteResult::Error => {
                // A partition that fails to send is discarded wholesale.
                if let Some(dead) = parts.remove(&part) {
                    *total -= dead.len();
                }
                self.in_flight = None;
                SendOutcome::Fatal
            }
        }
    }

    fn pick_queue(&self) -> Option<QueuePick> {
        if !self.broker_q.is_empty() {
            return Some(QueuePick::Broker);
        }
        if !self.status_q.is_empty() {
            return Some(QueuePick::Status);
        }
        match &self.rpt_q {
            RptQueue::Single(q) => {
                if q.is_empty() {
                    None
                } else {
                    Some(QueuePick::Rpt)
                }
            }
            RptQueue::PerSource { parts, last_serviced, .. } => {
                next_nonempty_partition(parts, *last_serviced).map(QueuePick::RptPart)
            }
        }
    }

    /// Drops all queued RPT traffic from one source controller, e.g. when
    /// that controller goes away.
    pub fn drop_partition(&mut self, source: ClientHandle) {
        let in_flight_here = self.in_flight == Some(QueuePick::RptPart(source));
        if let RptQueue::PerSource { parts, total, .. } = &mut self.rpt_q {
            if in_flight_here {
                // Let the half-sent frame finish; everything behind it goes.
                if let Some(q) = parts.get_mut(&source) {
                    while q.len() > 1 {
                        q.pop_back();
                        *total -= 1;
                    }
                }
            } else if let Some(q) = parts.remove(&source) {
                *total -= q.len();
            }
        }
    }

    // ------------------------------------------------------------- lifecycle

    #[inline]
    pub fn message_received(&mut self, now: Instant) {
        self.heartbeat_timer.reset(now);
    }

    #[inline]
    pub fn heartbeat_expired(&self, now: Instant) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingConnect | ConnectionState::Connected
        ) && self.heartbeat_timer.is_expired(now)
    }

    pub fn mark_for_destruction(&mut self, now: Instant) {
        if self.state != ConnectionState::MarkedForDestruction {
            self.state = ConnectionState::MarkedForDestruction;
            self.drain_deadline = Some(now + DRAIN_TIMEOUT);
        }
    }

    /// A marked record is reaped once its farewell messages have drained or
    /// the drain bound has passed.
    pub fn ready_to_reap(&self, now: Instant) -> bool {
        self.state == ConnectionState::MarkedForDestruction
            && (self.total_queued() == 0
                || self.drain_deadline.map_or(true, |deadline| now >= deadline))
    }
}

fn write_front(q: &mut VecDeque<MessageRef>, w: &mut impl Write) -> WriteResult {
    let msg = match q.front_mut() {
        Some(msg) => msg,
        None => return WriteResult::WouldBlock,
    };
    match w.write(&msg.data[msg.size_sent..]) {
        Ok(0) => WriteResult::Error,
        Ok(n) => {
            msg.size_sent += n;
            if msg.size_sent >= msg.data.len() {
                q.pop_front();
            }
            WriteResult::Progress
        }
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            WriteResult::WouldBlock
        }
        Err(_) => WriteResult::Error,
    }
}

/// First non-empty partition strictly after `last`, wrapping around.
fn next_nonempty_partition(
    parts: &BTreeMap<ClientHandle, VecDeque<MessageRef>>,
    last: ClientHandle,
) -> Option<ClientHandle> {
    parts
        .range((Bound::Excluded(last), Bound::Unbounded))
        .chain(parts.range(..=last))
        .find(|(_, q)| !q.is_empty())
        .map(|(&h, _)| h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::proto;
    use lumen::logging;

    fn test_cid(n: u8) -> Cid {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        Cid::from_bytes(bytes)
    }

    fn test_record(now: Instant) -> ClientRecord {
        let log = logging::discard();
        let mut rec =
            ClientRecord::new(1, "127.0.0.1:4567".parse().unwrap(), None, now, &log);
        rec.begin_handshake(now);
        rec
    }

    fn controller_record(now: Instant, max_q: usize) -> ClientRecord {
        let mut rec = test_record(now);
        let entry = RptClientEntry {
            cid: test_cid(1),
            uid: Uid::new(0x6574, 2),
            client_type: RptClientType::Controller,
            binding_cid: Cid::default(),
        };
        rec.promote(&entry, entry.uid, max_q, now);
        rec
    }

    fn device_record(now: Instant, max_q: usize) -> ClientRecord {
        let mut rec = test_record(now);
        let entry = RptClientEntry {
            cid: test_cid(2),
            uid: Uid::new(0x6574, 3),
            client_type: RptClientType::Device,
            binding_cid: Cid::default(),
        };
        rec.promote(&entry, entry.uid, max_q, now);
        rec
    }

    fn request_from(seqnum: u32) -> RptMessage {
        RptMessage {
            header: RptHeader { seqnum, ..RptHeader::default() },
            content: RptContent::Request(RdmBufList {
                buffers: vec![RdmBuffer::new(vec![seqnum as u8; 26])],
                more_coming: false,
            }),
        }
    }

    fn drain_all(rec: &mut ClientRecord, now: Instant) -> Vec<u8> {
        let mut out = Vec::new();
        while rec.send_one(&mut out, now) == SendOutcome::Wrote {}
        out
    }

    #[test]
    fn test_push_order_is_send_order() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        for seq in 0..4 {
            rec.push_rpt(7, &broker_cid, &request_from(seq)).unwrap();
        }

        let sent = drain_all(&mut rec, now);
        let mut expected = Vec::new();
        for seq in 0..4 {
            expected.extend_from_slice(&codec::pack_rpt_message(&broker_cid, &request_from(seq)));
        }
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_queue_cap() {
        let now = Instant::now();
        let mut rec = controller_record(now, 3);
        let broker_cid = test_cid(9);

        for seq in 0..3 {
            rec.push_rpt(7, &broker_cid, &request_from(seq)).unwrap();
        }
        assert_eq!(
            rec.push_rpt(7, &broker_cid, &request_from(99)),
            Err(BrokerError::QueueFull)
        );
        assert_eq!(rec.total_queued(), 3);

        // Broker pushes count against the same cap.
        assert_eq!(
            rec.push_broker(&broker_cid, &BrokerMessage::Null),
            Err(BrokerError::QueueFull)
        );
    }

    #[test]
    fn test_zero_cap_is_unbounded() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        for seq in 0..1_000_000u32 {
            rec.push_broker(&broker_cid, &BrokerMessage::Null)
                .unwrap_or_else(|_| panic!("push {} refused with cap 0", seq));
        }
        assert_eq!(rec.total_queued(), 1_000_000);
    }

    #[test]
    fn test_broker_outranks_status_outranks_rpt() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_rpt(7, &broker_cid, &request_from(1)).unwrap();
        rec.push_status(
            &broker_cid,
            RptHeader::default(),
            RptStatusMsg { status_code: RptStatusCode::UnknownRptUid, status_string: None },
        )
        .unwrap();
        rec.push_broker(&broker_cid, &BrokerMessage::Null).unwrap();

        let sent = drain_all(&mut rec, now);
        // First frame out is the broker-protocol null.
        let null = codec::pack_broker_message(&broker_cid, &BrokerMessage::Null);
        assert_eq!(&sent[..null.len()], &null[..]);
        // Then the status, identified by its RPT vector field.
        let status_at = null.len() + proto::TCP_PREAMBLE_SIZE + proto::RLP_HEADER_SIZE + 3;
        assert_eq!(
            &sent[status_at..status_at + 4],
            &proto::VECTOR_RPT_STATUS.to_be_bytes()
        );
    }

    #[test]
    fn test_device_round_robin_across_controllers() {
        let now = Instant::now();
        let mut rec = device_record(now, 0);
        let broker_cid = test_cid(9);

        // Three controllers, three messages each, pushed in bursts.
        for controller in [10, 20, 30] {
            for n in 0..3 {
                rec.push_rpt(controller, &broker_cid, &request_from(controller as u32 + n))
                    .unwrap();
            }
        }

        let mut serviced = Vec::new();
        let mut out = Vec::new();
        for _ in 0..9 {
            assert_eq!(rec.send_one(&mut out, now), SendOutcome::Wrote);
            if let RptQueue::PerSource { last_serviced, .. } = &rec.rpt_q {
                serviced.push(*last_serviced);
            }
        }

        assert_eq!(serviced, vec![10, 20, 30, 10, 20, 30, 10, 20, 30]);
        assert_eq!(rec.send_one(&mut out, now), SendOutcome::Idle);
    }

    #[test]
    fn test_empty_partition_is_skipped() {
        let now = Instant::now();
        let mut rec = device_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_rpt(10, &broker_cid, &request_from(1)).unwrap();
        rec.push_rpt(30, &broker_cid, &request_from(2)).unwrap();
        rec.push_rpt(30, &broker_cid, &request_from(3)).unwrap();

        let mut serviced = Vec::new();
        let mut out = Vec::new();
        while rec.send_one(&mut out, now) == SendOutcome::Wrote {
            if let RptQueue::PerSource { last_serviced, .. } = &rec.rpt_q {
                serviced.push(*last_serviced);
            }
        }
        assert_eq!(serviced, vec![10, 30, 30]);
    }

    /// Writer that accepts a fixed number of bytes then blocks.
    struct ChokedWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_send_resumes_same_message() {
        let now = Instant::now();
        let mut rec = device_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_rpt(10, &broker_cid, &request_from(1)).unwrap();
        rec.push_rpt(20, &broker_cid, &request_from(2)).unwrap();
        let frame1 = codec::pack_rpt_message(&broker_cid, &request_from(1));
        let frame2 = codec::pack_rpt_message(&broker_cid, &request_from(2));

        let mut w = ChokedWriter { accepted: Vec::new(), budget: 10 };
        assert_eq!(rec.send_one(&mut w, now), SendOutcome::Wrote);
        assert_eq!(rec.send_one(&mut w, now), SendOutcome::Idle);

        // The rotation may not move on while a frame is in flight.
        w.budget = usize::max_value();
        while rec.send_one(&mut w, now) == SendOutcome::Wrote {}

        let mut expected = frame1;
        expected.extend_from_slice(&frame2);
        assert_eq!(w.accepted, expected);
    }

    #[test]
    fn test_heartbeat_null_when_idle() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        let later = now + Duration::from_millis(7500);
        rec.maybe_enqueue_null(&broker_cid, later);
        assert_eq!(rec.total_queued(), 1);

        // Idempotent: a queued null satisfies the deadline already.
        rec.maybe_enqueue_null(&broker_cid, later);
        assert_eq!(rec.total_queued(), 1);

        let sent = drain_all(&mut rec, later);
        assert_eq!(sent, codec::pack_broker_message(&broker_cid, &BrokerMessage::Null));

        // Sending reset the deadline; no new null yet.
        rec.maybe_enqueue_null(&broker_cid, later + Duration::from_millis(100));
        assert_eq!(rec.total_queued(), 0);
    }

    #[test]
    fn test_no_null_while_traffic_pending() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_rpt(7, &broker_cid, &request_from(1)).unwrap();
        rec.maybe_enqueue_null(&broker_cid, now + Duration::from_secs(8));
        assert_eq!(rec.total_queued(), 1);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);

        assert!(!rec.heartbeat_expired(now + Duration::from_secs(14)));
        assert!(rec.heartbeat_expired(now + Duration::from_secs(15)));

        rec.message_received(now + Duration::from_secs(10));
        assert!(!rec.heartbeat_expired(now + Duration::from_secs(20)));
        assert!(rec.heartbeat_expired(now + Duration::from_secs(25)));
    }

    #[test]
    fn test_protocol_error_escalation() {
        let now = Instant::now();
        let mut rec = test_record(now);

        assert!(!rec.note_protocol_error(now));
        assert!(!rec.note_protocol_error(now + Duration::from_millis(100)));
        assert!(rec.note_protocol_error(now + Duration::from_millis(200)));

        // Spread out beyond the window, errors are tolerated.
        let mut rec = test_record(now);
        assert!(!rec.note_protocol_error(now));
        assert!(!rec.note_protocol_error(now + Duration::from_millis(600)));
        assert!(!rec.note_protocol_error(now + Duration::from_millis(1700)));
    }

    #[test]
    fn test_reap_after_drain_or_deadline() {
        let now = Instant::now();
        let mut rec = controller_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_broker(
            &broker_cid,
            &BrokerMessage::Disconnect(DisconnectReason::Shutdown),
        )
        .unwrap();
        rec.mark_for_destruction(now);

        assert!(!rec.ready_to_reap(now));
        drain_all(&mut rec, now);
        assert!(rec.ready_to_reap(now));

        // Or, with traffic stuck, once the drain bound passes.
        let mut rec = controller_record(now, 0);
        rec.push_broker(&broker_cid, &BrokerMessage::Null).unwrap();
        rec.mark_for_destruction(now);
        assert!(!rec.ready_to_reap(now));
        assert!(rec.ready_to_reap(now + DRAIN_TIMEOUT));
    }

    #[test]
    fn test_drop_partition_discards_queued_traffic() {
        let now = Instant::now();
        let mut rec = device_record(now, 0);
        let broker_cid = test_cid(9);

        rec.push_rpt(10, &broker_cid, &request_from(1)).unwrap();
        rec.push_rpt(10, &broker_cid, &request_from(2)).unwrap();
        rec.push_rpt(20, &broker_cid, &request_from(3)).unwrap();

        rec.drop_partition(10);
        assert_eq!(rec.total_queued(), 1);

        let sent = drain_all(&mut rec, now);
        assert_eq!(sent, codec::pack_rpt_message(&broker_cid, &request_from(3)));
    }
}
