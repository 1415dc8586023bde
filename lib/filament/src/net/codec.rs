//! Packs typed messages into wire frames.
//!
//! Sizes are computed exactly before packing so callers can pre-allocate a
//! single buffer per message; the packers then fill it without reallocating.
//! Multi-entry messages walk their item lists once for the size and once for
//! the pack.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Cursor, Write};
use std::net::SocketAddr;

use crate::net::msgs::*;
use crate::net::proto;
use lumen::{Cid, Uid};

/// Total frame size (preamble included) of a broker-protocol message.
pub fn broker_packed_size(msg: &BrokerMessage) -> usize {
    proto::TCP_PREAMBLE_SIZE
        + proto::RLP_HEADER_SIZE
        + proto::BROKER_PDU_HEADER_SIZE
        + broker_data_size(msg)
}

/// Total frame size (preamble included) of an RPT message.
pub fn rpt_packed_size(msg: &RptMessage) -> usize {
    proto::TCP_PREAMBLE_SIZE
        + proto::RLP_HEADER_SIZE
        + proto::RPT_PDU_HEADER_SIZE
        + rpt_data_size(&msg.content)
}

pub fn packed_size(content: &MessageContent) -> usize {
    match content {
        MessageContent::Broker(msg) => broker_packed_size(msg),
        MessageContent::Rpt(msg) => rpt_packed_size(msg),
    }
}

/// Packs a complete frame for a broker-protocol message.
pub fn pack_broker_message(sender_cid: &Cid, msg: &BrokerMessage) -> Vec<u8> {
    let total = broker_packed_size(msg);
    let mut buf = vec![0u8; total];
    pack_broker_into(&mut buf, sender_cid, msg).expect("message overflowed its computed size");
    buf
}

/// Packs a complete frame for an RPT message. The sender CID is always the
/// packing component's own CID, never a forwarded one.
pub fn pack_rpt_message(sender_cid: &Cid, msg: &RptMessage) -> Vec<u8> {
    let total = rpt_packed_size(msg);
    let mut buf = vec![0u8; total];
    pack_rpt_into(&mut buf, sender_cid, msg).expect("message overflowed its computed size");
    buf
}

pub fn pack_message(sender_cid: &Cid, content: &MessageContent) -> Vec<u8> {
    match content {
        MessageContent::Broker(msg) => pack_broker_message(sender_cid, msg),
        MessageContent::Rpt(msg) => pack_rpt_message(sender_cid, msg),
    }
}

fn broker_data_size(msg: &BrokerMessage) -> usize {
    match msg {
        BrokerMessage::ClientConnect(c) => {
            proto::CLIENT_CONNECT_COMMON_FIELD_SIZE + client_entry_size(&c.client_entry)
        }
        BrokerMessage::ConnectReply(_) => proto::CONNECT_REPLY_DATA_SIZE,
        BrokerMessage::ClientEntryUpdate(u) => {
            proto::CLIENT_ENTRY_UPDATE_COMMON_FIELD_SIZE + client_entry_size(&u.client_entry)
        }
        BrokerMessage::Redirect(addr) => match addr {
            SocketAddr::V4(_) => proto::REDIRECT_V4_DATA_SIZE,
            SocketAddr::V6(_) => proto::REDIRECT_V6_DATA_SIZE,
        },
        BrokerMessage::FetchClientList | BrokerMessage::Null => 0,
        BrokerMessage::ClientList(l) => l.entries.len() * proto::RPT_CLIENT_ENTRY_SIZE,
        BrokerMessage::RequestDynamicUids(l) => {
            l.requests.len() * proto::DYNAMIC_UID_REQUEST_PAIR_SIZE
        }
        BrokerMessage::AssignedDynamicUids(l) => {
            l.mappings.len() * proto::DYNAMIC_UID_MAPPING_SIZE
        }
        BrokerMessage::FetchDynamicUidList(l) => l.uids.len() * proto::FETCH_UID_ITEM_SIZE,
        BrokerMessage::Disconnect(_) => proto::DISCONNECT_DATA_SIZE,
    }
}

fn client_entry_size(entry: &ClientEntry) -> usize {
    proto::CLIENT_ENTRY_HEADER_SIZE
        + match entry {
            ClientEntry::Rpt(_) => proto::RPT_CLIENT_ENTRY_DATA_SIZE,
            ClientEntry::Ept(_) => 0,
        }
}

fn rpt_data_size(content: &RptContent) -> usize {
    match content {
        RptContent::Request(list) | RptContent::Notification(list) => {
            proto::REQUEST_NOTIF_PDU_HEADER_SIZE
                + list.buffers.iter().map(|b| 3 + b.len()).sum::<usize>()
        }
        RptContent::Status(status) => {
            proto::RPT_STATUS_HEADER_SIZE
                + status.status_string.as_ref().map_or(0, |s| s.len())
        }
    }
}

fn broker_vector(msg: &BrokerMessage) -> u16 {
    match msg {
        BrokerMessage::ClientConnect(_) => proto::VECTOR_BROKER_CONNECT,
        BrokerMessage::ConnectReply(_) => proto::VECTOR_BROKER_CONNECT_REPLY,
        BrokerMessage::ClientEntryUpdate(_) => proto::VECTOR_BROKER_CLIENT_ENTRY_UPDATE,
        BrokerMessage::Redirect(SocketAddr::V4(_)) => proto::VECTOR_BROKER_REDIRECT_V4,
        BrokerMessage::Redirect(SocketAddr::V6(_)) => proto::VECTOR_BROKER_REDIRECT_V6,
        BrokerMessage::FetchClientList => proto::VECTOR_BROKER_FETCH_CLIENT_LIST,
        BrokerMessage::ClientList(l) => l.action.as_vector(),
        BrokerMessage::RequestDynamicUids(_) => proto::VECTOR_BROKER_REQUEST_DYNAMIC_UIDS,
        BrokerMessage::AssignedDynamicUids(_) => proto::VECTOR_BROKER_ASSIGNED_DYNAMIC_UIDS,
        BrokerMessage::FetchDynamicUidList(_) => proto::VECTOR_BROKER_FETCH_DYNAMIC_UID_LIST,
        BrokerMessage::Disconnect(_) => proto::VECTOR_BROKER_DISCONNECT,
        BrokerMessage::Null => proto::VECTOR_BROKER_NULL,
    }
}

fn pack_broker_into(buf: &mut [u8], sender_cid: &Cid, msg: &BrokerMessage) -> io::Result<()> {
    let data_len = broker_data_size(msg);
    let mut w = Cursor::new(buf);

    write_frame_prefix(&mut w, proto::VECTOR_ROOT_BROKER, sender_cid)?;
    write_pdu_length(&mut w, proto::BROKER_PDU_HEADER_SIZE + data_len)?;
    w.write_u16::<BigEndian>(broker_vector(msg))?;

    match msg {
        BrokerMessage::ClientConnect(c) => {
            write_padded_string(&mut w, &c.scope, lumen::SCOPE_STRING_PADDED_LENGTH)?;
            w.write_u16::<BigEndian>(c.e133_version)?;
            write_padded_string(&mut w, &c.search_domain, lumen::DOMAIN_STRING_PADDED_LENGTH)?;
            w.write_u8(c.connect_flags)?;
            write_client_entry(&mut w, &c.client_entry)?;
        }
        BrokerMessage::ConnectReply(r) => {
            w.write_u16::<BigEndian>(r.status.as_u16())?;
            w.write_u16::<BigEndian>(r.e133_version)?;
            write_uid(&mut w, &r.broker_uid)?;
            write_uid(&mut w, &r.client_uid)?;
        }
        BrokerMessage::ClientEntryUpdate(u) => {
            w.write_u8(u.connect_flags)?;
            write_client_entry(&mut w, &u.client_entry)?;
        }
        BrokerMessage::Redirect(addr) => {
            match addr {
                SocketAddr::V4(v4) => w.write_all(&v4.ip().octets())?,
                SocketAddr::V6(v6) => w.write_all(&v6.ip().octets())?,
            }
            w.write_u16::<BigEndian>(addr.port())?;
        }
        BrokerMessage::FetchClientList | BrokerMessage::Null => {}
        BrokerMessage::ClientList(l) => {
            for entry in &l.entries {
                write_rpt_client_entry(&mut w, entry)?;
            }
        }
        BrokerMessage::RequestDynamicUids(l) => {
            for req in &l.requests {
                write_uid(&mut w, &req.uid)?;
                w.write_all(req.rid.as_bytes())?;
            }
        }
        BrokerMessage::AssignedDynamicUids(l) => {
            for mapping in &l.mappings {
                write_uid(&mut w, &mapping.uid)?;
                w.write_all(mapping.rid.as_bytes())?;
                w.write_u16::<BigEndian>(mapping.status.as_u16())?;
            }
        }
        BrokerMessage::FetchDynamicUidList(l) => {
            for uid in &l.uids {
                write_uid(&mut w, uid)?;
            }
        }
        BrokerMessage::Disconnect(reason) => {
            w.write_u16::<BigEndian>(reason.as_u16())?;
        }
    }
    Ok(())
}

fn pack_rpt_into(buf: &mut [u8], sender_cid: &Cid, msg: &RptMessage) -> io::Result<()> {
    let data_len = rpt_data_size(&msg.content);
    let mut w = Cursor::new(buf);

    write_frame_prefix(&mut w, proto::VECTOR_ROOT_RPT, sender_cid)?;
    write_pdu_length(&mut w, proto::RPT_PDU_HEADER_SIZE + data_len)?;
    w.write_u32::<BigEndian>(msg.content.vector())?;
    write_uid(&mut w, &msg.header.source_uid)?;
    w.write_u16::<BigEndian>(msg.header.source_endpoint)?;
    write_uid(&mut w, &msg.header.dest_uid)?;
    w.write_u16::<BigEndian>(msg.header.dest_endpoint)?;
    w.write_u32::<BigEndian>(msg.header.seqnum)?;
    w.write_u8(0)?; // reserved

    match &msg.content {
        RptContent::Request(list) | RptContent::Notification(list) => {
            write_pdu_length(&mut w, data_len)?;
            w.write_u32::<BigEndian>(proto::VECTOR_RDM_CMD)?;
            for rdm in &list.buffers {
                write_pdu_length(&mut w, 3 + rdm.len())?;
                w.write_all(&rdm.data)?;
            }
        }
        RptContent::Status(status) => {
            write_pdu_length(&mut w, data_len)?;
            w.write_u16::<BigEndian>(status.status_code.as_u16())?;
            if let Some(text) = &status.status_string {
                w.write_all(text.as_bytes())?;
            }
        }
    }
    Ok(())
}

/// TCP preamble plus the Root Layer PDU header. The frame carries exactly
/// one root PDU, so the RLP length equals the preamble's block length.
fn write_frame_prefix(
    w: &mut Cursor<&mut [u8]>,
    root_vector: u32,
    sender_cid: &Cid,
) -> io::Result<()> {
    let rlp_block_len = w.get_ref().len() - proto::TCP_PREAMBLE_SIZE;

    w.write_all(&proto::ACN_PACKET_IDENT)?;
    w.write_u32::<BigEndian>(rlp_block_len as u32)?;
    write_pdu_length(w, rlp_block_len)?;
    w.write_u32::<BigEndian>(root_vector)?;
    w.write_all(sender_cid.as_bytes())?;
    Ok(())
}

fn write_pdu_length(w: &mut Cursor<&mut [u8]>, length: usize) -> io::Result<()> {
    w.write_u8(proto::PDU_FLAGS | ((length >> 16) & 0x0f) as u8)?;
    w.write_u16::<BigEndian>((length & 0xffff) as u16)
}

fn write_uid(w: &mut Cursor<&mut [u8]>, uid: &Uid) -> io::Result<()> {
    w.write_u16::<BigEndian>(uid.manu)?;
    w.write_u32::<BigEndian>(uid.device)
}

fn write_client_entry(w: &mut Cursor<&mut [u8]>, entry: &ClientEntry) -> io::Result<()> {
    write_pdu_length(w, client_entry_size(entry))?;
    match entry {
        ClientEntry::Rpt(_) => w.write_u32::<BigEndian>(proto::VECTOR_ROOT_RPT)?,
        ClientEntry::Ept(_) => w.write_u32::<BigEndian>(proto::VECTOR_ROOT_EPT)?,
    }
    w.write_all(entry.cid().as_bytes())?;
    if let ClientEntry::Rpt(rpt) = entry {
        write_uid(w, &rpt.uid)?;
        w.write_u8(rpt.client_type.as_u8())?;
        w.write_all(rpt.binding_cid.as_bytes())?;
    }
    Ok(())
}

fn write_rpt_client_entry(w: &mut Cursor<&mut [u8]>, entry: &RptClientEntry) -> io::Result<()> {
    write_pdu_length(w, proto::RPT_CLIENT_ENTRY_SIZE)?;
    w.write_u32::<BigEndian>(proto::VECTOR_ROOT_RPT)?;
    w.write_all(entry.cid.as_bytes())?;
    write_uid(w, &entry.uid)?;
    w.write_u8(entry.client_type.as_u8())?;
    w.write_all(entry.binding_cid.as_bytes())?;
    Ok(())
}

/// Strings travel in fixed-width NUL-padded fields and are always
/// NUL-terminated, so at most `width - 1` bytes of content survive.
fn write_padded_string(w: &mut Cursor<&mut [u8]>, s: &str, width: usize) -> io::Result<()> {
    let bytes = s.as_bytes();
    let take = bytes.len().min(width - 1);
    w.write_all(&bytes[..take])?;
    for _ in take..width {
        w.write_u8(0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Cid {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        Cid::from_bytes(bytes)
    }

    #[test]
    fn test_connect_reply_layout() {
        let reply = BrokerMessage::ConnectReply(ConnectReplyMsg {
            status: ConnectStatus::Ok,
            e133_version: 1,
            broker_uid: Uid::new(0x6574, 1),
            client_uid: Uid::new(0x6574, 2),
        });

        let frame = pack_broker_message(&cid(9), &reply);

        assert_eq!(frame.len(), 62);
        assert_eq!(&frame[..16], &proto::ACN_PACKET_IDENT);
        // Preamble block length covers everything after the preamble.
        assert_eq!(&frame[16..20], &[0, 0, 0, 42]);
        // Root layer: flags/length, vector, sender CID.
        assert_eq!(frame[20], 0xf0);
        assert_eq!(&frame[21..23], &[0, 42]);
        assert_eq!(&frame[23..27], &[0, 0, 0, 9]);
        assert_eq!(&frame[27..43], cid(9).as_bytes());
        // Broker PDU: flags/length, vector, reply body.
        assert_eq!(frame[43], 0xf0);
        assert_eq!(&frame[44..46], &[0, 19]);
        assert_eq!(&frame[46..48], &[0, 2]);
        assert_eq!(&frame[48..50], &[0, 0]); // status Ok
        assert_eq!(&frame[50..52], &[0, 1]); // version
        assert_eq!(&frame[52..58], &[0x65, 0x74, 0, 0, 0, 1]);
        assert_eq!(&frame[58..62], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_null_frame_size() {
        let frame = pack_broker_message(&cid(1), &BrokerMessage::Null);

        assert_eq!(
            frame.len(),
            proto::TCP_PREAMBLE_SIZE + proto::RLP_HEADER_SIZE + proto::BROKER_PDU_HEADER_SIZE
        );
        // Broker vector sits right after the broker PDU flags/length.
        assert_eq!(&frame[46..48], &[0, 0x0f]);
    }

    #[test]
    fn test_request_sizes_cover_all_buffers() {
        let msg = RptMessage {
            header: RptHeader::default(),
            content: RptContent::Request(RdmBufList {
                buffers: vec![RdmBuffer::new(vec![0xcc; 26])],
                more_coming: false,
            }),
        };

        let frame = pack_rpt_message(&cid(2), &msg);

        assert_eq!(frame.len(), rpt_packed_size(&msg));
        assert_eq!(
            frame.len(),
            proto::TCP_PREAMBLE_SIZE
                + proto::RLP_HEADER_SIZE
                + proto::RPT_PDU_HEADER_SIZE
                + proto::REQUEST_NOTIF_PDU_HEADER_SIZE
                + 3
                + 26
        );
    }

    #[test]
    fn test_scope_field_is_nul_terminated() {
        let long_scope = "x".repeat(200);
        let msg = BrokerMessage::ClientConnect(ClientConnectMsg {
            scope: long_scope,
            e133_version: 1,
            search_domain: String::new(),
            connect_flags: 0,
            client_entry: ClientEntry::Rpt(RptClientEntry {
                cid: cid(3),
                uid: Uid::new(0x6574, 0x8000_0001),
                client_type: RptClientType::Controller,
                binding_cid: Cid::default(),
            }),
        });

        let frame = pack_broker_message(&cid(3), &msg);

        // Scope field begins after the broker PDU vector; its final byte is
        // forced to NUL even when the input overflows the field.
        let scope_field = &frame[48..48 + lumen::SCOPE_STRING_PADDED_LENGTH];
        assert_eq!(scope_field[lumen::SCOPE_STRING_PADDED_LENGTH - 1], 0);
        assert!(scope_field[..62].iter().all(|&b| b == b'x'));
    }
}
