//! Handling of RDM requests addressed to the broker's own UID.
//!
//! The broker terminates these locally instead of routing them. RDM
//! parameter data handlers are not implemented yet, so every request is
//! answered with a status telling the controller this responder has nothing
//! for it.

use crate::net::msgs::{RdmBuffer, RptHeader, RptStatusCode, RptStatusMsg};

pub struct BrokerResponder;

impl BrokerResponder {
    pub fn new() -> BrokerResponder {
        BrokerResponder
    }

    /// Produces the reply for a request aimed at the broker itself. The
    /// returned header already points back at the requester.
    pub fn process_request(
        &self,
        header: &RptHeader,
        _buffers: &[RdmBuffer],
    ) -> (RptHeader, RptStatusMsg) {
        (
            header.swapped_for_reply(),
            RptStatusMsg {
                status_code: RptStatusCode::UnknownRdmUid,
                status_string: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen::Uid;

    #[test]
    fn test_reply_targets_the_requester() {
        let responder = BrokerResponder::new();
        let header = RptHeader {
            source_uid: Uid::new(0x6574, 2),
            source_endpoint: 0,
            dest_uid: Uid::new(0x6574, 1),
            dest_endpoint: 0,
            seqnum: 5,
        };

        let (reply_header, status) = responder.process_request(&header, &[]);

        assert_eq!(reply_header.dest_uid, header.source_uid);
        assert_eq!(reply_header.source_uid, header.dest_uid);
        assert_eq!(status.status_code, RptStatusCode::UnknownRdmUid);
    }
}
