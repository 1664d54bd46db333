//! What a deferred-send session actually put on the wire.
//!
//! A mailbox session writes to a file that is uploaded later, so it cannot
//! mark anything as acked or sent while it runs. It records the ids instead;
//! once the upload succeeds the caller applies the record to storage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{ContactId, MessageId};
use courier_store::{Result as StoreResult, StoreTxn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingSessionRecord {
    acked: Vec<MessageId>,
    sent: Vec<MessageId>,
}

impl OutgoingSessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ack_sent(&mut self, ids: &[MessageId]) {
        self.acked.extend_from_slice(ids);
    }

    pub fn on_message_sent(&mut self, id: MessageId) {
        self.sent.push(id);
    }

    pub fn acked_ids(&self) -> &[MessageId] {
        &self.acked
    }

    pub fn sent_ids(&self) -> &[MessageId] {
        &self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.acked.is_empty() && self.sent.is_empty()
    }

    /// Mark the recorded acks and messages as sent to `contact`.
    pub fn apply(
        &self,
        txn: &mut dyn StoreTxn,
        contact: ContactId,
        max_latency: Duration,
    ) -> StoreResult<()> {
        if !self.acked.is_empty() {
            txn.set_ack_sent(contact, &self.acked)?;
        }
        for id in &self.sent {
            txn.set_message_sent(contact, id, max_latency)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let a = MessageId::from_bytes([1; 32]);
        let b = MessageId::from_bytes([2; 32]);
        let mut record = OutgoingSessionRecord::new();
        assert!(record.is_empty());
        record.on_ack_sent(&[a, b]);
        record.on_message_sent(b);
        assert_eq!(record.acked_ids(), &[a, b]);
        assert_eq!(record.sent_ids(), &[b]);
        assert!(!record.is_empty());
    }
}
