//! Proptest generators for property-based testing.

use proptest::prelude::*;

use courier_core::{
    Ack, ContactId, GroupId, Message, MessageId, Offer, Request, SyncMessage, Versions,
    MAX_MESSAGE_BODY_LENGTH, MAX_MESSAGE_IDS, MAX_SUPPORTED_VERSIONS,
};

/// Generate a random MessageId.
pub fn message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 32]>().prop_map(MessageId::from_bytes)
}

/// Generate a random GroupId.
pub fn group_id() -> impl Strategy<Value = GroupId> {
    any::<[u8; 32]>().prop_map(GroupId::from_bytes)
}

pub fn contact_id() -> impl Strategy<Value = ContactId> {
    any::<u32>().prop_map(ContactId)
}

/// A timestamp a message accepts.
pub fn timestamp() -> impl Strategy<Value = u64> {
    0u64..=i64::MAX as u64
}

/// A non-empty message body of at most `max_len` bytes.
pub fn body(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len.clamp(1, MAX_MESSAGE_BODY_LENGTH))
}

/// Between 1 and `max` ids, capped at what one record holds.
pub fn id_list(max: usize) -> impl Strategy<Value = Vec<MessageId>> {
    prop::collection::vec(message_id(), 1..=max.clamp(1, MAX_MESSAGE_IDS))
}

pub fn ack(max: usize) -> impl Strategy<Value = Ack> {
    id_list(max).prop_map(|ids| Ack::new(ids).unwrap())
}

pub fn offer(max: usize) -> impl Strategy<Value = Offer> {
    id_list(max).prop_map(|ids| Offer::new(ids).unwrap())
}

pub fn request(max: usize) -> impl Strategy<Value = Request> {
    id_list(max).prop_map(|ids| Request::new(ids).unwrap())
}

pub fn versions() -> impl Strategy<Value = Versions> {
    prop::collection::vec(any::<u8>(), 1..=MAX_SUPPORTED_VERSIONS)
        .prop_map(|v| Versions::new(v).unwrap())
}

/// Parameters for generating a message.
#[derive(Debug, Clone)]
pub struct MessageParams {
    pub group_id: GroupId,
    pub timestamp: u64,
    pub body: Vec<u8>,
}

impl MessageParams {
    pub fn build(&self) -> Message {
        Message::new(self.group_id, self.timestamp, &self.body).unwrap()
    }
}

impl Arbitrary for MessageParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (group_id(), timestamp(), body(512))
            .prop_map(|(group_id, timestamp, body)| MessageParams {
                group_id,
                timestamp,
                body,
            })
            .boxed()
    }
}

pub fn message() -> impl Strategy<Value = Message> {
    any::<MessageParams>().prop_map(|p| p.build())
}

/// Any sync record, with id lists kept short.
pub fn sync_message() -> impl Strategy<Value = SyncMessage> {
    prop_oneof![
        ack(16).prop_map(SyncMessage::Ack),
        message().prop_map(SyncMessage::Message),
        offer(16).prop_map(SyncMessage::Offer),
        request(16).prop_map(SyncMessage::Request),
        versions().prop_map(SyncMessage::Versions),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_message_id_deterministic(params: MessageParams) {
            prop_assert_eq!(params.build().id(), params.build().id());
        }

        #[test]
        fn test_message_id_unique_with_different_body(
            group in group_id(),
            b1 in body(100),
            b2 in body(100),
        ) {
            prop_assume!(b1 != b2);
            let m1 = Message::new(group, 1000, &b1).unwrap();
            let m2 = Message::new(group, 1000, &b2).unwrap();
            prop_assert_ne!(m1.id(), m2.id());
        }

        #[test]
        fn test_records_decode_to_themselves(message in sync_message()) {
            let record = message.to_record().unwrap();
            let kind = record.known_type().unwrap();
            let decoded = SyncMessage::from_record(kind, record.into_payload()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
