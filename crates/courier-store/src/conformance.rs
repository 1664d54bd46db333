//! Behaviour every store implementation must share. Run by the test modules
//! of each backend.

use std::time::Duration;

use courier_core::{
    Ack, ClientId, ClientKey, ContactId, Group, Message, MessageId, MessageState, Metadata,
    Offer, Request, Visibility, MAX_MESSAGE_IDS, RECORD_HEADER_LENGTH,
};

use crate::error::{Result, StoreError};
use crate::traits::{Store, StoreTxn};

const LATENCY: Duration = Duration::from_secs(30);
const ALICE: ContactId = ContactId(1);
const BOB: ContactId = ContactId(2);

fn client() -> ClientKey {
    ClientKey::new(ClientId::new("org.example.forum").unwrap(), 1)
}

fn group(descriptor: &[u8]) -> Group {
    Group::new(client(), descriptor.to_vec()).unwrap()
}

fn message(group: &Group, timestamp: u64, body: &[u8]) -> Message {
    Message::new(group.id(), timestamp, body).unwrap()
}

fn write<S: Store, R>(store: &S, body: impl FnOnce(&mut dyn StoreTxn) -> Result<R>) -> R {
    store.transaction_blocking(false, body).unwrap()
}

fn read<S: Store, R>(store: &S, body: impl FnOnce(&mut dyn StoreTxn) -> Result<R>) -> R {
    store.transaction_blocking(true, body).unwrap()
}

/// Add a contact that sees `group` as shared.
fn share_with<S: Store>(store: &S, contact: ContactId, group: &Group) {
    write(store, |txn| {
        txn.add_contact(contact)?;
        txn.add_group(group)?;
        txn.set_group_visibility(contact, &group.id(), Visibility::Shared)
    });
}

/// Store a local message that is ready to go out.
fn add_sendable<S: Store>(store: &S, message: &Message) {
    write(store, |txn| {
        txn.add_message(message, MessageState::Delivered, true, None)
    });
}

pub(crate) fn run_all<S: Store>(store: &S) {
    contacts_and_groups(store);
    message_lifecycle(store);
    dependency_states(store);
    client_queries(store);
    unacked_and_acks(store);
    retransmission_timers(store);
    incoming_messages(store);
    offers_and_requests(store);
    offer_generation(store);
    capacity_packing(store);
    removal_cascades(store);
    unknown_contact(store);
}

fn contacts_and_groups<S: Store>(store: &S) {
    let g = group(b"contacts");
    share_with(store, ALICE, &g);

    read(store, |txn| {
        assert!(txn.contains_contact(ALICE)?);
        assert!(txn.contains_group(&g.id())?);
        assert_eq!(txn.get_group(&g.id())?, g);
        assert_eq!(
            txn.get_group_visibility(ALICE, &g.id())?,
            Visibility::Shared
        );
        Ok(())
    });

    let missing = group(b"never added");
    let err = store
        .transaction_blocking(true, |txn| txn.get_group(&missing.id()))
        .unwrap_err();
    assert!(matches!(err, StoreError::NoSuchGroup(_)));
    assert!(err.is_missing());

    write(store, |txn| txn.remove_group(&g.id()));
}

fn message_lifecycle<S: Store>(store: &S) {
    let g = group(b"lifecycle");
    let m = message(&g, 1_000, b"hello");
    write(store, |txn| {
        txn.add_group(&g)?;
        txn.add_message(&m, MessageState::Unknown, false, None)
    });

    read(store, |txn| {
        assert!(txn.contains_message(&m.id())?);
        assert_eq!(txn.get_message(&m.id())?, m);
        assert_eq!(txn.get_message_state(&m.id())?, MessageState::Unknown);
        assert!(!txn.is_message_shared(&m.id())?);
        Ok(())
    });

    write(store, |txn| {
        txn.merge_message_metadata(&m.id(), &Metadata::new().with("k", "v"))?;
        txn.set_message_state(&m.id(), MessageState::Pending)?;
        txn.set_message_state(&m.id(), MessageState::Invalid)
    });
    assert_eq!(
        read(store, |txn| txn.get_message_metadata(&m.id())).get("k"),
        Some(&b"v"[..])
    );

    // Invalid is terminal.
    let err = store
        .transaction_blocking(false, |txn| {
            txn.set_message_state(&m.id(), MessageState::Delivered)
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalStateTransition { .. }));
    write(store, |txn| txn.set_message_state(&m.id(), MessageState::Invalid));

    // Deleting leaves a tombstone.
    write(store, |txn| {
        txn.delete_message(&m.id())?;
        txn.delete_message_metadata(&m.id())
    });
    read(store, |txn| {
        assert!(txn.contains_message(&m.id())?);
        assert!(matches!(
            txn.get_message(&m.id()),
            Err(StoreError::NoSuchMessage(_))
        ));
        assert_eq!(txn.get_message_state(&m.id())?, MessageState::Invalid);
        assert!(txn.get_message_metadata(&m.id())?.is_empty());
        Ok(())
    });

    write(store, |txn| txn.remove_group(&g.id()));
}

fn dependency_states<S: Store>(store: &S) {
    let g = group(b"deps");
    let other = group(b"deps elsewhere");
    let delivered = message(&g, 1, b"delivered");
    let foreign = message(&other, 2, b"foreign");
    let absent = MessageId::from_bytes([0xee; 32]);
    let dependent = message(&g, 3, b"dependent");

    write(store, |txn| {
        txn.add_group(&g)?;
        txn.add_group(&other)?;
        txn.add_message(&delivered, MessageState::Delivered, false, None)?;
        txn.add_message(&foreign, MessageState::Delivered, false, None)?;
        txn.add_message(&dependent, MessageState::Unknown, false, None)?;
        txn.add_message_dependencies(&dependent, &[delivered.id(), foreign.id(), absent])
    });

    read(store, |txn| {
        let deps = txn.get_message_dependencies(&dependent.id())?;
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[&delivered.id()], MessageState::Delivered);
        assert_eq!(deps[&foreign.id()], MessageState::Invalid);
        assert_eq!(deps[&absent], MessageState::Unknown);

        let dependents = txn.get_message_dependents(&foreign.id())?;
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[&dependent.id()], MessageState::Unknown);
        assert!(txn.get_message_dependencies(&delivered.id())?.is_empty());
        Ok(())
    });

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_group(&other.id())
    });
}

fn client_queries<S: Store>(store: &S) {
    let g = group(b"queries");
    let unknown = message(&g, 5, b"unknown");
    let pending = message(&g, 6, b"pending");
    let base = message(&g, 1, b"base");
    let top = message(&g, 2, b"top");

    write(store, |txn| {
        txn.add_group(&g)?;
        txn.add_message(&unknown, MessageState::Unknown, false, None)?;
        txn.add_message(&pending, MessageState::Pending, false, None)?;
        txn.add_message(&base, MessageState::Delivered, false, None)?;
        txn.add_message(&top, MessageState::Delivered, true, None)?;
        txn.add_message_dependencies(&top, &[base.id()])
    });

    read(store, |txn| {
        assert_eq!(txn.get_messages_to_validate(&client())?, vec![unknown.id()]);
        assert_eq!(txn.get_pending_messages(&client())?, vec![pending.id()]);
        assert_eq!(txn.get_messages_to_share(&client())?, vec![base.id()]);
        let other = ClientKey::new(ClientId::new("org.example.blog").unwrap(), 1);
        assert!(txn.get_messages_to_validate(&other)?.is_empty());
        Ok(())
    });

    // A deleted message is not validated.
    write(store, |txn| txn.delete_message(&unknown.id()));
    assert!(read(store, |txn| txn.get_messages_to_validate(&client())).is_empty());

    write(store, |txn| txn.remove_group(&g.id()));
}

fn unacked_and_acks<S: Store>(store: &S) {
    let g = group(b"acks");
    share_with(store, ALICE, &g);
    let old = message(&g, 10, b"old");
    let new = message(&g, 20, b"new");
    add_sendable(store, &new);
    add_sendable(store, &old);

    assert_eq!(
        read(store, |txn| txn.get_unacked_messages_to_send(ALICE)),
        vec![old.id(), new.id()]
    );

    // Sending does not remove a message from the unacked list.
    let sent = write(store, |txn| {
        txn.get_message_to_send(ALICE, &old.id(), LATENCY, true)
    });
    assert_eq!(sent, Some(old.clone()));
    assert_eq!(
        read(store, |txn| txn.get_unacked_messages_to_send(ALICE)).len(),
        2
    );

    // An ack does.
    write(store, |txn| {
        txn.receive_ack(ALICE, &Ack::new(vec![old.id()]).unwrap())
    });
    assert_eq!(
        read(store, |txn| txn.get_unacked_messages_to_send(ALICE)),
        vec![new.id()]
    );
    assert_eq!(
        write(store, |txn| txn.get_message_to_send(ALICE, &old.id(), LATENCY, false)),
        None
    );

    // Unshared messages are never offered.
    let private = message(&g, 30, b"private");
    write(store, |txn| {
        txn.add_message(&private, MessageState::Delivered, false, None)
    });
    assert!(!read(store, |txn| txn.get_unacked_messages_to_send(ALICE)).contains(&private.id()));

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn retransmission_timers<S: Store>(store: &S) {
    let g = group(b"timers");
    share_with(store, ALICE, &g);
    let m = message(&g, 1, b"timed");
    add_sendable(store, &m);

    let due = |store: &S| read(store, |txn| txn.get_messages_to_send(ALICE, u64::MAX, LATENCY));
    assert_eq!(due(store), vec![m.id()]);

    write(store, |txn| txn.set_message_sent(ALICE, &m.id(), LATENCY));
    assert!(due(store).is_empty());

    // A faster transport may overtake the previous transmission.
    let fast = read(store, |txn| {
        txn.get_messages_to_send(ALICE, u64::MAX, Duration::from_millis(1))
    });
    assert_eq!(fast, vec![m.id()]);

    // A request makes it due at once.
    write(store, |txn| {
        txn.receive_request(ALICE, &Request::new(vec![m.id()]).unwrap())
    });
    assert_eq!(due(store), vec![m.id()]);

    // Marking without sending stays read-only until asked.
    let peeked = write(store, |txn| txn.get_message_to_send(ALICE, &m.id(), LATENCY, false));
    assert_eq!(peeked, Some(m.clone()));
    assert_eq!(due(store), vec![m.id()]);

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn incoming_messages<S: Store>(store: &S) {
    let g = group(b"incoming");
    let m = message(&g, 1, b"from alice");
    write(store, |txn| {
        txn.add_contact(ALICE)?;
        txn.add_group(&g)
    });

    // Invisible groups are dropped.
    assert!(!write(store, |txn| txn.receive_message(ALICE, &m)));
    assert!(!read(store, |txn| txn.contains_message(&m.id())));

    write(store, |txn| {
        txn.set_group_visibility(ALICE, &g.id(), Visibility::Visible)
    });
    assert!(write(store, |txn| txn.receive_message(ALICE, &m)));
    read(store, |txn| {
        assert_eq!(txn.get_message_state(&m.id())?, MessageState::Unknown);
        assert_eq!(txn.get_messages_to_ack(ALICE, MAX_MESSAGE_IDS)?, vec![m.id()]);
        Ok(())
    });

    let ack = write(store, |txn| txn.generate_ack(ALICE, MAX_MESSAGE_IDS));
    assert_eq!(ack.map(Ack::into_ids), Some(vec![m.id()]));
    assert_eq!(write(store, |txn| txn.generate_ack(ALICE, MAX_MESSAGE_IDS)), None);

    // A duplicate is acked again but not re-added.
    assert!(!write(store, |txn| txn.receive_message(ALICE, &m)));
    assert_eq!(
        read(store, |txn| txn.get_messages_to_ack(ALICE, MAX_MESSAGE_IDS)),
        vec![m.id()]
    );
    write(store, |txn| txn.set_ack_sent(ALICE, &[m.id()]));
    assert!(read(store, |txn| txn.get_messages_to_ack(ALICE, MAX_MESSAGE_IDS)).is_empty());

    // Tombstones are acked too.
    write(store, |txn| {
        txn.set_message_state(&m.id(), MessageState::Invalid)?;
        txn.delete_message(&m.id())
    });
    assert!(!write(store, |txn| txn.receive_message(ALICE, &m)));
    assert_eq!(
        read(store, |txn| txn.get_messages_to_ack(ALICE, MAX_MESSAGE_IDS)),
        vec![m.id()]
    );

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn offers_and_requests<S: Store>(store: &S) {
    let g = group(b"offers");
    share_with(store, ALICE, &g);
    let have = message(&g, 1, b"have");
    let want = message(&g, 2, b"want");
    add_sendable(store, &have);

    write(store, |txn| {
        txn.receive_offer(ALICE, &Offer::new(vec![have.id(), want.id()]).unwrap())
    });
    read(store, |txn| {
        assert_eq!(txn.get_messages_to_ack(ALICE, MAX_MESSAGE_IDS)?, vec![have.id()]);
        // Alice has it, so it is no longer ours to send.
        assert!(txn.get_unacked_messages_to_send(ALICE)?.is_empty());
        Ok(())
    });

    let request = write(store, |txn| txn.generate_request(ALICE, MAX_MESSAGE_IDS));
    assert_eq!(request.map(Request::into_ids), Some(vec![want.id()]));
    assert_eq!(write(store, |txn| txn.generate_request(ALICE, MAX_MESSAGE_IDS)), None);

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn offer_generation<S: Store>(store: &S) {
    let g = group(b"offering");
    share_with(store, ALICE, &g);
    let first = message(&g, 1, b"first");
    let second = message(&g, 2, b"second");
    let third = message(&g, 3, b"third");
    for m in [&first, &second, &third] {
        add_sendable(store, m);
    }

    let offer = write(store, |txn| txn.generate_offer(ALICE, 2, LATENCY));
    assert_eq!(offer.map(Offer::into_ids), Some(vec![first.id(), second.id()]));
    let offer = write(store, |txn| txn.generate_offer(ALICE, MAX_MESSAGE_IDS, LATENCY));
    assert_eq!(offer.map(Offer::into_ids), Some(vec![third.id()]));
    // Offering counts as a transmission.
    assert_eq!(write(store, |txn| txn.generate_offer(ALICE, MAX_MESSAGE_IDS, LATENCY)), None);
    assert!(read(store, |txn| txn.get_messages_to_send(ALICE, u64::MAX, LATENCY)).is_empty());

    // A request makes the message due again; it is sent, not offered again.
    write(store, |txn| {
        txn.receive_request(ALICE, &Request::new(vec![second.id()]).unwrap())
    });
    let due = |store: &S| read(store, |txn| txn.get_messages_to_send(ALICE, u64::MAX, LATENCY));
    assert_eq!(due(store), vec![second.id()]);
    assert_eq!(write(store, |txn| txn.generate_offer(ALICE, MAX_MESSAGE_IDS, LATENCY)), None);

    let sent = write(store, |txn| txn.get_message_to_send(ALICE, &second.id(), LATENCY, true));
    assert_eq!(sent, Some(second.clone()));
    assert!(due(store).is_empty());
    // Once sent it is offered again when its retransmission falls due.
    assert_eq!(write(store, |txn| txn.generate_offer(ALICE, MAX_MESSAGE_IDS, LATENCY)), None);

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn capacity_packing<S: Store>(store: &S) {
    let g = group(b"capacity");
    share_with(store, ALICE, &g);
    let first = message(&g, 1, &[1u8; 100]);
    let second = message(&g, 2, &[2u8; 100]);
    let third = message(&g, 3, &[3u8; 10]);
    for m in [&first, &second, &third] {
        add_sendable(store, m);
    }

    let one_record = (RECORD_HEADER_LENGTH + first.len()) as u64;
    let fits = |capacity| read(store, |txn| txn.get_messages_to_send(ALICE, capacity, LATENCY));
    assert_eq!(fits(one_record), vec![first.id()]);
    assert_eq!(fits(one_record - 1), Vec::<MessageId>::new());
    // Stops at the first message that does not fit.
    assert_eq!(fits(one_record * 2 - 1), vec![first.id()]);
    assert_eq!(fits(u64::MAX).len(), 3);

    write(store, |txn| {
        txn.remove_group(&g.id())?;
        txn.remove_contact(ALICE)
    });
}

fn removal_cascades<S: Store>(store: &S) {
    let g = group(b"cascade");
    share_with(store, ALICE, &g);
    share_with(store, BOB, &g);
    let m = message(&g, 1, b"doomed");
    add_sendable(store, &m);

    write(store, |txn| txn.remove_contact(BOB));
    read(store, |txn| {
        assert!(!txn.contains_contact(BOB)?);
        assert_eq!(txn.get_unacked_messages_to_send(ALICE)?, vec![m.id()]);
        Ok(())
    });

    write(store, |txn| txn.remove_group(&g.id()));
    read(store, |txn| {
        assert!(!txn.contains_group(&g.id())?);
        assert!(!txn.contains_message(&m.id())?);
        assert!(txn.get_unacked_messages_to_send(ALICE)?.is_empty());
        Ok(())
    });

    write(store, |txn| txn.remove_contact(ALICE));
}

fn unknown_contact<S: Store>(store: &S) {
    let stranger = ContactId(99);
    let err = store
        .transaction_blocking(false, |txn| txn.generate_ack(stranger, 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::NoSuchContact(c) if c == stranger));
    let err = store
        .transaction_blocking(false, |txn| txn.remove_contact(stranger))
        .unwrap_err();
    assert!(matches!(err, StoreError::NoSuchContact(_)));
}
