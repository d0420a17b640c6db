use crate::*;

use burrow_core::wire::{ChatPacket, CHAT_PROTOCOL};
use burrow_services::MessageStatus;

/// Messages queued while offline go out once the link is up.
#[tokio::test]
async fn test_queued_messages_delivered_on_connect() {
    let scratch = Scratch::new("queued");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));

    let first = pair.alice.send_message("first").await.unwrap();
    let second = pair.alice.send_message("second").await.unwrap();
    let statuses: Vec<MessageStatus> =
        pair.alice.messages().await.iter().map(|m| m.status).collect();
    assert_eq!(statuses, vec![MessageStatus::Queued, MessageStatus::Queued]);

    pair.connect();
    wait_until("both acks", || {
        pair.alice_seen.has(&Seen::Acked(first, true))
            && pair.alice_seen.has(&Seen::Acked(second, true))
    })
    .await;

    // delivered oldest first
    let received: Vec<Seen> = pair
        .bob_seen
        .seen()
        .into_iter()
        .filter(|e| matches!(e, Seen::Received(..)))
        .collect();
    assert_eq!(
        received,
        vec![
            Seen::Received(first, "first".into()),
            Seen::Received(second, "second".into())
        ]
    );
    assert_eq!(pair.bob.unread_count().await, 2);
    pair.bob.reset_unread_count().await;
    assert_eq!(pair.bob.unread_count().await, 0);
}

/// Both sides can open their own chat channel on one connection.
#[tokio::test]
async fn test_conversation_in_both_directions() {
    let scratch = Scratch::new("bidi");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));
    pair.connect();

    let ping = pair.alice.send_message("ping").await.unwrap();
    wait_until("ping delivered", || pair.bob_seen.has(&Seen::Received(ping, "ping".into()))).await;
    let pong = pair.bob.send_message("pong").await.unwrap();
    wait_until("pong acked", || pair.bob_seen.has(&Seen::Acked(pong, true))).await;

    assert!(pair.alice_seen.has(&Seen::Received(pong, "pong".into())));
    let alice_view = pair.alice.messages().await;
    assert_eq!(alice_view.len(), 2);
    assert_eq!(alice_view[0].text(), Some("pong"));
    assert_eq!(alice_view[0].status, MessageStatus::Received);
    assert_eq!(alice_view[1].status, MessageStatus::Delivered);
}

/// A message survives a connection drop and is sent again on reconnect.
#[tokio::test]
async fn test_message_requeued_after_disconnect() {
    let scratch = Scratch::new("requeue");
    let alice_seen = Arc::new(Recorder::default());
    let (shutdown, _) = broadcast::channel::<()>(1);
    let alice = PeerTask::spawn(
        PeerId::new(BOB),
        &scratch.config("alice"),
        alice_seen.clone(),
        shutdown.subscribe(),
    );

    let id = alice.send_message("are you there").await.unwrap();
    let mut link = ManualLink::connect(&alice, ConnectionPurpose::KnownContact);
    let channel = link.accept_channel(CHAT_PROTOCOL).await;
    let frame = link.next_frame().await;
    assert_eq!(frame.channel, channel);

    // drop the connection without acknowledging
    alice.disconnected();
    wait_until_async("message requeued", || {
        let alice = alice.clone();
        async move { alice.messages().await[0].status == MessageStatus::Queued }
    })
    .await;

    let mut link = ManualLink::connect(&alice, ConnectionPurpose::KnownContact);
    let channel = link.accept_channel(CHAT_PROTOCOL).await;
    let frame = link.next_frame().await;
    match ChatPacket::from_bytes(&frame.payload).unwrap() {
        ChatPacket::ChatMessage(msg) => {
            assert_eq!(msg.id, id);
            assert_eq!(msg.text, "are you there");
        }
        other => panic!("expected chat message, got {other:?}"),
    }
    link.send(channel, &ChatPacket::ChatAck(burrow_core::wire::ChatAck { id, accepted: true }));
    wait_until("ack", || alice_seen.has(&Seen::Acked(id, true))).await;

    let _ = shutdown.send(());
}

/// Two losses while Sending turn the message into an error; no third try.
#[tokio::test]
async fn test_retry_cap_marks_error() {
    let scratch = Scratch::new("retrycap");
    let (shutdown, _) = broadcast::channel::<()>(1);
    let alice = PeerTask::spawn(
        PeerId::new(BOB),
        &scratch.config("alice"),
        Arc::new(Recorder::default()),
        shutdown.subscribe(),
    );
    alice.send_message("doomed").await.unwrap();

    for attempt in 1..=2u8 {
        let mut link = ManualLink::connect(&alice, ConnectionPurpose::KnownContact);
        link.accept_channel(CHAT_PROTOCOL).await;
        link.next_frame().await;
        let message = alice.messages().await.remove(0);
        assert_eq!(message.status, MessageStatus::Sending);
        assert_eq!(message.attempt_count, attempt);
        alice.disconnected();
    }

    wait_until_async("message failed", || {
        let alice = alice.clone();
        async move { alice.messages().await[0].status == MessageStatus::Error }
    })
    .await;

    // nothing left to send, so no channel is even requested
    let mut link = ManualLink::connect(&alice, ConnectionPurpose::KnownContact);
    assert!(link.is_quiet().await);

    let _ = shutdown.send(());
}

/// A resent message whose ack was lost is acknowledged again but stored once.
#[tokio::test]
async fn test_duplicate_message_stored_once() {
    let scratch = Scratch::new("dedup");
    let bob_seen = Arc::new(Recorder::default());
    let (shutdown, _) = broadcast::channel::<()>(1);
    let bob = PeerTask::spawn(
        PeerId::new(ALICE),
        &scratch.config("bob"),
        bob_seen.clone(),
        shutdown.subscribe(),
    );

    let mut link = ManualLink::connect(&bob, ConnectionPurpose::KnownContact);
    // we play the responder side, so our channel ids are even
    link.send(
        CONTROL_CHANNEL,
        &ControlPacket::OpenChannel(burrow_core::wire::OpenChannel {
            channel_id: 2,
            protocol: CHAT_PROTOCOL.into(),
            direction: Direction::Outbound,
        }),
    );
    match link.next_control().await {
        ControlPacket::ChannelResult(result) => assert!(result.opened),
        other => panic!("unexpected {other:?}"),
    }

    let message = ChatPacket::ChatMessage(burrow_core::wire::ChatMessage {
        text: "once".into(),
        timestamp: 1,
        id: 77,
    });
    for _ in 0..2 {
        link.send(2, &message);
        let frame = link.next_frame().await;
        match ChatPacket::from_bytes(&frame.payload).unwrap() {
            ChatPacket::ChatAck(ack) => {
                assert_eq!(ack.id, 77);
                assert!(ack.accepted);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    assert_eq!(bob.messages().await.len(), 1);
    assert_eq!(
        bob_seen.seen(),
        vec![Seen::Received(77, "once".into())]
    );

    // empty text is refused and never stored
    link.send(
        2,
        &ChatPacket::ChatMessage(burrow_core::wire::ChatMessage {
            text: String::new(),
            timestamp: 2,
            id: 78,
        }),
    );
    let frame = link.next_frame().await;
    assert!(matches!(
        ChatPacket::from_bytes(&frame.payload).unwrap(),
        ChatPacket::ChatAck(burrow_core::wire::ChatAck { id: 78, accepted: false })
    ));
    assert_eq!(bob.messages().await.len(), 1);

    let _ = shutdown.send(());
}
