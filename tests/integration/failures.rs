use crate::*;

use burrow_core::wire::{
    CommonError, FileHeader, FilePacket, HeaderRejectReason, OpenChannel, CHAT_PROTOCOL,
    FILE_PROTOCOL,
};
use burrow_services::{pump_frames, MessageStatus};

/// A peer that is not a known contact refuses our channels; the message
/// stays queued rather than failing.
#[tokio::test]
async fn test_unauthorized_peer_refuses_channels() {
    let scratch = Scratch::new("unauthorized");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));

    let (to_bob, from_alice) = mpsc::unbounded_channel::<Bytes>();
    let (to_alice, from_bob) = mpsc::unbounded_channel::<Bytes>();
    pair.alice
        .connected(ConnectionPurpose::KnownContact, Role::Initiator, Arc::new(to_bob));
    pair.bob
        .connected(ConnectionPurpose::Unauthenticated, Role::Responder, Arc::new(to_alice));
    tokio::spawn(pump_frames(from_alice, pair.bob.clone()));
    tokio::spawn(pump_frames(from_bob, pair.alice.clone()));

    let id = pair.alice.send_message("let me in").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let message = pair.alice.messages().await.remove(0);
    assert_eq!(message.identifier, id);
    assert_eq!(message.status, MessageStatus::Queued);
    assert!(pair.bob_seen.seen().is_empty());
    assert!(pair.bob.messages().await.is_empty());
}

/// The rejection carries the reason code.
#[tokio::test]
async fn test_unauthorized_rejection_reason() {
    let scratch = Scratch::new("unauthorized-reason");
    let (shutdown, _) = broadcast::channel::<()>(1);
    let bob = PeerTask::spawn(
        PeerId::new(ALICE),
        &scratch.config("bob"),
        Arc::new(Recorder::default()),
        shutdown.subscribe(),
    );
    let mut link = ManualLink::connect(&bob, ConnectionPurpose::Unauthenticated);
    link.send(
        CONTROL_CHANNEL,
        &ControlPacket::OpenChannel(OpenChannel {
            channel_id: 2,
            protocol: CHAT_PROTOCOL.into(),
            direction: Direction::Outbound,
        }),
    );
    match link.next_control().await {
        ControlPacket::ChannelResult(result) => {
            assert!(!result.opened);
            assert_eq!(result.common_error, Some(CommonError::Unauthorized));
        }
        other => panic!("unexpected {other:?}"),
    }
    let _ = shutdown.send(());
}

/// A receiver with a size limit refuses big files; the sender marks the
/// message as failed.
#[tokio::test]
async fn test_oversized_file_refused() {
    let scratch = Scratch::new("oversized");
    let mut bob_config = scratch.config("bob");
    bob_config.transfer.max_file_size = 1000;
    let pair = Pair::spawn(&scratch.config("alice"), &bob_config);
    pair.connect();

    let path = scratch.file("too-big.bin", &pattern(1001));
    let id = pair.alice.send_file(&path).await.unwrap();
    wait_until("refusal", || pair.alice_seen.has(&Seen::Acked(id, false))).await;

    assert_eq!(pair.alice.messages().await[0].status, MessageStatus::Error);
    assert!(!bob_config.transfer.downloads_dir.join("too-big.bin").exists());
}

/// A header without a hash is refused and nothing is staged.
#[tokio::test]
async fn test_header_without_hash_refused() {
    let scratch = Scratch::new("nohash");
    let bob_config = scratch.config("bob");
    let (shutdown, _) = broadcast::channel::<()>(1);
    let bob = PeerTask::spawn(
        PeerId::new(ALICE),
        &bob_config,
        Arc::new(Recorder::default()),
        shutdown.subscribe(),
    );
    let mut link = ManualLink::connect(&bob, ConnectionPurpose::KnownContact);
    link.send(
        CONTROL_CHANNEL,
        &ControlPacket::OpenChannel(OpenChannel {
            channel_id: 2,
            protocol: FILE_PROTOCOL.into(),
            direction: Direction::Outbound,
        }),
    );
    link.next_control().await;

    link.send(
        2,
        &FilePacket::FileHeader(FileHeader {
            file_id: Some(11),
            size: Some(10),
            chunk_count: Some(1),
            content_hash: None,
            name: Some("x".into()),
        }),
    );
    let frame = link.next_frame().await;
    assert_eq!(frame.channel, 2);
    match FilePacket::from_bytes(&frame.payload).unwrap() {
        FilePacket::FileHeaderAck(ack) => {
            assert_eq!(ack.file_id, 11);
            assert!(!ack.accepted);
            assert_eq!(ack.reason, Some(HeaderRejectReason::MissingHash));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!bob_config.transfer.staging_root.exists());
    let _ = shutdown.send(());
}

/// Garbage on the control channel ends the connection.
#[tokio::test]
async fn test_malformed_control_packet_drops_connection() {
    let scratch = Scratch::new("malformed");
    let (shutdown, _) = broadcast::channel::<()>(1);
    let alice = PeerTask::spawn(
        PeerId::new(BOB),
        &scratch.config("alice"),
        Arc::new(Recorder::default()),
        shutdown.subscribe(),
    );
    let _link = ManualLink::connect(&alice, ConnectionPurpose::KnownContact);
    wait_until_async("connected", || {
        let alice = alice.clone();
        async move { alice.is_connected().await }
    })
    .await;

    alice.deliver_frame(Frame::new(CONTROL_CHANNEL, Bytes::from_static(b"not json")));
    wait_until_async("disconnected", || {
        let alice = alice.clone();
        async move { !alice.is_connected().await }
    })
    .await;
    let _ = shutdown.send(());
}

/// A malformed chat payload closes only that channel.
#[tokio::test]
async fn test_malformed_chat_payload_closes_channel() {
    let scratch = Scratch::new("malformed-chat");
    let (shutdown, _) = broadcast::channel::<()>(1);
    let bob = PeerTask::spawn(
        PeerId::new(ALICE),
        &scratch.config("bob"),
        Arc::new(Recorder::default()),
        shutdown.subscribe(),
    );
    let mut link = ManualLink::connect(&bob, ConnectionPurpose::KnownContact);
    link.send(
        CONTROL_CHANNEL,
        &ControlPacket::OpenChannel(OpenChannel {
            channel_id: 2,
            protocol: CHAT_PROTOCOL.into(),
            direction: Direction::Outbound,
        }),
    );
    link.next_control().await;

    bob.deliver_frame(Frame::new(2, Bytes::from_static(b"{\"type\":\"nope\"}")));
    match link.next_control().await {
        ControlPacket::CloseChannel(close) => assert_eq!(close.channel_id, 2),
        other => panic!("unexpected {other:?}"),
    }
    assert!(bob.is_connected().await);
    let _ = shutdown.send(());
}
