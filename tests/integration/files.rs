use crate::*;

use burrow_core::wire::FILE_CHUNK_SIZE;
use burrow_services::{MessageKind, MessageStatus};

/// A multi-chunk file arrives intact and both sides hear about it.
#[tokio::test]
async fn test_file_transfer_round_trip() {
    let scratch = Scratch::new("file-roundtrip");
    let bob_config = scratch.config("bob");
    let pair = Pair::spawn(&scratch.config("alice"), &bob_config);

    let data = pattern(FILE_CHUNK_SIZE * 5 + 321);
    let path = scratch.file("holiday.jpg", &data);
    let id = pair.alice.send_file(&path).await.unwrap();
    pair.connect();

    wait_until("file delivered", || {
        pair.alice_seen.has(&Seen::Acked(id, true)) && pair.bob_seen.received_file(id).is_some()
    })
    .await;

    let saved = pair.bob_seen.received_file(id).unwrap();
    assert_eq!(saved, bob_config.transfer.downloads_dir.join("holiday.jpg"));
    assert_eq!(std::fs::read(&saved).unwrap(), data);

    // progress reached the full size on both ends
    let total = data.len() as u64;
    assert!(pair.bob_seen.has(&Seen::Progress(id, Direction::Inbound, total)));
    assert!(pair.alice_seen.has(&Seen::Progress(id, Direction::Outbound, total)));

    // staging is gone
    let leftovers = std::fs::read_dir(&bob_config.transfer.staging_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    let bob_view = pair.bob.messages().await;
    assert_eq!(bob_view[0].kind, MessageKind::File(saved));
    assert_eq!(bob_view[0].status, MessageStatus::Received);
}

/// A transfer cut off by a lost connection completes after reconnecting.
#[tokio::test]
async fn test_file_transfer_survives_reconnect() {
    let scratch = Scratch::new("file-reconnect");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));

    let data = pattern(FILE_CHUNK_SIZE * 400 + 1);
    let path = scratch.file("archive.tar", &data);
    let id = pair.alice.send_file(&path).await.unwrap();
    pair.connect();

    wait_until("some progress", || {
        pair.bob_seen
            .seen()
            .iter()
            .any(|e| matches!(e, Seen::Progress(f, Direction::Inbound, _) if *f == id))
    })
    .await;
    pair.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pair.connect();

    wait_until("file delivered", || pair.alice_seen.has(&Seen::Acked(id, true))).await;
    wait_until("file saved", || pair.bob_seen.received_file(id).is_some()).await;
    let saved = pair.bob_seen.received_file(id).unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), data);

    let received: Vec<Seen> = pair
        .bob_seen
        .seen()
        .into_iter()
        .filter(|e| matches!(e, Seen::FileReceived(..)))
        .collect();
    assert_eq!(received.len(), 1);
}

/// Receiving a second file with the same name never overwrites the first.
#[tokio::test]
async fn test_same_name_gets_new_path() {
    let scratch = Scratch::new("file-names");
    let bob_config = scratch.config("bob");
    let pair = Pair::spawn(&scratch.config("alice"), &bob_config);
    pair.connect();

    let path = scratch.file("notes.txt", b"version one");
    let first = pair.alice.send_file(&path).await.unwrap();
    wait_until("first file", || pair.bob_seen.received_file(first).is_some()).await;

    std::fs::write(&path, b"version two").unwrap();
    let second = pair.alice.send_file(&path).await.unwrap();
    wait_until("second file", || pair.bob_seen.received_file(second).is_some()).await;

    let downloads = &bob_config.transfer.downloads_dir;
    assert_eq!(std::fs::read(downloads.join("notes.txt")).unwrap(), b"version one");
    assert_eq!(std::fs::read(downloads.join("notes (1).txt")).unwrap(), b"version two");
}

/// Files and chat share one connection without getting in each other's way.
#[tokio::test]
async fn test_chat_while_file_in_flight() {
    let scratch = Scratch::new("file-and-chat");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));
    pair.connect();

    let path = scratch.file("big.bin", &pattern(FILE_CHUNK_SIZE * 50));
    let file = pair.alice.send_file(&path).await.unwrap();
    let text = pair.alice.send_message("sent you a file").await.unwrap();

    wait_until("both delivered", || {
        pair.alice_seen.has(&Seen::Acked(file, true)) && pair.alice_seen.has(&Seen::Acked(text, true))
    })
    .await;
    assert!(pair
        .bob_seen
        .has(&Seen::Received(text, "sent you a file".into())));
}

/// An empty file completes on the header exchange alone.
#[tokio::test]
async fn test_empty_file() {
    let scratch = Scratch::new("file-empty");
    let pair = Pair::spawn(&scratch.config("alice"), &scratch.config("bob"));
    pair.connect();

    let path = scratch.file("empty.log", b"");
    let id = pair.alice.send_file(&path).await.unwrap();
    wait_until("delivered", || pair.alice_seen.has(&Seen::Acked(id, true))).await;
    wait_until("saved", || pair.bob_seen.received_file(id).is_some()).await;

    let saved = pair.bob_seen.received_file(id).unwrap();
    assert!(std::fs::read(saved).unwrap().is_empty());
}
