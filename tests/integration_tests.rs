//! End-to-end integration tests across the mesh protocol crates.
//!
//! Exercises two [`bitchat_core::Node`]s wired together by
//! [`bitchat_integration_tests::fixtures::two_node::TwoNodeFixture`]: version
//! negotiation, the Noise handshake tie-break, private message delivery
//! tracking, and broadcast chat.

use bitchat_integration_tests::fixtures::two_node::TwoNodeFixture;
use bitchat_core::packet::MessageType;

// ============================================================================
// Link bring-up
// ============================================================================

#[tokio::test]
async fn version_negotiation_settles_on_both_sides() {
    let fixture = TwoNodeFixture::new().await;
    fixture.connect().await;

    assert_eq!(fixture.a_delegate.peers_connected.lock().unwrap().len(), 1);
    assert_eq!(fixture.b_delegate.peers_connected.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn handshake_completes_and_binds_identity_on_both_sides() {
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    let peer_a = fixture.peer_a().await;
    let peer_b = fixture.peer_b().await;
    let fp_a = fixture.a.fingerprint().await;
    let fp_b = fixture.b.fingerprint().await;

    let bound_on_a = fixture.a_delegate.identities_bound.lock().unwrap().clone();
    let bound_on_b = fixture.b_delegate.identities_bound.lock().unwrap().clone();

    assert!(bound_on_a.iter().any(|(peer, fp)| *peer == peer_b && *fp == fp_b));
    assert!(bound_on_b.iter().any(|(peer, fp)| *peer == peer_a && *fp == fp_a));
}

#[tokio::test]
async fn handshake_tie_break_settles_into_exactly_one_session_per_side() {
    // Both sides race to connect simultaneously; the peer-id tie-break in
    // `SessionManager::should_initiate` must pick exactly one initiator so
    // the pair converges on a single session rather than each side starting
    // its own handshake.
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    // Give any would-be duplicate handshake a further moment to misbehave.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(fixture.a_delegate.identities_bound.lock().unwrap().len(), 1);
    assert_eq!(fixture.b_delegate.identities_bound.lock().unwrap().len(), 1);
}

// ============================================================================
// Broadcast chat
// ============================================================================

#[tokio::test]
async fn broadcast_message_is_delivered_with_its_message_id() {
    let fixture = TwoNodeFixture::new().await;
    fixture.connect().await;

    let message_id = fixture.a.send_broadcast(b"hello mesh").await.unwrap();

    fixture
        .wait_for(|| !fixture.b_delegate.messages.lock().unwrap().is_empty())
        .await;

    let received = fixture.b_delegate.messages.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (from, message_type, received_id, content) = &received[0];
    assert_eq!(*from, fixture.peer_a().await);
    assert_eq!(*message_type, MessageType::Message);
    assert_eq!(*received_id, Some(message_id));
    assert_eq!(content, b"hello mesh");
}

// ============================================================================
// Private chat: encryption, delivery ack, read receipt
// ============================================================================

#[tokio::test]
async fn private_message_round_trips_encrypted_and_acked() {
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    let peer_b = fixture.peer_b().await;
    let message_id = fixture.a.send_private(peer_b, b"just between us").await.unwrap();

    fixture
        .wait_for(|| !fixture.b_delegate.messages.lock().unwrap().is_empty())
        .await;
    let received = fixture.b_delegate.messages.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (_, message_type, received_id, content) = &received[0];
    assert_eq!(*message_type, MessageType::NoiseEncrypted);
    assert_eq!(*received_id, Some(message_id));
    assert_eq!(content, b"just between us");

    // b's handle_encrypted answers with a DeliveryAck automatically.
    fixture
        .wait_for(|| !fixture.a_delegate.delivery_acks.lock().unwrap().is_empty())
        .await;
    let acks = fixture.a_delegate.delivery_acks.lock().unwrap().clone();
    assert_eq!(acks[0].original_message_id, message_id);
}

#[tokio::test]
async fn read_receipt_reaches_the_sender() {
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    let peer_a = fixture.peer_a().await;
    let peer_b = fixture.peer_b().await;
    let message_id = fixture.a.send_private(peer_b, b"read me").await.unwrap();

    fixture
        .wait_for(|| !fixture.b_delegate.messages.lock().unwrap().is_empty())
        .await;

    fixture.b.send_read_receipt(peer_a, message_id).await.unwrap();

    fixture
        .wait_for(|| !fixture.a_delegate.read_receipts.lock().unwrap().is_empty())
        .await;
    let receipts = fixture.a_delegate.read_receipts.lock().unwrap().clone();
    assert_eq!(receipts[0], (message_id, peer_b));
}

// ============================================================================
// Fragmentation across the wire
// ============================================================================

#[tokio::test]
async fn oversized_broadcast_is_fragmented_and_reassembled() {
    let fixture = TwoNodeFixture::new().await;
    fixture.connect().await;

    let big_content = vec![0xAB_u8; 2000];
    let message_id = fixture.a.send_broadcast(&big_content).await.unwrap();

    fixture
        .wait_for(|| !fixture.b_delegate.messages.lock().unwrap().is_empty())
        .await;

    let received = fixture.b_delegate.messages.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (_, message_type, received_id, content) = &received[0];
    assert_eq!(*message_type, MessageType::Message);
    assert_eq!(*received_id, Some(message_id));
    assert_eq!(content, &big_content);
}
