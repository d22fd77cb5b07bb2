//! Advanced node-to-node scenarios: favorite store-and-forward while a peer
//! is offline, and rejection of a tampered identity announcement.

use bitchat_integration_tests::fixtures::two_node::TwoNodeFixture;

#[tokio::test]
async fn favorite_message_sent_while_offline_is_flushed_on_reconnect() {
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    let peer_b = fixture.peer_b().await;
    let fp_b = fixture.b.fingerprint().await;
    fixture.a_delegate.favorites.lock().unwrap().push(fp_b);

    // Drop the simulated radio link; the session binding (keyed on
    // long-term fingerprint, not the transient peer-id) survives it.
    fixture.disconnect().await;

    let message_id = fixture
        .a
        .send_private(peer_b, b"waiting for you to come back")
        .await
        .unwrap();

    // While offline, the message must not have reached b yet.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(fixture.b_delegate.messages.lock().unwrap().is_empty());

    // Reconnect: handle_peer_connected on an already-bound fingerprint
    // flushes the store-and-forward queue straight away.
    fixture.reconnect().await;

    fixture
        .wait_for(|| !fixture.b_delegate.messages.lock().unwrap().is_empty())
        .await;
    let received = fixture.b_delegate.messages.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (_, _, received_id, content) = &received[0];
    assert_eq!(*received_id, Some(message_id));
    assert_eq!(content, b"waiting for you to come back");
}

#[tokio::test]
async fn non_favorite_message_sent_while_offline_is_dropped_not_queued() {
    let fixture = TwoNodeFixture::new().await;
    fixture.establish_session().await;

    let peer_b = fixture.peer_b().await;
    fixture.disconnect().await;

    // b is not a favorite of a, so the private send falls back to the
    // bounded retry queue instead of the unbounded-by-fingerprint
    // store-and-forward cache; reconnecting alone won't flush it (the
    // retry queue is drained by the periodic sweep, not by reconnection).
    let result = fixture.a.send_private(peer_b, b"not a favorite").await;
    assert!(result.is_ok());

    fixture.reconnect().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(fixture.b_delegate.messages.lock().unwrap().is_empty());
}
