//! Two live nodes over loopback: sync, offers, payment and unlock.

use std::time::Duration;

use squeaknode_testkit::{wait_until, TestNetwork};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_buy_and_unlock_squeak() {
    init_tracing();
    let network = TestNetwork::new(100);
    let seller = network.spawn_node("seller").await.unwrap();
    let buyer = network.spawn_node("buyer").await.unwrap();

    let alice = seller.create_signing_profile("alice").await.unwrap();
    let hash = seller.make_squeak(alice, "hello", None).await.unwrap();
    let mut payments = seller.subscribe_payments();

    buyer.connect_to(&seller).await.unwrap();
    let result = buyer.download_squeak(hash).await.unwrap();
    assert!(result.is_complete());

    // The buyer holds the squeak but cannot read it yet.
    let stored = buyer.get_squeak(&hash).await.unwrap().unwrap();
    assert_eq!(stored.block_height(), 100);
    assert_eq!(buyer.get_squeak_content(&hash).await.unwrap(), None);

    // The download gathered the seller's offer before returning.
    let offers = buyer.list_received_offers(Some(&hash)).await.unwrap();
    assert_eq!(offers.len(), 1);
    let price = seller.config().node.price_msat;
    assert_eq!(offers[0].price_msat, price);

    let sent = buyer.pay_offer(offers[0].id).await.unwrap();
    assert!(sent.valid);
    assert_eq!(sent.price_msat, price);
    assert_eq!(
        buyer.get_squeak_content(&hash).await.unwrap().as_deref(),
        Some("hello")
    );
    assert!(buyer.pay_offer(offers[0].id).await.is_err());

    let received = tokio::time::timeout(WAIT, payments.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.squeak_hash, hash);
    assert_eq!(received.price_msat, price);
    assert_eq!(seller.total_received().await.unwrap(), price);
    assert_eq!(seller.list_received_payments().await.unwrap().len(), 1);
    assert_eq!(buyer.list_sent_payments().await.unwrap().len(), 1);

    buyer.shutdown().await;
    seller.shutdown().await;
}

#[tokio::test]
async fn test_followed_author_syncs_with_offers() {
    init_tracing();
    let network = TestNetwork::new(100);
    let seller = network.spawn_node("seller").await.unwrap();
    let buyer = network.spawn_node("buyer").await.unwrap();

    let alice = seller.create_signing_profile("alice").await.unwrap();
    let address = seller.get_profile(alice).await.unwrap().unwrap().address;
    let first = seller.make_squeak(alice, "first", None).await.unwrap();

    let contact = buyer.create_contact_profile("alice", address).await.unwrap();
    buyer.set_profile_following(contact, true).await.unwrap();
    buyer.connect_to(&seller).await.unwrap();

    // Greeting the seller pulls the existing squeak and an offer for it.
    let node = &buyer;
    assert!(
        wait_until(WAIT, || async move {
            !node.list_received_offers(Some(&first)).await.unwrap().is_empty()
        })
        .await
    );

    // New squeaks are announced to the subscribed buyer.
    let second = seller.make_squeak(alice, "second", Some(first)).await.unwrap();
    assert!(
        wait_until(WAIT, || async move {
            node.get_squeak(&second).await.unwrap().is_some()
        })
        .await
    );
    let replies = buyer
        .lookup_squeaks(vec![address], None, None, Some(first))
        .await
        .unwrap();
    assert_eq!(replies, vec![second]);

    buyer.shutdown().await;
    seller.shutdown().await;
}

#[tokio::test]
async fn test_not_uploading_peer_is_refused() {
    init_tracing();
    let network = TestNetwork::new(100);
    let seller = network.spawn_node("seller").await.unwrap();
    let buyer = network.spawn_node("buyer").await.unwrap();

    let alice = seller.create_signing_profile("alice").await.unwrap();
    let hash = seller.make_squeak(alice, "members only", None).await.unwrap();

    buyer.connect_to(&seller).await.unwrap();
    // The seller sees the buyer under its inbound address.
    let inbound = seller.connected_peers()[0].address.clone();
    let id = seller.add_peer("buyer", inbound).await.unwrap();
    seller.set_peer_uploading(id, false).await.unwrap();

    let result = buyer.download_squeak(hash).await.unwrap();
    assert!(!result.is_complete());
    assert!(buyer.get_squeak(&hash).await.unwrap().is_none());

    buyer.shutdown().await;
    seller.shutdown().await;
}
