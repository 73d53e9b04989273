use std::sync::Arc;
use std::time::Duration;

use tidewire_core::transport::subject_matches;
use tidewire_core::{LifecycleEvent, MemoryBus, Message, TidewireError, Transport};
use tokio::sync::mpsc;

fn collector() -> (tidewire_core::MessageHandler, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: tidewire_core::MessageHandler = Arc::new(move |msg: Message| {
        let _ = tx.send(msg);
    });
    (handler, rx)
}

#[test]
fn wildcard_matching() {
    assert!(subject_matches("channel.aaa.test1", "channel.aaa.test1"));
    assert!(subject_matches("channel.*.test1", "channel.aaa.test1"));
    assert!(subject_matches("channel.>", "channel.aaa.test1"));
    assert!(!subject_matches("channel.>", "channel"));
    assert!(!subject_matches("channel.*", "channel.aaa.test1"));
    assert!(!subject_matches("channel.aaa", "channel.aaa.test1"));
}

#[tokio::test]
async fn publish_reaches_matching_subscribers_with_reply() {
    let bus = MemoryBus::new();
    let (exact, mut exact_rx) = collector();
    let (wild, mut wild_rx) = collector();
    bus.subscribe("orders.new", exact).await.unwrap();
    bus.subscribe("orders.*", wild).await.unwrap();

    bus.publish(Message::new("orders.new", b"1".to_vec()).with_reply("inbox.x"))
        .unwrap();

    for rx in [&mut exact_rx, &mut wild_rx] {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "orders.new");
        assert_eq!(msg.reply.as_deref(), Some("inbox.x"));
        assert_eq!(msg.data, b"1");
    }

    let stats = bus.get_stats("orders.new").unwrap();
    assert_eq!(stats.total_published, 1);
    assert_eq!(stats.total_delivered, 2);
}

#[tokio::test]
async fn delivery_order_is_preserved_per_subscription() {
    let bus = MemoryBus::new();
    let (handler, mut rx) = collector();
    bus.subscribe("seq", handler).await.unwrap();
    for i in 0..100u8 {
        bus.publish(Message::new("seq", vec![i])).unwrap();
    }
    for i in 0..100u8 {
        assert_eq!(rx.recv().await.unwrap().data, vec![i]);
    }
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = MemoryBus::new();
    let (handler, mut rx) = collector();
    let handle = bus.subscribe("topic", handler).await.unwrap();
    assert_eq!(handle.subject, "topic");
    assert!(handle.id.starts_with("sub_topic_"));
    assert_eq!(bus.get_stats("topic").unwrap().active_subscriptions, 1);

    bus.unsubscribe(&handle).await.unwrap();
    assert_eq!(bus.get_stats("topic").unwrap().active_subscriptions, 0);
    // Second unsubscribe is harmless
    bus.unsubscribe(&handle).await.unwrap();

    bus.publish(Message::new("topic", b"x".to_vec())).unwrap();
    // The dispatch task ended with the sender
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn group_delivers_to_one_member_each() {
    let bus = MemoryBus::new();
    let (a, mut a_rx) = collector();
    let (b, mut b_rx) = collector();
    let (plain, mut plain_rx) = collector();
    bus.group_subscribe("jobs", "workers", a).await.unwrap();
    bus.group_subscribe("jobs", "workers", b).await.unwrap();
    bus.subscribe("jobs", plain).await.unwrap();

    for i in 0..6u8 {
        bus.publish(Message::new("jobs", vec![i])).unwrap();
    }
    for i in 0..6u8 {
        assert_eq!(plain_rx.recv().await.unwrap().data, vec![i]);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut group_total = 0;
    while a_rx.try_recv().is_ok() {
        group_total += 1;
    }
    while b_rx.try_recv().is_ok() {
        group_total += 1;
    }
    assert_eq!(group_total, 6);
}

#[tokio::test]
async fn close_emits_event_and_refuses_publish() {
    let bus = MemoryBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let listener = bus.lifecycle().subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    bus.connect();
    assert_eq!(rx.recv().await, Some(LifecycleEvent::Connected));

    bus.close(1000, "normal").await.unwrap();
    assert!(bus.is_closed());
    assert_eq!(
        rx.recv().await.map(|e| e.name()),
        Some("close")
    );
    // Closing twice emits nothing new
    bus.close(1000, "again").await.unwrap();
    assert!(rx.try_recv().is_err());

    assert!(matches!(
        bus.publish(Message::new("any", Vec::new())),
        Err(TidewireError::Transport(_))
    ));
    let (handler, _rx) = collector();
    assert!(bus.subscribe("any", handler).await.is_err());
    assert!(bus.lifecycle().unsubscribe(listener));
}
