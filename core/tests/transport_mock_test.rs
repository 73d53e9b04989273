use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use mockall::predicate::function;
use serde_json::json;
use tidewire_core::envelope::decode_request;
use tidewire_core::{
    LifecycleRelay, Message, MessageHandler, Requestor, Result, SubscriptionHandle, TidewireConfig,
    TidewireError, Transport,
};

mock! {
    pub Wire {}

    #[async_trait]
    impl Transport for Wire {
        fn publish(&self, message: Message) -> Result<()>;
        async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<SubscriptionHandle>;
        async fn group_subscribe(
            &self,
            subject: &str,
            group: &str,
            handler: MessageHandler,
        ) -> Result<SubscriptionHandle>;
        async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;
        async fn flush(&self) -> Result<()>;
        async fn close(&self, code: i32, reason: &str) -> Result<()>;
        fn lifecycle(&self) -> Arc<LifecycleRelay>;
    }
}

fn wire_with_reply_subscription() -> MockWire {
    let relay = Arc::new(LifecycleRelay::new());
    let mut wire = MockWire::new();
    wire.expect_subscribe()
        .withf(|subject, _| subject.starts_with("requestor-id-"))
        .times(1)
        .returning(|subject, _| {
            Ok(SubscriptionHandle {
                id: "sub_reply".into(),
                subject: subject.to_string(),
                group: None,
            })
        });
    wire.expect_flush().returning(|| Ok(()));
    wire.expect_lifecycle().returning(move || Arc::clone(&relay));
    wire
}

fn config() -> TidewireConfig {
    TidewireConfig {
        queue_group: None,
        reply_prefix: "requestor-id-".into(),
        ..TidewireConfig::default()
    }
}

#[tokio::test]
async fn request_is_published_with_reply_subject() {
    let mut wire = wire_with_reply_subscription();
    wire.expect_publish()
        .withf(|msg| {
            let Ok(req) = decode_request(&msg.data) else {
                return false;
            };
            msg.subject == "svc.mock"
                && msg.reply.as_deref().is_some_and(|r| r.starts_with("requestor-id-"))
                && req.method == "offer"
                && req.data == json!({"sdp": "x"})
        })
        .times(1)
        .returning(|_| Ok(()));
    // Dropped without close: the reply subscription is released in the background
    wire.expect_unsubscribe().returning(|_| Ok(()));

    let requestor = Requestor::new(Arc::new(wire), "svc.mock", &config()).await.unwrap();
    requestor
        .request("offer", &json!({"sdp": "x"}), |_| {}, |_| {})
        .unwrap();
    assert_eq!(requestor.pending_count(), 1);
    assert_eq!(requestor.stats().sent, 1);
}

#[tokio::test]
async fn encoding_failure_never_publishes() {
    let mut wire = wire_with_reply_subscription();
    wire.expect_publish().times(0);
    wire.expect_unsubscribe().returning(|_| Ok(()));

    let requestor = Requestor::new(Arc::new(wire), "svc.mock", &config()).await.unwrap();
    let mut payload = HashMap::new();
    payload.insert((0, 0), 1);
    assert!(matches!(
        requestor.request("offer", &payload, |_| {}, |_| {}),
        Err(TidewireError::Encoding(_))
    ));
    assert_eq!(requestor.pending_count(), 0);
}

#[tokio::test]
async fn publish_failure_withdraws_transaction() {
    let mut wire = wire_with_reply_subscription();
    wire.expect_publish()
        .times(1)
        .returning(|_| Err(TidewireError::Transport("link down".into())));
    wire.expect_unsubscribe().returning(|_| Ok(()));

    let requestor = Requestor::new(Arc::new(wire), "svc.mock", &config()).await.unwrap();
    let result = requestor.request(
        "offer",
        &json!(1),
        |_| panic!("no callback on local failure"),
        |_| panic!("no callback on local failure"),
    );
    assert!(matches!(result, Err(TidewireError::Transport(_))));
    assert_eq!(requestor.pending_count(), 0);
    assert_eq!(requestor.stats().sent, 0);
}

#[tokio::test]
async fn close_unsubscribes_reply_subject_once() {
    let mut wire = wire_with_reply_subscription();
    wire.expect_unsubscribe()
        .with(function(|h: &SubscriptionHandle| h.id == "sub_reply"))
        .times(1)
        .returning(|_| Ok(()));

    let requestor = Requestor::new(Arc::new(wire), "svc.mock", &config()).await.unwrap();
    requestor.close().await;
    requestor.close().await;
    assert!(requestor.is_closed());
}

#[tokio::test]
async fn failed_flush_releases_reply_subscription() {
    let mut wire = MockWire::new();
    wire.expect_subscribe().times(1).returning(|subject, _| {
        Ok(SubscriptionHandle {
            id: "sub_reply".into(),
            subject: subject.to_string(),
            group: None,
        })
    });
    wire.expect_flush()
        .times(1)
        .returning(|| Err(TidewireError::Transport("flush timed out".into())));
    wire.expect_unsubscribe()
        .with(function(|h: &SubscriptionHandle| h.id == "sub_reply"))
        .times(1)
        .returning(|_| Ok(()));
    wire.expect_lifecycle().times(0);

    let result = Requestor::new(Arc::new(wire), "svc.mock", &config()).await;
    assert!(matches!(result, Err(TidewireError::Transport(_))));
}
