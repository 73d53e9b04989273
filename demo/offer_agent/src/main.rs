use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tidewire_core::{
    telemetry, IncomingRequest, MemoryBus, ReplyHandle, Tidewire, TidewireConfig,
};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Offer {
    sdp: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = TidewireConfig::load();
    telemetry::init_tracing(&cfg.log_filter);

    info!(target: "offer_agent", "Starting offer agent demo");

    let bus = Arc::new(MemoryBus::new());
    let node = Tidewire::new(bus.clone(), cfg.clone());
    bus.connect();

    // 1) Listener side: answer offers, reject everything else
    node.on_request("channel.>", |req: IncomingRequest, reply: ReplyHandle| {
        info!(target: "offer_agent", method = %req.method, data = %req.data, "Handling request");
        let answered = match (req.method.as_str(), req.parse::<Offer>()) {
            ("offer", Ok(offer)) => reply.accept(&Offer {
                sdp: format!("answer-to-{}", offer.sdp),
            }),
            ("offer", Err(e)) => reply.reject(400, &e.to_string()),
            _ => reply.reject(404, "Not found"),
        };
        if let Err(e) = answered {
            warn!(target: "offer_agent", error = %e, "Failed to answer request");
        }
    })
    .await?;

    for listener in 1..=2 {
        node.on_broadcast("even1", move |notification, subject| {
            info!(
                target: "offer_agent",
                listener,
                subject,
                method = %notification.method,
                data = %notification.data,
                "Got broadcast"
            );
        })
        .await?;
    }

    // 2) Client side
    let requestor = Arc::new(node.new_requestor("channel.aaa.test1").await?);
    requestor.on_event(|event| {
        info!(target: "offer_agent", event = event.name(), "Requestor saw lifecycle event");
    });

    requestor
        .async_request("offer", &Offer { sdp: "dummy-sdp1".into() })?
        .then(
            |answer| info!(target: "offer_agent", %answer, "AsyncRequest.then: offer success"),
            |err| warn!(target: "offer_agent", code = err.code, reason = %err.reason, "AsyncRequest.then: offer reject"),
        );

    // Blocking wait belongs on a blocking thread
    let blocking = Arc::clone(&requestor);
    let outcome = tokio::task::spawn_blocking(move || {
        blocking.sync_request("offer", &json!({ "sdp": "dummy-sdp3" }))
    })
    .await?;
    match outcome {
        Ok(answer) => info!(target: "offer_agent", %answer, "SyncRequest: offer success"),
        Err(err) => warn!(target: "offer_agent", code = err.code, reason = %err.reason, "SyncRequest: offer reject"),
    }

    match requestor.async_request("renegotiate", &json!({}))?.await {
        Ok(answer) => info!(target: "offer_agent", %answer, "renegotiate success"),
        Err(err) => warn!(target: "offer_agent", code = err.code, reason = %err.reason, "renegotiate reject"),
    }

    // Nobody listens on this subject: the short timeout fires
    let lonely = node.new_requestor("nobody.home").await?;
    lonely.set_request_timeout(Duration::from_millis(300));
    if let Err(err) = lonely.async_request("offer", &json!({ "sdp": "lost" }))?.await {
        warn!(target: "offer_agent", code = err.code, reason = %err.reason, "Request timed out as expected");
    }

    // 3) Broadcast to both listeners
    let broadcaster = node.new_broadcaster("even1");
    broadcaster.say("hello", &json!({ "key": "value" }))?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(target: "offer_agent", stats = ?requestor.stats(), "Requestor stats");

    requestor.close().await;
    lonely.close().await;
    broadcaster.close();
    node.close(0, "demo finished").await?;

    info!(target: "offer_agent", "Offer agent demo finished");
    Ok(())
}
