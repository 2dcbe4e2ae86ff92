mod common;

use serde_json::json;

use common::{Harness, NAMESPACE};
use direktiv_core::instance::{CloudEvent, InstanceStatus};
use direktiv_engine::InstanceStore;

fn order_event(event_type: &str, order: &str) -> CloudEvent {
    let mut event = CloudEvent::new(event_type, "shop", json!({"total": 12}));
    event.extensions.insert("orderid".into(), json!(order));
    event
}

#[tokio::test]
async fn test_consume_event_matches_context() {
    let h = Harness::new().await;
    h.deploy(
        "/wait.yaml",
        r#"
states:
  - id: wait
    type: consumeEvent
    event:
      type: order.paid
      context:
        orderid: "{{ order }}"
    transition: done
  - id: done
    type: noop
    transform:
      total: "{{ data['order.paid'].data.total }}"
"#,
    )
    .await;
    let id = h.start("/wait.yaml", json!({"order": "o-7"})).await;
    h.wait_for_listener(id).await;

    let delivered = h
        .engine
        .broadcast_event(NAMESPACE, order_event("order.paid", "o-1"))
        .await
        .unwrap();
    assert_eq!(delivered, 0);

    let delivered = h
        .engine
        .broadcast_event(NAMESPACE, order_event("order.paid", "o-7"))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let instance = h.finish(id).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output, Some(json!({"total": 12})));
    assert!(h
        .store()
        .list_event_listeners(NAMESPACE)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_events_and_waits_for_every_event() {
    let h = Harness::new().await;
    h.deploy(
        "/both.yaml",
        r#"
states:
  - id: wait
    type: eventsAnd
    events:
      - type: order.paid
      - type: order.packed
"#,
    )
    .await;
    let id = h.start("/both.yaml", json!({})).await;
    h.wait_for_listener(id).await;

    h.engine
        .broadcast_event(NAMESPACE, order_event("order.packed", "o-1"))
        .await
        .unwrap();
    h.wait_for_listener(id).await;
    let pending = h.store().get_instance(id).await.unwrap().unwrap();
    assert_eq!(pending.status, InstanceStatus::Pending);

    h.engine
        .broadcast_event(NAMESPACE, order_event("order.paid", "o-1"))
        .await
        .unwrap();
    let instance = h.finish(id).await;
    let output = instance.output.unwrap();
    assert!(output.get("order.paid").is_some());
    assert!(output.get("order.packed").is_some());
}

#[tokio::test]
async fn test_events_xor_takes_matching_branch() {
    let h = Harness::new().await;
    h.deploy(
        "/either.yaml",
        r#"
states:
  - id: wait
    type: eventsXor
    events:
      - event:
          type: order.approved
        transition: ship
      - event:
          type: order.rejected
        transition: refund
  - id: ship
    type: noop
    transform:
      outcome: shipped
  - id: refund
    type: noop
    transform:
      outcome: refunded
"#,
    )
    .await;
    let id = h.start("/either.yaml", json!({})).await;
    h.wait_for_listener(id).await;

    h.engine
        .broadcast_event(NAMESPACE, order_event("order.rejected", "o-1"))
        .await
        .unwrap();
    let instance = h.finish(id).await;
    assert_eq!(instance.output, Some(json!({"outcome": "refunded"})));
}

#[tokio::test]
async fn test_generated_event_wakes_listener() {
    let h = Harness::new().await;
    h.deploy(
        "/listen.yaml",
        r#"
states:
  - id: wait
    type: consumeEvent
    event:
      type: greeting
"#,
    )
    .await;
    h.deploy(
        "/emit.yaml",
        r#"
states:
  - id: emit
    type: generateEvent
    event:
      type: greeting
      source: emitter
      data:
        text: "hello {{ name }}"
"#,
    )
    .await;

    let listener = h.start("/listen.yaml", json!({})).await;
    h.wait_for_listener(listener).await;

    let emitter = h.run("/emit.yaml", json!({"name": "there"})).await;
    assert_eq!(emitter.status, InstanceStatus::Complete);

    let instance = h.finish(listener).await;
    let output = instance.output.unwrap();
    assert_eq!(output["greeting"]["data"], json!({"text": "hello there"}));
    assert_eq!(output["greeting"]["source"], json!("emitter"));
}

#[tokio::test]
async fn test_delayed_event_is_sent_later() {
    let h = Harness::new().await;
    h.deploy(
        "/listen.yaml",
        r#"
states:
  - id: wait
    type: consumeEvent
    event:
      type: reminder
"#,
    )
    .await;
    h.deploy(
        "/remind.yaml",
        r#"
states:
  - id: emit
    type: generateEvent
    delay: PT0.2S
    event:
      type: reminder
      source: scheduler
"#,
    )
    .await;

    let listener = h.start("/listen.yaml", json!({})).await;
    h.wait_for_listener(listener).await;

    h.run("/remind.yaml", json!({})).await;
    let waiting = h.store().get_instance(listener).await.unwrap().unwrap();
    assert_eq!(waiting.status, InstanceStatus::Pending);

    let instance = h.finish(listener).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
}
