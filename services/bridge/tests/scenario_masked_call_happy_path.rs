//! Scenario: the happy path.
//!
//! Create an order, execute it against an accepting PBX, and observe:
//!
//! 1. Create returns a `pending` order.
//! 2. Execute returns the order at `verified` with its call at `bridged`
//!    (bridging is delegated to the dialplan, so an accepted Originate is
//!    reported optimistically).
//! 3. The event log lists, oldest first: order.created, order.processing,
//!    order.initiated, call.calling_a, call.bridged, order.verified — one
//!    event per persisted write, with order.created covering construction
//!    and the immediate move to pending.
//! 4. Event sequence numbers are strictly increasing.

mod support;

use support::{create_request, stack_against, LoginOutcome, MockAmi, OriginateOutcome};

#[tokio::test]
async fn create_then_execute_reaches_verified_and_bridged() {
    let mock = MockAmi::spawn(LoginOutcome::Accept, OriginateOutcome::Accept).await;
    let stack = stack_against(&mock).await;

    let created = stack
        .orchestrator
        .create_order(&create_request("t1"))
        .await
        .unwrap();
    assert_eq!(created.state, "pending");
    assert!(created.call_id.is_none());

    let executed = stack
        .orchestrator
        .execute_order(created.order_id)
        .await
        .unwrap();
    assert_eq!(executed.state, "verified");
    let call = executed.call.expect("executed order carries its call");
    assert_eq!(call.state, "bridged");
    assert_eq!(call.order_id, created.order_id);
    assert!(call.bridged_at.is_some());

    let events = stack
        .orchestrator
        .order_events(created.order_id)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "order.created",
            "order.processing",
            "order.initiated",
            "call.calling_a",
            "call.bridged",
            "order.verified",
        ]
    );

    let created = events.first().unwrap();
    assert_eq!(created.state.as_deref(), Some("pending"));
    assert_eq!(created.previous_state.as_deref(), Some("created"));

    for window in events.windows(2) {
        assert!(window[0].seq < window[1].seq, "event order must be total");
        assert!(window[0].created_at <= window[1].created_at);
    }

    let verified = events.last().unwrap();
    assert_eq!(verified.state.as_deref(), Some("verified"));
    assert_eq!(verified.previous_state.as_deref(), Some("initiated"));
}

#[tokio::test]
async fn originate_carries_the_dialplan_contract() {
    let mock = MockAmi::spawn(LoginOutcome::Accept, OriginateOutcome::Accept).await;
    let stack = stack_against(&mock).await;

    let created = stack
        .orchestrator
        .create_order(&create_request("t2"))
        .await
        .unwrap();
    stack
        .orchestrator
        .execute_order(created.order_id)
        .await
        .unwrap();

    let originate = mock
        .received()
        .await
        .into_iter()
        .find(|packet| packet.get("Action") == Some("Originate"))
        .expect("originate reached the wire");

    assert_eq!(
        originate.get("Channel"),
        Some("SIP/main-trunk/09140916320")
    );
    assert_eq!(originate.get("Context"), Some("securebridge-control"));
    assert_eq!(originate.get("Exten"), Some("s"));
    assert_eq!(originate.get("Priority"), Some("1"));
    assert_eq!(originate.get("CallerID"), Some("09140916320"));
    assert_eq!(originate.get("Timeout"), Some("30000"));
    assert_eq!(originate.get("Async"), Some("true"));
    assert_eq!(
        originate.get("Variable"),
        Some("ARG1=09140916320|ARG2=09221609805|USER_TOKEN=t2")
    );
    assert!(originate.action_id().is_some());
}
