//! Scenario: the AMI socket dies between executes.
//!
//! 1. The first execute succeeds over the initial session.
//! 2. The PBX drops the connection.
//! 3. The next execute re-establishes the session transparently: a second
//!    login reaches the PBX and the order completes its happy path.

mod support;

use std::time::Duration;

use support::{create_request, stack_against, LoginOutcome, MockAmi, OriginateOutcome};

#[tokio::test]
async fn next_execute_reestablishes_the_session() {
    let mock = MockAmi::spawn(LoginOutcome::Accept, OriginateOutcome::Accept).await;
    let stack = stack_against(&mock).await;

    let first = stack
        .orchestrator
        .create_order(&create_request("t1"))
        .await
        .unwrap();
    let executed = stack.orchestrator.execute_order(first.order_id).await.unwrap();
    assert_eq!(executed.state, "verified");

    mock.kill_connection().await;
    // Give the client's reader a moment to observe the EOF.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = stack.ami.current().await;
    assert!(session.is_none(), "dead session must not be reused");

    let second = stack
        .orchestrator
        .create_order(&create_request("t2"))
        .await
        .unwrap();
    let executed = stack
        .orchestrator
        .execute_order(second.order_id)
        .await
        .unwrap();
    assert_eq!(executed.state, "verified");

    let logins = mock
        .received_actions()
        .await
        .into_iter()
        .filter(|action| action == "Login")
        .count();
    assert_eq!(logins, 2, "one login per session");
}
