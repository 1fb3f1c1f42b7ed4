//! Scenario: the AMI secret crosses the wire byte-identical to storage.
//!
//! The configured secret deliberately carries leading and trailing spaces;
//! such secrets are known to authenticate only when sent verbatim. The PBX
//! double parses the login frame the way Asterisk does (strip exactly one
//! space after the colon) and must read back the exact bytes.

mod support;

use support::{
    create_request, stack_against, LoginOutcome, MockAmi, OriginateOutcome, TEST_SECRET,
    TEST_USERNAME,
};

#[tokio::test]
async fn login_secret_is_not_trimmed_or_transcoded() {
    let mock = MockAmi::spawn(LoginOutcome::Accept, OriginateOutcome::Accept).await;
    let stack = stack_against(&mock).await;

    let created = stack
        .orchestrator
        .create_order(&create_request("t1"))
        .await
        .unwrap();
    stack
        .orchestrator
        .execute_order(created.order_id)
        .await
        .unwrap();

    let login = mock
        .received()
        .await
        .into_iter()
        .find(|packet| packet.get("Action") == Some("Login"))
        .expect("login reached the wire");

    assert_eq!(login.get("Username"), Some(TEST_USERNAME));
    assert_eq!(login.get("Secret"), Some(TEST_SECRET));
}
