use super::*;
use serde_json::json;
use tokio::time::Duration;

use crate::{
    session::SessionQuery,
    state_machine::MachineState,
    test_support::{drain_messages, next_message, settle, Classroom},
};

fn spec(message_type: MessageType, receiver: &str) -> SessionSpec {
    let receiver_id = UserId::new(receiver);
    SessionSpec {
        message_type,
        conflict: SessionQuery::by_type(message_type).receiver(&receiver_id),
        receiver_id,
        flag: None,
    }
}

fn messages(
    core: &ManagerCore,
    message_type: MessageType,
    session_id: &SessionId,
) -> Result<SessionMessages, ProtocolError> {
    Ok(SessionMessages {
        request: core.message(message_type, None, &json!({ "sessionId": session_id }))?,
        on_timeout: Some(core.message(
            MessageType::CancelInteractionInvitation,
            None,
            &json!({ "sessionId": session_id }),
        )?),
    })
}

#[tokio::test(start_paused = true)]
async fn duplicate_session_for_same_key_is_rejected() {
    let classroom = Classroom::dual();
    let (router, _) = classroom.join("teacher").await;
    let core = ManagerCore::new(
        "test manager",
        Role::Teacher,
        router,
        Delivery::Group,
        ManagerOptions::default(),
    );

    let kind = MessageType::InteractionInvitation;
    let (_, machine) = core
        .start_session(spec(kind, "s1"), |id| messages(&core, kind, id))
        .expect("first session");
    assert_eq!(machine.state(), MachineState::Requesting);

    let err = core
        .start_session(spec(kind, "s1"), |id| messages(&core, kind, id))
        .expect_err("second session");
    assert!(matches!(
        err,
        ProtocolError::StateActionMismatch {
            state: Some(MachineState::Requesting),
            ..
        }
    ));

    core.start_session(spec(kind, "s2"), |id| messages(&core, kind, id))
        .expect("other receiver");
    assert_eq!(core.pending_sessions(), 2);
}

#[tokio::test(start_paused = true)]
async fn resolving_twice_reports_an_expired_session() {
    let classroom = Classroom::dual();
    let (router, _) = classroom.join("teacher").await;
    let core = ManagerCore::new(
        "test manager",
        Role::Teacher,
        router,
        Delivery::Group,
        ManagerOptions::default(),
    );

    let kind = MessageType::InteractionInvitation;
    let (session_id, machine) = core
        .start_session(spec(kind, "s1"), |id| messages(&core, kind, id))
        .expect("session");

    core.resolve("test", &session_id, MachineEvent::Responsed, None)
        .expect("resolved");
    assert_eq!(machine.state(), MachineState::Responsed);
    assert!(core.is_expired(&session_id));

    let err = core
        .resolve("test", &session_id, MachineEvent::Responsed, None)
        .expect_err("already resolved");
    assert!(err.is_stale_reply());
    assert_eq!(err.code(), shared::error::ErrorCode::SessionMissed);

    let unknown = core
        .resolve("test", &SessionId::new("1_1"), MachineEvent::Responsed, None)
        .expect_err("never existed");
    assert!(!unknown.is_stale_reply());
}

#[tokio::test(start_paused = true)]
async fn request_is_resent_until_timeout_then_cancel_is_sent() {
    let classroom = Classroom::dual();
    let (router, _) = classroom.join("teacher").await;
    let (peer, _) = classroom.join("s1").await;
    let mut rx = peer.subscribe_events();
    let core = ManagerCore::new(
        "test manager",
        Role::Teacher,
        router,
        Delivery::Group,
        ManagerOptions {
            retry: RetryPolicy {
                interval: Duration::from_millis(100),
                limit: 2,
            },
            ..ManagerOptions::default()
        },
    );

    let kind = MessageType::InteractionInvitation;
    let (session_id, machine) = core
        .start_session(spec(kind, "s1"), |id| messages(&core, kind, id))
        .expect("session");

    next_message(&mut rx, kind).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    settle().await;

    assert_eq!(machine.state(), MachineState::Initial);
    assert_eq!(core.pending_sessions(), 0);
    assert!(core.is_expired(&session_id));
    assert_eq!(
        drain_messages(&mut rx),
        vec![kind, kind, MessageType::CancelInteractionInvitation]
    );
}

#[tokio::test]
async fn role_check_reports_role_and_action() {
    let classroom = Classroom::dual();
    let (router, _) = classroom.join("s1").await;
    let core = ManagerCore::new(
        "test manager",
        Role::Student,
        router,
        Delivery::Group,
        ManagerOptions::default(),
    );

    let err = core
        .check_role(core.role() != Role::Student, "invite")
        .expect_err("students cannot invite");
    assert_eq!(err.code(), shared::error::ErrorCode::RoleActionMismatch);
    assert_eq!(err.to_string(), "role student cannot perform invite");
}
