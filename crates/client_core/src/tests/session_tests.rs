use super::*;
use crate::state_machine::RetryPolicy;

fn session(id: &str, receiver: &str, message_type: MessageType, flag: Option<&str>) -> Session {
    Session {
        session_id: SessionId::new(id),
        receiver_id: UserId::new(receiver),
        message_type,
        machine: StateMachine::new(RetryPolicy::default()),
        flag: flag.map(str::to_string),
    }
}

#[test]
fn query_matches_only_set_fields() {
    let mut registry = SessionRegistry::new(16);
    registry.insert(session("1_400001", "teacher", MessageType::RequestMuteUser, Some("u1")));
    registry.insert(session("2_400003", "teacher", MessageType::RequestMuteGroup, None));

    let by_flag = SessionQuery::by_type(MessageType::RequestMuteUser)
        .receiver(&UserId::new("teacher"))
        .flag("u1");
    assert_eq!(
        registry.find(&by_flag).map(|s| s.session_id.as_str()),
        Some("1_400001")
    );

    let other_user = SessionQuery::by_type(MessageType::RequestMuteUser).flag("u2");
    assert!(registry.find(&other_user).is_none());

    let group = SessionQuery::by_type(MessageType::RequestMuteGroup);
    assert!(registry.find(&group).is_some());
}

#[test]
fn removing_a_session_expires_its_id() {
    let mut registry = SessionRegistry::new(16);
    registry.insert(session("1_30001", "s1", MessageType::InteractionInvitation, None));

    let id = SessionId::new("1_30001");
    assert!(registry.remove(&id).is_some());
    assert!(registry.is_expired(&id));
    assert!(registry.is_empty());
    assert!(registry.remove(&id).is_none());
}

#[test]
fn generated_ids_are_unique_and_typed() {
    let ids = SessionIdGenerator::new();
    let first = ids.next(MessageType::RequestMuteUser);
    let second = ids.next(MessageType::RequestMuteUser);

    assert_ne!(first, second);
    assert!(first.as_str().ends_with("_400001"));
    let millis: i64 = first
        .as_str()
        .split('_')
        .next()
        .and_then(|ms| ms.parse().ok())
        .expect("epoch ms prefix");
    assert!(millis > 0);
}
