use super::*;
use serde_json::Value;
use tokio::time::{timeout, Duration};

fn credentials() -> TransportCredentials {
    TransportCredentials {
        token: "token".into(),
    }
}

async fn connect(
    hub: &Arc<MemoryHub>,
    user: &str,
    group: &GroupId,
) -> (Arc<MemoryTransport>, broadcast::Receiver<NormalizedEvent>) {
    let transport = MemoryTransport::new(Arc::clone(hub));
    transport.set_credentials(credentials());
    let rx = transport.subscribe_events();
    transport.init().await.expect("init");
    transport
        .login(&UserInfo::new(user, user))
        .await
        .expect("login");
    transport.join_group(group).await.expect("join");
    (transport, rx)
}

async fn next_of_type(
    rx: &mut broadcast::Receiver<NormalizedEvent>,
    message_type: MessageType,
) -> NormalizedEvent {
    timeout(Duration::from_secs(1), async {
        loop {
            let event = rx.recv().await.expect("event");
            if event.message_type == message_type {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn login_requires_credentials() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let transport = MemoryTransport::new(hub);
    let err = transport
        .login(&UserInfo::new("u1", "u1"))
        .await
        .expect_err("login without token");
    assert!(err.to_string().contains("set config"));
}

#[tokio::test]
async fn group_message_reaches_peers_but_not_sender() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    hub.create_group(&group, &UserId::new("teacher"));
    let (teacher, mut teacher_rx) = connect(&hub, "teacher", &group).await;
    let (_student, mut student_rx) = connect(&hub, "student", &group).await;

    let message = OutboundMessage::new(MessageType::Comment)
        .with_payload(&serde_json::json!({ "content": "hi" }))
        .expect("payload");
    teacher
        .send_message_to_group(&message)
        .await
        .expect("send");

    let event = next_of_type(&mut student_rx, MessageType::Comment).await;
    assert_eq!(event.data["content"], Value::from("hi"));
    assert_eq!(event.sender_id, Some(UserId::new("teacher")));
    assert!(event.message_id.is_some());

    while let Ok(event) = teacher_rx.try_recv() {
        assert_ne!(event.message_type, MessageType::Comment);
    }
}

#[tokio::test]
async fn direct_message_requires_receiver() {
    let hub = MemoryHub::new(TransportKind::RongCloud);
    let group = GroupId::new("g1");
    let (transport, _rx) = connect(&hub, "assistant", &group).await;

    let err = transport
        .send_message_to_group_user(&OutboundMessage::signal(MessageType::RequestMuteUser))
        .await
        .expect_err("missing receiver");
    assert!(err.to_string().contains("receiverId"));
}

#[tokio::test]
async fn direct_message_only_reaches_receiver() {
    let hub = MemoryHub::new(TransportKind::AliyunImV1);
    let group = GroupId::new("g1");
    hub.create_group(&group, &UserId::new("teacher"));
    let (_teacher, mut teacher_rx) = connect(&hub, "teacher", &group).await;
    let (assistant, _assistant_rx) = connect(&hub, "assistant", &group).await;
    let (_student, mut student_rx) = connect(&hub, "student", &group).await;

    let message = OutboundMessage::signal(MessageType::RequestMuteGroup).to(UserId::new("teacher"));
    assistant
        .send_message_to_group_user(&message)
        .await
        .expect("send");

    next_of_type(&mut teacher_rx, MessageType::RequestMuteGroup).await;
    while let Ok(event) = student_rx.try_recv() {
        assert_ne!(event.message_type, MessageType::RequestMuteGroup);
    }
}

#[tokio::test]
async fn only_owner_can_mute() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    hub.create_group(&group, &UserId::new("teacher"));
    let (_teacher, _teacher_rx) = connect(&hub, "teacher", &group).await;
    let (assistant, _assistant_rx) = connect(&hub, "assistant", &group).await;

    let err = assistant.mute_group().await.expect_err("assistant mute");
    assert!(err.to_string().contains("not allowed"));
    assert_eq!(hub.mute_status(&group).map(|s| s.mute_all), Some(false));
}

#[tokio::test]
async fn muting_a_user_notifies_target_and_group() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    hub.create_group(&group, &UserId::new("teacher"));
    let (teacher, _teacher_rx) = connect(&hub, "teacher", &group).await;
    let (student, mut student_rx) = connect(&hub, "student", &group).await;

    teacher
        .mute_user(&UserId::new("student"))
        .await
        .expect("mute user");

    next_of_type(&mut student_rx, MessageType::PaaSMuteUser).await;
    let list = next_of_type(&mut student_rx, MessageType::PaaSMuteUserListChange).await;
    assert_eq!(list.data["muteUserList"], serde_json::json!(["student"]));

    let err = student
        .send_message_to_group(&OutboundMessage::new(MessageType::Comment))
        .await
        .expect_err("muted sender");
    assert!(err.to_string().contains("muted"));

    student
        .send_message_to_group(&OutboundMessage::signal(MessageType::Comment))
        .await
        .expect("signals skip the mute check");

    assert_eq!(
        student.query_muted_users().await.expect("query"),
        vec![UserId::new("student")]
    );
}

#[tokio::test]
async fn group_mute_carries_status() {
    let hub = MemoryHub::new(TransportKind::RongCloud);
    let group = GroupId::new("g1");
    hub.create_group(&group, &UserId::new("teacher"));
    let (teacher, _teacher_rx) = connect(&hub, "teacher", &group).await;
    let (_student, mut student_rx) = connect(&hub, "student", &group).await;

    teacher.mute_group().await.expect("mute");
    let event = next_of_type(&mut student_rx, MessageType::PaaSMuteGroup).await;
    assert_eq!(event.data["status"]["muteAll"], Value::from(true));

    teacher.cancel_mute_group().await.expect("unmute");
    next_of_type(&mut student_rx, MessageType::PaaSCancelMuteGroup).await;
}

#[tokio::test]
async fn native_mute_capability_gates_mute_calls() {
    let hub = MemoryHub::new(TransportKind::AliyunImV1);
    let group = GroupId::new("g1");
    let transport = MemoryTransport::with_capabilities(
        Arc::clone(&hub),
        TransportCapabilities {
            native_mute: false,
            message_history: true,
        },
    );
    transport.set_credentials(credentials());
    transport
        .login(&UserInfo::new("teacher", "teacher"))
        .await
        .expect("login");
    transport.join_group(&group).await.expect("join");

    let err = transport.mute_group().await.expect_err("unsupported");
    assert!(err.to_string().contains("not supported"));
}

#[tokio::test]
async fn no_storage_messages_are_not_kept_in_history() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    let (transport, _rx) = connect(&hub, "teacher", &group).await;

    transport
        .send_message_to_group(&OutboundMessage::new(MessageType::NoticeUpdate))
        .await
        .expect("stored");
    transport
        .send_message_to_group(&OutboundMessage::signal(MessageType::NoticeUpdate))
        .await
        .expect("not stored");

    let history = transport
        .list_messages(MessageType::NoticeUpdate)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn injected_failures_reject_sends() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    let (transport, _rx) = connect(&hub, "teacher", &group).await;

    transport.set_fail_sends(true);
    assert!(transport
        .send_message_to_group(&OutboundMessage::new(MessageType::Comment))
        .await
        .is_err());

    transport.set_fail_sends(false);
    transport.set_fail_identity(true);
    assert!(transport.logout().await.is_err());
}

#[tokio::test]
async fn leave_notifies_remaining_members() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new("g1");
    let (_teacher, mut teacher_rx) = connect(&hub, "teacher", &group).await;
    let (student, _student_rx) = connect(&hub, "student", &group).await;

    next_of_type(&mut teacher_rx, MessageType::PaaSUserJoin).await;
    student.leave_group().await.expect("leave");
    let event = next_of_type(&mut teacher_rx, MessageType::PaaSUserLeave).await;
    assert_eq!(event.sender_id, Some(UserId::new("student")));
    assert_eq!(student.joined_group(), None);
    assert_eq!(hub.members(&group), vec![UserId::new("teacher")]);
}
