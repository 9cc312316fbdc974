use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use messaging_transport::{
    memory::{MemoryHub, MemoryTransport},
    TransportCapabilities,
};
use serde_json::json;
use tokio::time::Duration;

use crate::test_support::{next_kind, Classroom, GROUP};

fn drain_kinds(rx: &mut broadcast::Receiver<RouterEvent>) -> Vec<RouterEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

fn system_event(message_type: MessageType, data: serde_json::Value) -> NormalizedEvent {
    NormalizedEvent::system(message_type, GroupId::new(GROUP), "system", data)
}

#[tokio::test]
async fn events_sharing_a_sid_reach_listeners_once() {
    let router = MessageRouter::new(Vec::new(), RouterOptions::default());
    let mut rx = router.subscribe_events();

    let event = system_event(MessageType::Comment, json!({ "sid": "abc", "content": "hi" }));
    for _ in 0..5 {
        router.handle_inbound(event.clone());
    }

    assert_eq!(drain_kinds(&mut rx), vec![RouterEventKind::MessageReceived]);
}

#[tokio::test]
async fn message_sent_over_two_backends_is_delivered_once() {
    let classroom = Classroom::dual();
    let (teacher, _) = classroom.join("teacher").await;
    let (student, _) = classroom.join("student").await;
    let mut rx = student.subscribe_events();

    let receipt = teacher
        .send_message_to_group(
            OutboundMessage::new(MessageType::Comment)
                .with_payload(&json!({ "content": "hello" }))
                .expect("payload"),
        )
        .await
        .expect("send");
    assert_eq!(receipt.report.succeeded().count(), 2);

    let event = next_kind(&mut rx, RouterEventKind::MessageReceived).await;
    assert_eq!(event.event.sid(), Some(receipt.sid.as_str()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain_kinds(&mut rx).contains(&RouterEventKind::MessageReceived));
}

#[tokio::test]
async fn send_resolves_if_one_backend_succeeds_and_rejects_if_both_fail() {
    let classroom = Classroom::dual();
    let (teacher, transports) = classroom.join("teacher").await;

    transports[0].set_fail_sends(true);
    let receipt = teacher
        .send_message_to_group(OutboundMessage::new(MessageType::Comment))
        .await
        .expect("one backend is enough");
    assert_eq!(
        receipt.report.succeeded().collect::<Vec<_>>(),
        vec![TransportKind::RongCloud]
    );

    transports[1].set_fail_sends(true);
    let err = teacher
        .send_message_to_group(OutboundMessage::new(MessageType::Comment))
        .await
        .expect_err("both backends failed");
    assert!(matches!(err, RouterError::Fanout(_)));
}

#[tokio::test]
async fn login_requires_config_and_all_backends() {
    let hub_a = MemoryHub::new(TransportKind::AliyunImV1);
    let hub_b = MemoryHub::new(TransportKind::AliyunImV2);
    let failing = MemoryTransport::new(hub_b);
    failing.set_fail_identity(true);
    let router = MessageRouter::new(
        vec![
            TransportBinding::new(MemoryTransport::new(hub_a)),
            TransportBinding::new(failing),
        ],
        RouterOptions::default(),
    );

    let user = UserInfo::new("teacher", "teacher");
    assert!(matches!(
        router.login(&user).await,
        Err(RouterError::MissingConfig)
    ));

    router.set_config(RouterConfig {
        token: "token".into(),
    });
    assert!(matches!(router.login(&user).await, Err(RouterError::Fanout(_))));
    assert!(router.local_user().is_none());
}

#[tokio::test]
async fn direct_send_requires_receiver() {
    let router = MessageRouter::new(
        vec![TransportBinding::new(MemoryTransport::new(MemoryHub::new(
            TransportKind::RongCloud,
        )))],
        RouterOptions::default(),
    );
    let err = router
        .send_message_to_group_user(OutboundMessage::signal(MessageType::RequestMuteUser))
        .await
        .expect_err("receiver missing");
    assert!(matches!(err, RouterError::Validation(_)));
}

#[tokio::test]
async fn group_mute_notifications_are_edge_detected() {
    let router = MessageRouter::new(Vec::new(), RouterOptions::default());
    let mut rx = router.subscribe_events();

    for _ in 0..3 {
        router.handle_inbound(system_event(MessageType::PaaSMuteGroup, json!({})));
    }
    assert_eq!(drain_kinds(&mut rx), vec![RouterEventKind::MuteGroup]);

    router.handle_inbound(system_event(MessageType::PaaSCancelMuteGroup, json!({})));
    router.handle_inbound(system_event(MessageType::PaaSCancelMuteGroup, json!({})));
    assert_eq!(drain_kinds(&mut rx), vec![RouterEventKind::UnmuteGroup]);
}

#[tokio::test]
async fn first_notification_fires_even_when_it_is_an_unmute() {
    let router = MessageRouter::new(Vec::new(), RouterOptions::default());
    let mut rx = router.subscribe_events();

    router.handle_inbound(system_event(MessageType::PaaSCancelMuteGroup, json!({})));
    router.handle_inbound(system_event(
        MessageType::PaaSCancelMuteUser,
        json!({ "userId": "s1" }),
    ));
    assert_eq!(
        drain_kinds(&mut rx),
        vec![RouterEventKind::UnmuteGroup, RouterEventKind::UnmuteUser]
    );
}

#[tokio::test]
async fn joining_a_muted_room_starts_from_the_backend_state() {
    let classroom = Classroom::dual();
    let (teacher, _) = classroom.join("teacher").await;
    teacher.mute_group().await.expect("mute group");
    teacher
        .mute_user(&UserId::new("student"))
        .await
        .expect("mute user");

    let (student, _) = classroom.join("student").await;
    let mut rx = student.subscribe_events();
    student.handle_inbound(system_event(MessageType::PaaSMuteGroup, json!({})));
    student.handle_inbound(system_event(
        MessageType::PaaSMuteUser,
        json!({ "userId": "student" }),
    ));
    assert!(drain_kinds(&mut rx).is_empty());

    teacher.cancel_mute_group().await.expect("unmute group");
    next_kind(&mut rx, RouterEventKind::UnmuteGroup).await;
    teacher
        .cancel_mute_user(&UserId::new("student"))
        .await
        .expect("unmute user");
    next_kind(&mut rx, RouterEventKind::UnmuteUser).await;
}

#[tokio::test]
async fn joining_an_open_room_ignores_a_redundant_unmute() {
    let classroom = Classroom::dual();
    let (student, _) = classroom.join("student").await;
    let mut rx = student.subscribe_events();

    student.handle_inbound(system_event(MessageType::PaaSCancelMuteGroup, json!({})));
    assert!(drain_kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn mute_list_changes_compare_without_order() {
    let router = MessageRouter::new(Vec::new(), RouterOptions::default());
    let mut rx = router.subscribe_events();

    router.handle_inbound(system_event(
        MessageType::PaaSMuteUserListChange,
        json!({ "muteUserList": ["a", "b"] }),
    ));
    router.handle_inbound(system_event(
        MessageType::PaaSMuteUserListChange,
        json!({ "muteUserList": ["b", "a"] }),
    ));
    assert_eq!(drain_kinds(&mut rx), vec![RouterEventKind::MuteUserListChange]);

    router.handle_inbound(system_event(
        MessageType::PaaSMuteUserListChange,
        json!({ "muteUserList": ["a"] }),
    ));
    assert_eq!(drain_kinds(&mut rx), vec![RouterEventKind::MuteUserListChange]);
}

#[tokio::test]
async fn muting_through_the_router_reaches_the_target_once() {
    let classroom = Classroom::dual();
    let (teacher, _) = classroom.join("teacher").await;
    let (student, _) = classroom.join("student").await;
    let mut rx = student.subscribe_events();

    teacher
        .mute_user(&UserId::new("student"))
        .await
        .expect("mute user");

    next_kind(&mut rx, RouterEventKind::MuteUser).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain_kinds(&mut rx).contains(&RouterEventKind::MuteUser));
    assert_eq!(
        student.query_muted_user_list().await.expect("query"),
        vec![UserId::new("student")]
    );
}

#[tokio::test]
async fn mute_succeeds_when_legacy_backend_lacks_native_mute() {
    let legacy = MemoryHub::new(TransportKind::AliyunImV1);
    let modern = MemoryHub::new(TransportKind::AliyunImV2);
    let group = GroupId::new(GROUP);
    legacy.create_group(&group, &UserId::new("teacher"));
    modern.create_group(&group, &UserId::new("teacher"));

    let router = MessageRouter::new(
        vec![
            TransportBinding::new(MemoryTransport::with_capabilities(
                legacy,
                TransportCapabilities {
                    native_mute: false,
                    message_history: false,
                },
            )),
            TransportBinding::new(MemoryTransport::new(Arc::clone(&modern))),
        ],
        RouterOptions::default(),
    );
    router.set_config(RouterConfig {
        token: "token".into(),
    });
    router
        .login(&UserInfo::new("teacher", "teacher"))
        .await
        .expect("login");
    router
        .join_group(&GroupIdSet::uniform(GROUP))
        .await
        .expect("join");

    let report = router.mute_group().await.expect("any backend");
    assert_eq!(report.failures().count(), 1);
    assert_eq!(modern.mute_status(&group).map(|s| s.mute_all), Some(true));
}

#[tokio::test]
async fn primary_is_explicit_or_first_and_reelected_on_removal() {
    let first = MemoryTransport::new(MemoryHub::new(TransportKind::AliyunImV1));
    let second = MemoryTransport::new(MemoryHub::new(TransportKind::AliyunImV2));
    let third = MemoryTransport::new(MemoryHub::new(TransportKind::RongCloud));

    let router = MessageRouter::new(
        vec![
            TransportBinding::new(first.clone()),
            TransportBinding::primary(second.clone()),
            TransportBinding::new(third.clone()),
        ],
        RouterOptions::default(),
    );
    assert_eq!(router.primary_kind(), Some(TransportKind::AliyunImV2));

    router.remove_transports(&[TransportKind::AliyunImV2]);
    assert_eq!(router.primary_kind(), Some(TransportKind::AliyunImV1));
    assert_eq!(
        router.transport_kinds(),
        vec![TransportKind::AliyunImV1, TransportKind::RongCloud]
    );

    let fallback = MessageRouter::new(
        vec![TransportBinding::new(third), TransportBinding::new(first)],
        RouterOptions::default(),
    );
    assert_eq!(fallback.primary_kind(), Some(TransportKind::RongCloud));

    fallback.remove_transports(&[TransportKind::RongCloud, TransportKind::AliyunImV1]);
    assert_eq!(fallback.primary_kind(), None);
    assert!(matches!(
        fallback.send_message_to_group(OutboundMessage::new(MessageType::Comment)).await,
        Err(RouterError::NoTransports)
    ));
}

#[tokio::test]
async fn history_comes_from_the_primary() {
    let classroom = Classroom::dual();
    let (teacher, _) = classroom.join("teacher").await;

    teacher
        .send_message_to_group(OutboundMessage::new(MessageType::NoticeUpdate))
        .await
        .expect("send");
    teacher
        .send_group_signal(OutboundMessage::new(MessageType::NoticeUpdate))
        .await
        .expect("signal");

    let history = teacher
        .list_message(MessageType::NoticeUpdate)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
}

struct FixedMuteState(anyhow::Result<bool>);

#[async_trait]
impl MuteStateService for FixedMuteState {
    async fn is_mute_chatroom(&self, _group_id: &GroupId) -> anyhow::Result<bool> {
        match &self.0 {
            Ok(muted) => Ok(*muted),
            Err(err) => Err(anyhow!(err.to_string())),
        }
    }
}

#[tokio::test]
async fn query_mute_group_falls_back_to_the_app_server() {
    let hub = MemoryHub::new(TransportKind::AliyunImV2);
    let transport = MemoryTransport::new(hub);
    let router = MessageRouter::with_mute_service(
        vec![TransportBinding::new(transport.clone())],
        RouterOptions::default(),
        Arc::new(FixedMuteState(Ok(true))),
    );

    // Not joined yet and no group id known: the fallback has nothing to ask about.
    assert!(matches!(
        router.query_mute_group().await,
        Err(RouterError::Primary { .. })
    ));

    router.set_config(RouterConfig {
        token: "token".into(),
    });
    router
        .login(&UserInfo::new("teacher", "teacher"))
        .await
        .expect("login");
    router
        .join_group(&GroupIdSet::uniform(GROUP))
        .await
        .expect("join");
    let status = router.query_mute_group().await.expect("primary answers");
    assert!(!status.mute_all);

    transport.leave_group().await.expect("leave below the router");
    let status = router.query_mute_group().await.expect("fallback answers");
    assert!(status.mute_all);
}
