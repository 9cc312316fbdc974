use super::*;

use messaging_transport::{memory::MemoryTransport, MessagingTransport};
use shared::domain::GroupId;
use tokio::time::{timeout, Duration};

use crate::test_support::{Classroom, GROUP};

async fn connect(
    classroom: &Classroom,
    user: &str,
    role: Role,
    peer: Option<&str>,
) -> ClassroomClient {
    let settings = ClientSettings::default();
    let bindings = classroom
        .hubs
        .iter()
        .map(|hub| {
            let transport: Arc<dyn MessagingTransport> = MemoryTransport::new(Arc::clone(hub));
            TransportBinding::new(transport)
        })
        .collect();
    ClassroomClient::connect(
        &settings,
        bindings,
        None,
        ClassroomSession {
            user: UserInfo::new(user, user),
            role,
            token: format!("{user}-token"),
            groups: GroupIdSet::uniform(GROUP),
            peer: peer.map(UserId::new),
        },
    )
    .await
    .expect("connect")
}

#[tokio::test]
async fn each_role_gets_its_managers() {
    let classroom = Classroom::dual();
    let teacher = connect(&classroom, "teacher", Role::Teacher, Some("assistant")).await;
    let assistant = connect(&classroom, "assistant", Role::Assistant, Some("teacher")).await;
    let student = connect(&classroom, "s1", Role::Student, None).await;

    assert!(teacher.teacher_cooperation().is_some());
    assert!(teacher.teacher_interaction().is_some());
    assert!(assistant.assistant_cooperation().is_some());
    assert!(assistant.teacher_interaction().is_some());
    assert!(student.cooperation().is_none());
    assert!(student.student_interaction().is_some());
    assert!(student.teacher_interaction().is_none());

    assert_eq!(
        student.router().local_user().map(|user| user.user_id),
        Some(UserId::new("s1"))
    );
    assert_eq!(student.router().joined_group(), Some(GroupId::new(GROUP)));
}

#[tokio::test]
async fn assistant_mutes_a_student_through_the_teacher() {
    let classroom = Classroom::dual();
    let _teacher = connect(&classroom, "teacher", Role::Teacher, Some("assistant")).await;
    let assistant = connect(&classroom, "assistant", Role::Assistant, Some("teacher")).await;
    let student = connect(&classroom, "s1", Role::Student, None).await;
    let mut student_rx = student.router().subscribe_events();

    let machine = assistant
        .assistant_cooperation()
        .expect("assistant")
        .mute_user(MuteUserParams::mute("s1"), None)
        .expect("request");

    timeout(Duration::from_secs(30), async {
        loop {
            let event = student_rx.recv().await.expect("router event");
            if event.kind == RouterEventKind::MuteUser {
                break;
            }
        }
    })
    .await
    .expect("student muted");

    let mut lifecycle = machine.subscribe();
    if machine.state() != MachineState::Responsed {
        timeout(Duration::from_secs(30), async {
            while lifecycle.recv().await.expect("lifecycle").event != MachineEvent::Responsed {}
        })
        .await
        .expect("responsed");
    }
    assert_eq!(machine.state(), MachineState::Responsed);
}

#[tokio::test]
async fn disconnect_leaves_the_group() {
    let classroom = Classroom::dual();
    let student = connect(&classroom, "s1", Role::Student, None).await;
    let group = GroupId::new(GROUP);
    assert!(classroom.hubs[0].members(&group).contains(&UserId::new("s1")));

    student.disconnect().await.expect("disconnect");
    for hub in &classroom.hubs {
        assert!(!hub.members(&group).contains(&UserId::new("s1")));
    }
}
