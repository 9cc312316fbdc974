use std::sync::Arc;

use messaging_transport::{
    memory::{MemoryHub, MemoryTransport},
    MessagingTransport, TransportKind,
};
use shared::{
    domain::{GroupId, UserId, UserInfo},
    protocol::MessageType,
};
use tokio::{
    sync::broadcast,
    time::{timeout, Duration},
};

use crate::router::{
    GroupIdSet, MessageRouter, RouterConfig, RouterEvent, RouterEventKind, RouterOptions,
    TransportBinding,
};

pub(crate) const GROUP: &str = "class-1";
pub(crate) const OWNER: &str = "teacher";

/// A classroom hosted on one in-memory hub per backend kind.
pub(crate) struct Classroom {
    pub hubs: Vec<Arc<MemoryHub>>,
}

impl Classroom {
    pub fn new(kinds: &[TransportKind]) -> Self {
        let hubs = kinds.iter().map(|kind| MemoryHub::new(*kind)).collect::<Vec<_>>();
        for hub in &hubs {
            hub.create_group(&GroupId::new(GROUP), &UserId::new(OWNER));
        }
        Self { hubs }
    }

    pub fn dual() -> Self {
        Self::new(&[TransportKind::AliyunImV2, TransportKind::RongCloud])
    }

    pub async fn join(&self, user: &str) -> (Arc<MessageRouter>, Vec<Arc<MemoryTransport>>) {
        let transports: Vec<Arc<MemoryTransport>> = self
            .hubs
            .iter()
            .map(|hub| MemoryTransport::new(Arc::clone(hub)))
            .collect();
        let bindings = transports
            .iter()
            .map(|transport| {
                TransportBinding::new(Arc::clone(transport) as Arc<dyn MessagingTransport>)
            })
            .collect();
        let router = MessageRouter::new(bindings, RouterOptions::default());
        router.start();
        router.set_config(RouterConfig {
            token: "token".into(),
        });
        router.init().await.expect("init");
        router
            .login(&UserInfo::new(user, user))
            .await
            .expect("login");
        router
            .join_group(&GroupIdSet::uniform(GROUP))
            .await
            .expect("join");
        (router, transports)
    }
}

pub(crate) async fn next_event(
    rx: &mut broadcast::Receiver<RouterEvent>,
    wanted: impl Fn(&RouterEvent) -> bool,
) -> RouterEvent {
    timeout(Duration::from_secs(30), async {
        loop {
            let event = rx.recv().await.expect("router event");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for router event")
}

pub(crate) async fn next_kind(
    rx: &mut broadcast::Receiver<RouterEvent>,
    kind: RouterEventKind,
) -> RouterEvent {
    next_event(rx, |event| event.kind == kind).await
}

pub(crate) async fn next_message(
    rx: &mut broadcast::Receiver<RouterEvent>,
    message_type: MessageType,
) -> RouterEvent {
    next_event(rx, |event| {
        event.kind == RouterEventKind::MessageReceived && event.event.message_type == message_type
    })
    .await
}

/// Message types currently queued on `rx`, in arrival order.
pub(crate) fn drain_messages(rx: &mut broadcast::Receiver<RouterEvent>) -> Vec<MessageType> {
    let mut types = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.kind == RouterEventKind::MessageReceived {
            types.push(event.event.message_type);
        }
    }
    types
}

/// Lets spawned sends and inbound pumps run to completion.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
