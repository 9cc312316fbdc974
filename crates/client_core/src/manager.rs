use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{GroupId, Role, SessionId, UserId},
    protocol::{MessageType, NormalizedEvent, OutboundMessage},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::ProtocolError,
    router::{MessageRouter, RouterEventKind},
    session::{Session, SessionIdGenerator, SessionQuery, SessionRegistry},
    state_machine::{MachineEvent, RetryPolicy, StateMachine},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    GroupUser,
    Group,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub expired_session_capacity: usize,
    pub default_receiver: Option<UserId>,
    pub group_id: Option<GroupId>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            expired_session_capacity: 1024,
            default_receiver: None,
            group_id: None,
        }
    }
}

pub struct SessionMessages {
    pub request: OutboundMessage,
    pub on_timeout: Option<OutboundMessage>,
}

pub struct SessionSpec {
    pub message_type: MessageType,
    pub receiver_id: UserId,
    pub flag: Option<String>,
    pub conflict: SessionQuery,
}

pub struct ManagerCore {
    component: &'static str,
    role: Role,
    router: Arc<MessageRouter>,
    delivery: Delivery,
    retry: RetryPolicy,
    group_id: Option<GroupId>,
    ids: SessionIdGenerator,
    registry: Mutex<SessionRegistry>,
    receiver: Mutex<Option<UserId>>,
}

impl ManagerCore {
    pub fn new(
        component: &'static str,
        role: Role,
        router: Arc<MessageRouter>,
        delivery: Delivery,
        options: ManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            component,
            role,
            router,
            delivery,
            retry: options.retry,
            group_id: options.group_id,
            ids: SessionIdGenerator::new(),
            registry: Mutex::new(SessionRegistry::new(options.expired_session_capacity)),
            receiver: Mutex::new(options.default_receiver),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn default_receiver(&self) -> Option<UserId> {
        self.receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_default_receiver(&self, receiver: Option<UserId>) {
        *self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = receiver;
    }

    pub fn next_session_id(&self, message_type: MessageType) -> SessionId {
        self.ids.next(message_type)
    }

    pub fn check_role(&self, allowed: bool, action: &'static str) -> Result<(), ProtocolError> {
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::RoleActionMismatch {
                role: self.role,
                action,
            })
        }
    }

    pub fn message<T: serde::Serialize>(
        &self,
        message_type: MessageType,
        receiver: Option<&UserId>,
        payload: &T,
    ) -> Result<OutboundMessage, ProtocolError> {
        let mut message = OutboundMessage::new(message_type).with_payload(payload)?;
        message.skip_audit = true;
        message.skip_mute_check = true;
        message.receiver_id = receiver.cloned();
        message.group_id = self.group_id.clone();
        Ok(message)
    }

    pub fn send(&self, message: OutboundMessage) {
        let router = Arc::clone(&self.router);
        let delivery = self.delivery;
        let component = self.component;
        tokio::spawn(async move {
            let message_type = message.message_type;
            let result = match (delivery, message.receiver_id.is_some()) {
                (Delivery::GroupUser, true) => router.send_message_to_group_user(message).await,
                _ => router.send_message_to_group(message).await,
            };
            match result {
                Ok(receipt) => debug!("{component}: sent type={message_type} sid={}", receipt.sid),
                Err(err) => warn!("{component}: send failed type={message_type}: {err}"),
            }
        });
    }

    pub fn start_session(
        self: &Arc<Self>,
        spec: SessionSpec,
        build: impl FnOnce(&SessionId) -> Result<SessionMessages, ProtocolError>,
    ) -> Result<(SessionId, Arc<StateMachine>), ProtocolError> {
        // Conflict check and insert share one registry lock.
        let (session_id, machine) = {
            let mut registry = self.registry();
            if let Some(existing) = registry.find(&spec.conflict) {
                return Err(ProtocolError::StateActionMismatch {
                    message_type: spec.message_type,
                    state: Some(existing.machine.state()),
                    receiver: Some(existing.receiver_id.clone()),
                });
            }

            let session_id = self.next_session_id(spec.message_type);
            let messages = build(&session_id)?;
            let machine = StateMachine::new(self.retry);

            let core: Weak<Self> = Arc::downgrade(self);
            let request = messages.request;
            machine.on(MachineEvent::Request, move |_| {
                if let Some(core) = core.upgrade() {
                    core.send(request.clone());
                }
            });

            let core: Weak<Self> = Arc::downgrade(self);
            let timeout_id = session_id.clone();
            let on_timeout = messages.on_timeout;
            machine.on(MachineEvent::Timeout, move |_| {
                let Some(core) = core.upgrade() else {
                    return;
                };
                warn!("{}: session timed out session_id={timeout_id}", core.component);
                core.registry().remove(&timeout_id);
                if let Some(cancel) = &on_timeout {
                    core.send(cancel.clone());
                }
            });

            registry.insert(Session {
                session_id: session_id.clone(),
                receiver_id: spec.receiver_id,
                message_type: spec.message_type,
                machine: Arc::clone(&machine),
                flag: spec.flag,
            });
            (session_id, machine)
        };

        debug!(
            "{}: session started session_id={session_id} type={}",
            self.component, spec.message_type
        );
        machine.transition(MachineEvent::Request, None)?;
        Ok((session_id, machine))
    }

    pub fn resolve(
        &self,
        handler: &'static str,
        session_id: &SessionId,
        event: MachineEvent,
        payload: Option<Value>,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        let session = {
            let mut registry = self.registry();
            match registry.remove(session_id) {
                Some(session) => session,
                None => {
                    return Err(ProtocolError::SessionMissed {
                        handler,
                        session_id: session_id.clone(),
                        expired: registry.is_expired(session_id),
                    })
                }
            }
        };
        debug!(
            "{}: session resolved session_id={session_id} event={event}",
            self.component
        );
        session.machine.transition(event, payload)?;
        Ok(session.machine)
    }

    pub fn find_session(&self, query: &SessionQuery) -> Option<Session> {
        self.registry().find(query).cloned()
    }

    pub fn is_expired(&self, session_id: &SessionId) -> bool {
        self.registry().is_expired(session_id)
    }

    pub fn owns_session(&self, session_id: &SessionId) -> bool {
        let registry = self.registry();
        registry.find(&SessionQuery::by_id(session_id)).is_some()
            || registry.is_expired(session_id)
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.router.local_user().map(|user| user.user_id)
    }

    pub fn expire(&self, session_id: &SessionId) {
        self.registry().expire(session_id.clone());
    }

    pub fn pending_sessions(&self) -> usize {
        self.registry().len()
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn component(&self) -> &'static str;
    async fn handle_message(&self, event: &NormalizedEvent) -> Result<(), ProtocolError>;
}

/// Feeds every message the router receives into `handler` until either side is dropped.
pub fn attach<H: MessageHandler>(router: &MessageRouter, handler: &Arc<H>) -> JoinHandle<()> {
    let mut events = router.subscribe_events();
    let handler: Weak<H> = Arc::downgrade(handler);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("manager: inbound events lagged skipped={skipped}");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.kind != RouterEventKind::MessageReceived {
                continue;
            }
            let Some(handler) = handler.upgrade() else {
                break;
            };
            match handler.handle_message(&event.event).await {
                Ok(()) => {}
                Err(err) if err.is_stale_reply() => debug!(
                    "{}: ignored stale reply type={}: {err}",
                    handler.component(),
                    event.event.message_type
                ),
                Err(err) => warn!(
                    "{}: failed to handle type={}: {err}",
                    handler.component(),
                    event.event.message_type
                ),
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
