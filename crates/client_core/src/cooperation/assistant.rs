use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use shared::{
    domain::{Permission, Role, UserId},
    protocol::{
        MessageType, MuteGroupRequest, MuteResponse, MuteUserRequest, NormalizedEvent,
        PermissionsSync, SessionNotice,
    },
};
use tokio::sync::broadcast;
use tracing::info;

use super::CooperationEvent;
use crate::{
    error::{ProtocolError, RouterError},
    manager::{Delivery, ManagerCore, ManagerOptions, MessageHandler, SessionMessages, SessionSpec},
    router::MessageRouter,
    session::SessionQuery,
    state_machine::{MachineEvent, StateMachine},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteUserParams {
    pub user_id: UserId,
    pub mute: bool,
}

impl MuteUserParams {
    pub fn mute(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            mute: true,
        }
    }

    pub fn unmute(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            mute: false,
        }
    }
}

pub struct AssistantCooperationManager {
    core: Arc<ManagerCore>,
    permissions: Mutex<Vec<Permission>>,
    events: broadcast::Sender<CooperationEvent>,
}

impl AssistantCooperationManager {
    pub fn new(role: Role, router: Arc<MessageRouter>, options: ManagerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            core: ManagerCore::new(
                "assistant cooperation",
                role,
                router,
                Delivery::GroupUser,
                options,
            ),
            permissions: Mutex::new(Vec::new()),
            events,
        })
    }

    fn check_role(&self, action: &'static str) -> Result<(), ProtocolError> {
        self.core
            .check_role(self.core.role() == Role::Assistant, action)
    }

    fn receiver(&self, receiver_id: Option<UserId>) -> Result<UserId, ProtocolError> {
        receiver_id
            .or_else(|| self.core.default_receiver())
            .ok_or_else(|| RouterError::Validation("need receiverId".into()).into())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CooperationEvent> {
        self.events.subscribe()
    }

    pub fn set_receiver_id(&self, receiver_id: Option<UserId>) {
        self.core.set_default_receiver(receiver_id);
    }

    pub fn permissions(&self) -> Vec<Permission> {
        self.permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn pending_sessions(&self) -> usize {
        self.core.pending_sessions()
    }

    pub fn mute_user(
        &self,
        params: MuteUserParams,
        receiver_id: Option<UserId>,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("mute_user")?;
        let receiver_id = self.receiver(receiver_id)?;
        let message_type = MessageType::RequestMuteUser;
        let flag = params.user_id.to_string();
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type)
                .receiver(&receiver_id)
                .flag(flag.clone()),
            receiver_id: receiver_id.clone(),
            flag: Some(flag),
        };
        let core = &self.core;
        let (session_id, machine) = core.start_session(spec, |session_id| {
            let payload = MuteUserRequest {
                session_id: session_id.clone(),
                user_id: params.user_id.clone(),
                mute: params.mute,
            };
            Ok(SessionMessages {
                request: core.message(message_type, Some(&receiver_id), &payload)?,
                on_timeout: None,
            })
        })?;
        info!(
            "assistant cooperation: requested mute user session_id={session_id} user_id={} mute={}",
            params.user_id, params.mute
        );
        Ok(machine)
    }

    pub fn handle_mute_user_responsed(
        &self,
        response: &MuteResponse,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_mute_user_responsed")?;
        self.core.resolve(
            "handle_mute_user_responsed",
            &response.session_id,
            MachineEvent::Responsed,
            Some(json!({ "success": response.success })),
        )
    }

    pub fn mute_group(
        &self,
        mute: bool,
        receiver_id: Option<UserId>,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("mute_group")?;
        let receiver_id = self.receiver(receiver_id)?;
        let message_type = MessageType::RequestMuteGroup;
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type).receiver(&receiver_id),
            receiver_id: receiver_id.clone(),
            flag: None,
        };
        let core = &self.core;
        let (session_id, machine) = core.start_session(spec, |session_id| {
            let payload = MuteGroupRequest {
                session_id: session_id.clone(),
                mute,
            };
            Ok(SessionMessages {
                request: core.message(message_type, Some(&receiver_id), &payload)?,
                on_timeout: None,
            })
        })?;
        info!("assistant cooperation: requested mute group session_id={session_id} mute={mute}");
        Ok(machine)
    }

    pub fn handle_mute_group_responsed(
        &self,
        response: &MuteResponse,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_mute_group_responsed")?;
        self.core.resolve(
            "handle_mute_group_responsed",
            &response.session_id,
            MachineEvent::Responsed,
            Some(json!({ "success": response.success })),
        )
    }

    pub fn sync_docs_updated(&self, receiver_id: Option<UserId>) -> Result<bool, ProtocolError> {
        let Some(receiver_id) = receiver_id.or_else(|| self.core.default_receiver()) else {
            return Ok(false);
        };
        let message_type = MessageType::SyncDocsUpdated;
        let payload = SessionNotice {
            session_id: self.core.next_session_id(message_type),
        };
        self.core
            .send(self.core.message(message_type, Some(&receiver_id), &payload)?);
        Ok(true)
    }

    fn apply_permissions(&self, sync: PermissionsSync) {
        info!(
            "assistant cooperation: permissions synced count={}",
            sync.permissions.len()
        );
        *self
            .permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sync.permissions.clone();
        let _ = self
            .events
            .send(CooperationEvent::PermissionsSynced(sync.permissions));
    }
}

#[async_trait]
impl MessageHandler for AssistantCooperationManager {
    fn component(&self) -> &'static str {
        self.core.component()
    }

    async fn handle_message(&self, event: &NormalizedEvent) -> Result<(), ProtocolError> {
        match event.message_type {
            MessageType::ResponseMuteUser => {
                self.handle_mute_user_responsed(&event.payload()?)?;
            }
            MessageType::ResponseMuteGroup => {
                self.handle_mute_group_responsed(&event.payload()?)?;
            }
            MessageType::SyncAssistantPermissions => {
                self.apply_permissions(event.payload()?);
            }
            MessageType::SyncDocsUpdated => {
                let _ = self.events.send(CooperationEvent::DocsUpdated {
                    sender: event.sender_id.clone(),
                });
            }
            _ => {}
        }
        Ok(())
    }
}
