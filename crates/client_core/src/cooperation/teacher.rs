use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::{
    domain::{Permission, Role, SessionId, UserId},
    protocol::{
        MessageType, MuteGroupRequest, MuteResponse, MuteUserRequest, NormalizedEvent,
        PermissionsSync, SessionNotice,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::CooperationEvent;
use crate::{
    error::{ProtocolError, RouterError},
    manager::{Delivery, ManagerCore, ManagerOptions, MessageHandler},
    router::MessageRouter,
};

#[derive(Debug, Clone)]
struct PendingMute {
    session_id: SessionId,
    mute: bool,
    requester: Option<UserId>,
}

#[derive(Default)]
struct TeacherState {
    mute_users: HashMap<UserId, PendingMute>,
    mute_group: Option<PendingMute>,
}

pub struct TeacherCooperationManager {
    core: Arc<ManagerCore>,
    state: Mutex<TeacherState>,
    events: broadcast::Sender<CooperationEvent>,
}

impl TeacherCooperationManager {
    pub fn new(role: Role, router: Arc<MessageRouter>, options: ManagerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            core: ManagerCore::new(
                "teacher cooperation",
                role,
                router,
                Delivery::GroupUser,
                options,
            ),
            state: Mutex::new(TeacherState::default()),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, TeacherState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_role(&self, action: &'static str) -> Result<(), ProtocolError> {
        self.core.check_role(self.core.role() == Role::Teacher, action)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CooperationEvent> {
        self.events.subscribe()
    }

    pub fn set_receiver_id(&self, receiver_id: Option<UserId>) {
        self.core.set_default_receiver(receiver_id);
    }

    fn response_receiver(
        &self,
        explicit: Option<UserId>,
        pending: &PendingMute,
    ) -> Result<UserId, ProtocolError> {
        explicit
            .or_else(|| pending.requester.clone())
            .or_else(|| self.core.default_receiver())
            .ok_or_else(|| RouterError::Validation("need receiverId".into()).into())
    }

    pub fn sync_asst_permissions(
        &self,
        permissions: Vec<Permission>,
        receiver_id: Option<UserId>,
    ) -> Result<bool, ProtocolError> {
        let Some(receiver_id) = receiver_id.or_else(|| self.core.default_receiver()) else {
            return Ok(false);
        };
        let message_type = MessageType::SyncAssistantPermissions;
        let payload = PermissionsSync {
            session_id: self.core.next_session_id(message_type),
            permissions,
        };
        self.core
            .send(self.core.message(message_type, Some(&receiver_id), &payload)?);
        Ok(true)
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

    pub fn receive_mute_user_request(
        &self,
        request: &MuteUserRequest,
        requester: Option<UserId>,
    ) -> Result<bool, ProtocolError> {
        self.check_role("receive_mute_user_request")?;
        if self.core.is_expired(&request.session_id) {
            return Ok(false);
        }
        let mut state = self.state();
        if state.mute_users.contains_key(&request.user_id) {
            return Ok(false);
        }
        state.mute_users.insert(
            request.user_id.clone(),
            PendingMute {
                session_id: request.session_id.clone(),
                mute: request.mute,
                requester,
            },
        );
        drop(state);

        let _ = self.events.send(CooperationEvent::MuteUserRequested {
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            mute: request.mute,
        });
        Ok(true)
    }

    pub fn mute_user_done(
        &self,
        success: bool,
        user_id: &UserId,
        receiver_id: Option<UserId>,
    ) -> Result<(), ProtocolError> {
        self.check_role("mute_user_done")?;
        let message_type = MessageType::ResponseMuteUser;
        let (pending, receiver) = {
            let mut state = self.state();
            let Some(pending) = state.mute_users.get(user_id).cloned() else {
                return Err(ProtocolError::StateActionMismatch {
                    message_type,
                    state: None,
                    receiver: receiver_id,
                });
            };
            let receiver = self.response_receiver(receiver_id, &pending)?;
            state.mute_users.remove(user_id);
            (pending, receiver)
        };

        let payload = MuteResponse {
            session_id: pending.session_id.clone(),
            success,
        };
        self.core
            .send(self.core.message(message_type, Some(&receiver), &payload)?);
        self.core.expire(&pending.session_id);
        info!("teacher cooperation: mute user done user_id={user_id} success={success}");
        let _ = self.events.send(CooperationEvent::MuteUserDone {
            user_id: user_id.clone(),
            success,
        });
        Ok(())
    }

    pub fn receive_mute_group_request(
        &self,
        request: &MuteGroupRequest,
        requester: Option<UserId>,
    ) -> Result<bool, ProtocolError> {
        self.check_role("receive_mute_group_request")?;
        if self.core.is_expired(&request.session_id) {
            return Ok(false);
        }
        let mut state = self.state();
        if state.mute_group.is_some() {
            return Ok(false);
        }
        state.mute_group = Some(PendingMute {
            session_id: request.session_id.clone(),
            mute: request.mute,
            requester,
        });
        drop(state);

        let _ = self.events.send(CooperationEvent::MuteGroupRequested {
            session_id: request.session_id.clone(),
            mute: request.mute,
        });
        Ok(true)
    }

    pub fn mute_group_done(
        &self,
        success: bool,
        receiver_id: Option<UserId>,
    ) -> Result<(), ProtocolError> {
        self.check_role("mute_group_done")?;
        let message_type = MessageType::ResponseMuteGroup;
        let (pending, receiver) = {
            let mut state = self.state();
            let Some(pending) = state.mute_group.clone() else {
                return Err(ProtocolError::StateActionMismatch {
                    message_type,
                    state: None,
                    receiver: receiver_id,
                });
            };
            let receiver = self.response_receiver(receiver_id, &pending)?;
            state.mute_group = None;
            (pending, receiver)
        };

        let payload = MuteResponse {
            session_id: pending.session_id.clone(),
            success,
        };
        self.core
            .send(self.core.message(message_type, Some(&receiver), &payload)?);
        self.core.expire(&pending.session_id);
        info!("teacher cooperation: mute group done success={success}");
        let _ = self.events.send(CooperationEvent::MuteGroupDone { success });
        Ok(())
    }

    pub async fn perform_mute_user(&self, user_id: &UserId) -> Result<bool, ProtocolError> {
        self.check_role("perform_mute_user")?;
        let pending_mute = self.state().mute_users.get(user_id).map(|pending| pending.mute);
        let Some(mute) = pending_mute else {
            return Err(ProtocolError::StateActionMismatch {
                message_type: MessageType::ResponseMuteUser,
                state: None,
                receiver: None,
            });
        };
        let router = self.core.router();
        let result = if mute {
            router.mute_user(user_id).await
        } else {
            router.cancel_mute_user(user_id).await
        };
        if let Err(err) = &result {
            warn!("teacher cooperation: mute user failed user_id={user_id} mute={mute}: {err}");
        }
        let success = result.is_ok();
        self.mute_user_done(success, user_id, None)?;
        Ok(success)
    }

    pub async fn perform_mute_group(&self) -> Result<bool, ProtocolError> {
        self.check_role("perform_mute_group")?;
        let pending_mute = self.state().mute_group.as_ref().map(|pending| pending.mute);
        let Some(mute) = pending_mute else {
            return Err(ProtocolError::StateActionMismatch {
                message_type: MessageType::ResponseMuteGroup,
                state: None,
                receiver: None,
            });
        };
        let router = self.core.router();
        let result = if mute {
            router.mute_group().await
        } else {
            router.cancel_mute_group().await
        };
        if let Err(err) = &result {
            warn!("teacher cooperation: mute group failed mute={mute}: {err}");
        }
        let success = result.is_ok();
        self.mute_group_done(success, None)?;
        Ok(success)
    }
}

#[async_trait]
impl MessageHandler for TeacherCooperationManager {
    fn component(&self) -> &'static str {
        self.core.component()
    }

    async fn handle_message(&self, event: &NormalizedEvent) -> Result<(), ProtocolError> {
        match event.message_type {
            MessageType::RequestMuteUser => {
                let request: MuteUserRequest = event.payload()?;
                if self.receive_mute_user_request(&request, event.sender_id.clone())? {
                    self.perform_mute_user(&request.user_id).await?;
                }
            }
            MessageType::RequestMuteGroup => {
                let request: MuteGroupRequest = event.payload()?;
                if self.receive_mute_group_request(&request, event.sender_id.clone())? {
                    self.perform_mute_group().await?;
                }
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
