use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Role, SessionId, UserId},
    protocol::{InteractionData, MessageType, NormalizedEvent},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{Device, InteractionEvent, MediaStatus};
use crate::{
    error::{ProtocolError, RouterError},
    manager::{Delivery, ManagerCore, ManagerOptions, MessageHandler, SessionMessages, SessionSpec},
    router::MessageRouter,
    session::SessionQuery,
    state_machine::{MachineEvent, StateMachine},
};

#[derive(Default)]
struct StudentState {
    invitation: Option<SessionId>,
    accepted: Option<(SessionId, Option<UserId>)>,
    camera_control: Option<SessionId>,
    mic_control: Option<SessionId>,
}

impl StudentState {
    fn control(&mut self, device: Device) -> &mut Option<SessionId> {
        match device {
            Device::Camera => &mut self.camera_control,
            Device::Mic => &mut self.mic_control,
        }
    }

    fn forget(&mut self, session_id: &SessionId) {
        for slot in [
            &mut self.invitation,
            &mut self.camera_control,
            &mut self.mic_control,
        ] {
            if slot.as_ref() == Some(session_id) {
                *slot = None;
            }
        }
    }
}

pub struct StudentInteractionManager {
    core: Arc<ManagerCore>,
    state: Mutex<StudentState>,
    events: broadcast::Sender<InteractionEvent>,
}

impl StudentInteractionManager {
    pub fn new(role: Role, router: Arc<MessageRouter>, options: ManagerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            core: ManagerCore::new(
                "student interaction",
                role,
                router,
                Delivery::Group,
                options,
            ),
            state: Mutex::new(StudentState::default()),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, StudentState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_role(&self, action: &'static str) -> Result<(), ProtocolError> {
        self.core.check_role(self.core.role() != Role::Teacher, action)
    }

    fn emit(&self, event: InteractionEvent) {
        let _ = self.events.send(event);
    }

    fn me(&self) -> Result<UserId, ProtocolError> {
        self.core
            .local_user_id()
            .ok_or_else(|| RouterError::Validation("login required".into()).into())
    }

    fn is_mine(&self, data: &InteractionData) -> bool {
        self.core.local_user_id().as_ref() == Some(&data.student_id)
    }

    fn broadcast(
        &self,
        message_type: MessageType,
        data: &InteractionData,
    ) -> Result<(), ProtocolError> {
        self.core.send(self.core.message(message_type, None, data)?);
        Ok(())
    }

    fn expire(&self, session_id: &SessionId) {
        self.state().forget(session_id);
        if !self.core.is_expired(session_id) {
            debug!("student interaction: session expired session_id={session_id}");
            self.core.expire(session_id);
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InteractionEvent> {
        self.events.subscribe()
    }

    pub fn pending_invitation(&self) -> Option<SessionId> {
        self.state().invitation.clone()
    }

    pub fn pending_sessions(&self) -> usize {
        self.core.pending_sessions()
    }

    pub fn receive_invitation(&self, data: &InteractionData) -> Result<bool, ProtocolError> {
        self.check_role("receive_invitation")?;
        if self.core.is_expired(&data.session_id) {
            return Ok(false);
        }
        let mut state = self.state();
        if state.invitation.as_ref() == Some(&data.session_id) {
            return Ok(false);
        }
        state.invitation = Some(data.session_id.clone());
        Ok(true)
    }

    pub fn send_accepted_resp(&self, data: &InteractionData) -> Result<bool, ProtocolError> {
        self.check_role("send_accepted_resp")?;
        if self.core.is_expired(&data.session_id) {
            return Ok(false);
        }
        self.broadcast(MessageType::AcceptedInteractionInvitation, data)?;
        self.expire(&data.session_id);
        info!(
            "student interaction: invitation accepted session_id={}",
            data.session_id
        );
        Ok(true)
    }

    pub fn reject_invitation(&self, data: &InteractionData) -> Result<(), ProtocolError> {
        self.check_role("reject_invitation")?;
        self.broadcast(MessageType::RejectedInteractionInvitation, data)?;
        self.expire(&data.session_id);
        Ok(())
    }

    pub fn handle_invitation_canceled(
        &self,
        data: &InteractionData,
    ) -> Result<bool, ProtocolError> {
        self.check_role("handle_invitation_canceled")?;
        if self.core.is_expired(&data.session_id) {
            return Ok(false);
        }
        self.expire(&data.session_id);
        Ok(true)
    }

    pub fn application(&self, teacher_id: &UserId) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("application")?;
        let student_id = self.me()?;
        let message_type = MessageType::InteractionApplication;
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type),
            receiver_id: teacher_id.clone(),
            flag: None,
        };
        let (session_id, machine) = self.core.start_session(spec, |session_id| {
            let data = InteractionData::new(session_id.clone(), student_id.clone())
                .with_teacher(teacher_id.clone());
            Ok(SessionMessages {
                request: self.core.message(message_type, None, &data)?,
                on_timeout: Some(self.core.message(
                    MessageType::CancelInteractionApplication,
                    None,
                    &data,
                )?),
            })
        })?;
        info!("student interaction: applied teacher_id={teacher_id} session_id={session_id}");
        Ok(machine)
    }

    pub fn cancel_application(&self) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("cancel_application")?;
        let message_type = MessageType::CancelInteractionApplication;
        let query = SessionQuery::by_type(MessageType::InteractionApplication);
        let Some(session) = self.core.find_session(&query) else {
            return Err(ProtocolError::StateActionMismatch {
                message_type,
                state: None,
                receiver: None,
            });
        };
        let machine = self.core.resolve(
            "cancel_application",
            &session.session_id,
            MachineEvent::Cancel,
            None,
        )?;
        let data = InteractionData::new(session.session_id, self.me()?)
            .with_teacher(session.receiver_id);
        self.broadcast(message_type, &data)?;
        info!("student interaction: application canceled");
        Ok(machine)
    }

    pub fn handle_application_accepted(
        &self,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_application_accepted")?;
        let teacher_id = self
            .core
            .find_session(&SessionQuery::by_id(&data.session_id))
            .map(|session| session.receiver_id)
            .or_else(|| data.teacher_id.clone());
        let machine = self.core.resolve(
            "handle_application_accepted",
            &data.session_id,
            MachineEvent::Responsed,
            Some(serde_json::to_value(data)?),
        )?;
        self.state().accepted = Some((data.session_id.clone(), teacher_id));
        Ok(machine)
    }

    pub fn handle_application_rejected(
        &self,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_application_rejected")?;
        self.core.resolve(
            "handle_application_rejected",
            &data.session_id,
            MachineEvent::Rejected,
            Some(serde_json::to_value(data)?),
        )
    }

    pub fn interacting(&self, media: &MediaStatus) -> Result<(), ProtocolError> {
        self.check_role("interacting")?;
        let message_type = MessageType::InteractionApplicationSucceed;
        let accepted = self.state().accepted.take();
        let Some((session_id, teacher_id)) = accepted else {
            return Err(ProtocolError::StateActionMismatch {
                message_type,
                state: None,
                receiver: None,
            });
        };
        let mut data = InteractionData::new(session_id.clone(), self.me()?);
        if let Some(teacher_id) = teacher_id {
            data = data.with_teacher(teacher_id);
        }
        self.broadcast(message_type, &media.apply(data))?;
        self.expire(&session_id);
        Ok(())
    }

    pub fn notice_ending_interaction(
        &self,
        teacher_id: &UserId,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("notice_ending_interaction")?;
        let student_id = self.me()?;
        let message_type = MessageType::StudentEndInteraction;
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type),
            receiver_id: teacher_id.clone(),
            flag: None,
        };
        let (_, machine) = self.core.start_session(spec, |session_id| {
            let data = InteractionData::new(session_id.clone(), student_id.clone())
                .with_teacher(teacher_id.clone());
            Ok(SessionMessages {
                request: self.core.message(message_type, None, &data)?,
                on_timeout: None,
            })
        })?;
        Ok(machine)
    }

    pub fn handle_ending_interaction_allowed(
        &self,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_ending_interaction_allowed")?;
        self.core.resolve(
            "handle_ending_interaction_allowed",
            &data.session_id,
            MachineEvent::Responsed,
            None,
        )
    }

    fn notify_device(&self, message_type: MessageType, opened: bool) -> Result<(), ProtocolError> {
        let data = InteractionData::new(self.core.next_session_id(message_type), self.me()?)
            .with_extra("opened", opened);
        self.broadcast(message_type, &data)
    }

    pub fn notify_mic_status_changed(&self, opened: bool) -> Result<(), ProtocolError> {
        self.check_role("notify_mic_status_changed")?;
        self.notify_device(MessageType::MicChanged, opened)
    }

    pub fn notify_camera_status_changed(&self, opened: bool) -> Result<(), ProtocolError> {
        self.check_role("notify_camera_status_changed")?;
        self.notify_device(MessageType::CameraChanged, opened)
    }

    fn receive_control(&self, device: Device, data: &InteractionData) -> bool {
        if self.core.is_expired(&data.session_id) {
            return false;
        }
        let mut state = self.state();
        let slot = state.control(device);
        if slot.as_ref() == Some(&data.session_id) {
            return false;
        }
        *slot = Some(data.session_id.clone());
        true
    }

    fn answer_control(
        &self,
        device: Device,
        message_type: MessageType,
        failed: bool,
    ) -> Result<bool, ProtocolError> {
        let pending = self.state().control(device).clone();
        let Some(session_id) = pending else {
            return Ok(false);
        };
        if self.core.is_expired(&session_id) {
            return Ok(false);
        }
        let data =
            InteractionData::new(session_id.clone(), self.me()?).with_extra("failed", failed);
        self.broadcast(message_type, &data)?;
        self.expire(&session_id);
        Ok(true)
    }

    pub fn handle_camera_control(&self, data: &InteractionData) -> Result<bool, ProtocolError> {
        self.check_role("handle_camera_control")?;
        Ok(self.receive_control(Device::Camera, data))
    }

    pub fn answer_camera_control(&self, failed: bool) -> Result<bool, ProtocolError> {
        self.check_role("answer_camera_control")?;
        self.answer_control(Device::Camera, MessageType::ToggleCameraAnswered, failed)
    }

    pub fn handle_mic_control(&self, data: &InteractionData) -> Result<bool, ProtocolError> {
        self.check_role("handle_mic_control")?;
        Ok(self.receive_control(Device::Mic, data))
    }

    pub fn answer_mic_control(&self, failed: bool) -> Result<bool, ProtocolError> {
        self.check_role("answer_mic_control")?;
        self.answer_control(Device::Mic, MessageType::ToggleMicAnswered, failed)
    }
}

#[async_trait]
impl MessageHandler for StudentInteractionManager {
    fn component(&self) -> &'static str {
        self.core.component()
    }

    async fn handle_message(&self, event: &NormalizedEvent) -> Result<(), ProtocolError> {
        let message_type = event.message_type;
        match message_type {
            MessageType::InteractionInvitation => {
                let data: InteractionData = event.payload()?;
                if self.is_mine(&data) && self.receive_invitation(&data)? {
                    self.emit(InteractionEvent::InvitationReceived(data));
                }
            }
            MessageType::CancelInteractionInvitation => {
                let data: InteractionData = event.payload()?;
                if self.is_mine(&data) && self.handle_invitation_canceled(&data)? {
                    self.emit(InteractionEvent::InvitationCanceled {
                        session_id: data.session_id,
                    });
                }
            }
            MessageType::AcceptedInteractionApplication
            | MessageType::RejectedInteractionApplication
            | MessageType::StudentEndInteractionAllowed => {
                let data: InteractionData = event.payload()?;
                if !self.core.owns_session(&data.session_id) {
                    return Ok(());
                }
                match message_type {
                    MessageType::AcceptedInteractionApplication => {
                        self.handle_application_accepted(&data)?;
                        self.emit(InteractionEvent::ApplicationAccepted(data));
                    }
                    MessageType::RejectedInteractionApplication => {
                        self.handle_application_rejected(&data)?;
                        self.emit(InteractionEvent::ApplicationRejected {
                            full: data.flag("full").unwrap_or(false),
                            interaction_allowed: data.flag("interactionAllowed").unwrap_or(true),
                            session_id: data.session_id,
                        });
                    }
                    _ => {
                        self.handle_ending_interaction_allowed(&data)?;
                        self.emit(InteractionEvent::EndingAllowed {
                            session_id: data.session_id,
                        });
                    }
                }
            }
            MessageType::TeacherEndInteraction => {
                let data: InteractionData = event.payload()?;
                if self.is_mine(&data) {
                    self.emit(InteractionEvent::InteractionEnded {
                        student_id: Some(data.student_id),
                    });
                }
            }
            MessageType::TeacherEndAllInteraction => {
                self.emit(InteractionEvent::InteractionEnded { student_id: None });
            }
            MessageType::InteractionAllowed => {
                let data: InteractionData = event.payload()?;
                self.emit(InteractionEvent::InteractionAllowed(
                    data.flag("allowed").unwrap_or(true),
                ));
            }
            MessageType::AllMicMuted => {
                let data: InteractionData = event.payload()?;
                self.emit(InteractionEvent::AllMicMuted(
                    data.flag("muted").unwrap_or(false),
                ));
            }
            MessageType::ToggleCamera | MessageType::ToggleMic => {
                let data: InteractionData = event.payload()?;
                if !self.is_mine(&data) {
                    return Ok(());
                }
                let device = if message_type == MessageType::ToggleCamera {
                    Device::Camera
                } else {
                    Device::Mic
                };
                let accepted = match device {
                    Device::Camera => self.handle_camera_control(&data)?,
                    Device::Mic => self.handle_mic_control(&data)?,
                };
                if accepted {
                    self.emit(InteractionEvent::DeviceControl {
                        device,
                        turn_on: data.flag("turnOn").unwrap_or(false),
                    });
                }
            }
            MessageType::InteractionMemberUpdated => {
                let data: InteractionData = event.payload()?;
                let members = match data.extra.get("data") {
                    Some(Value::Array(members)) => members.clone(),
                    _ => Vec::new(),
                };
                self.emit(InteractionEvent::MembersUpdated(members));
            }
            _ => {}
        }
        Ok(())
    }
}
