use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{Role, SessionId, UserId},
    protocol::{InteractionData, MessageType, NormalizedEvent},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{Device, InteractionEvent, InteractionStatus};
use crate::{
    error::ProtocolError,
    manager::{Delivery, ManagerCore, ManagerOptions, MessageHandler, SessionMessages, SessionSpec},
    router::MessageRouter,
    session::SessionQuery,
    state_machine::{MachineEvent, StateMachine},
};

#[derive(Default)]
struct TeacherState {
    applications: HashMap<UserId, InteractionData>,
    status: InteractionStatus,
}

/// Teacher side of stage interactions. Also used by assistants, who may run the
/// classroom on the teacher's behalf.
pub struct TeacherInteractionManager {
    core: Arc<ManagerCore>,
    state: Mutex<TeacherState>,
    events: broadcast::Sender<InteractionEvent>,
}

impl TeacherInteractionManager {
    pub fn new(role: Role, router: Arc<MessageRouter>, options: ManagerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            core: ManagerCore::new(
                "teacher interaction",
                role,
                router,
                Delivery::Group,
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
        self.core.check_role(self.core.role() != Role::Student, action)
    }

    fn emit(&self, event: InteractionEvent) {
        let _ = self.events.send(event);
    }

    fn data(&self, session_id: SessionId, student_id: UserId) -> InteractionData {
        let data = InteractionData::new(session_id, student_id);
        match self.core.local_user_id() {
            Some(teacher_id) => data.with_teacher(teacher_id),
            None => data,
        }
    }

    fn broadcast(
        &self,
        message_type: MessageType,
        data: &InteractionData,
    ) -> Result<(), ProtocolError> {
        self.core.send(self.core.message(message_type, None, data)?);
        Ok(())
    }

    fn notice(
        &self,
        message_type: MessageType,
        student_id: UserId,
        extra: Option<(&str, Value)>,
    ) -> Result<(), ProtocolError> {
        let mut data = self.data(self.core.next_session_id(message_type), student_id);
        if let Some((key, value)) = extra {
            data = data.with_extra(key, value);
        }
        self.broadcast(message_type, &data)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InteractionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> InteractionStatus {
        self.state().status
    }

    pub fn set_full(&self, full: bool) {
        self.state().status.full = full;
    }

    pub fn pending_application(&self, student_id: &UserId) -> Option<InteractionData> {
        self.state().applications.get(student_id).cloned()
    }

    pub fn pending_sessions(&self) -> usize {
        self.core.pending_sessions()
    }

    pub fn invite(&self, student_id: &UserId) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("invite")?;
        let message_type = MessageType::InteractionInvitation;
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type).receiver(student_id),
            receiver_id: student_id.clone(),
            flag: None,
        };
        let (session_id, machine) = self.core.start_session(spec, |session_id| {
            let data = self.data(session_id.clone(), student_id.clone());
            Ok(SessionMessages {
                request: self.core.message(message_type, None, &data)?,
                on_timeout: Some(self.core.message(
                    MessageType::CancelInteractionInvitation,
                    None,
                    &data,
                )?),
            })
        })?;
        info!("teacher interaction: invited student_id={student_id} session_id={session_id}");
        Ok(machine)
    }

    pub fn cancel_invitation(
        &self,
        student_id: &UserId,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("cancel_invitation")?;
        let message_type = MessageType::CancelInteractionInvitation;
        let query = SessionQuery::by_type(MessageType::InteractionInvitation).receiver(student_id);
        let Some(session) = self.core.find_session(&query) else {
            return Err(ProtocolError::StateActionMismatch {
                message_type,
                state: None,
                receiver: Some(student_id.clone()),
            });
        };
        let machine = self.core.resolve(
            "cancel_invitation",
            &session.session_id,
            MachineEvent::Cancel,
            None,
        )?;
        let data = self.data(session.session_id, student_id.clone());
        self.broadcast(message_type, &data)?;
        info!("teacher interaction: invitation canceled student_id={student_id}");
        Ok(machine)
    }

    pub fn handle_invitation_accepted(
        &self,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_invitation_accepted")?;
        let machine = self.core.resolve(
            "handle_invitation_accepted",
            &data.session_id,
            MachineEvent::Responsed,
            Some(serde_json::to_value(data)?),
        )?;
        self.emit(InteractionEvent::InvitationAccepted(data.clone()));
        Ok(machine)
    }

    pub fn handle_invitation_rejected(
        &self,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_invitation_rejected")?;
        let machine = self.core.resolve(
            "handle_invitation_rejected",
            &data.session_id,
            MachineEvent::Rejected,
            Some(serde_json::to_value(data)?),
        )?;
        self.emit(InteractionEvent::InvitationRejected(data.clone()));
        Ok(machine)
    }

    fn expire_application(&self, student_id: &UserId) {
        let removed = self.state().applications.remove(student_id);
        if let Some(application) = removed {
            debug!(
                "teacher interaction: application expired student_id={student_id} session_id={}",
                application.session_id
            );
            self.core.expire(&application.session_id);
        }
    }

    pub fn receive_application(
        &self,
        data: &InteractionData,
        status: InteractionStatus,
    ) -> Result<bool, ProtocolError> {
        self.check_role("receive_application")?;
        if status.full || !status.interaction_allowed {
            let rejection = data
                .clone()
                .with_extra("full", status.full)
                .with_extra("interactionAllowed", status.interaction_allowed);
            self.broadcast(MessageType::RejectedInteractionApplication, &rejection)?;
            return Ok(false);
        }
        if self.core.is_expired(&data.session_id) {
            return Ok(false);
        }
        let mut state = self.state();
        let repeated = state
            .applications
            .get(&data.student_id)
            .is_some_and(|last| last.session_id == data.session_id);
        if repeated {
            return Ok(false);
        }
        state
            .applications
            .insert(data.student_id.clone(), data.clone());
        Ok(true)
    }

    pub fn accept_application(&self, student_id: &UserId) -> Result<(), ProtocolError> {
        self.check_role("accept_application")?;
        let message_type = MessageType::AcceptedInteractionApplication;
        let Some(application) = self.pending_application(student_id) else {
            return Err(ProtocolError::StateActionMismatch {
                message_type,
                state: None,
                receiver: Some(student_id.clone()),
            });
        };
        self.broadcast(message_type, &application)?;
        info!("teacher interaction: application accepted student_id={student_id}");
        Ok(())
    }

    pub fn reject_application(
        &self,
        student_id: &UserId,
        status: Option<InteractionStatus>,
    ) -> Result<(), ProtocolError> {
        self.check_role("reject_application")?;
        let message_type = MessageType::RejectedInteractionApplication;
        let Some(mut application) = self.pending_application(student_id) else {
            return Err(ProtocolError::StateActionMismatch {
                message_type,
                state: None,
                receiver: Some(student_id.clone()),
            });
        };
        if let Some(status) = status {
            application = application
                .with_extra("full", status.full)
                .with_extra("interactionAllowed", status.interaction_allowed);
        }
        self.broadcast(message_type, &application)?;
        self.expire_application(student_id);
        info!("teacher interaction: application rejected student_id={student_id}");
        Ok(())
    }

    pub fn handle_application_canceled(&self, data: &InteractionData) -> bool {
        if self.core.is_expired(&data.session_id) {
            return false;
        }
        self.expire_application(&data.student_id);
        true
    }

    pub fn handle_application_succeed(&self, data: &InteractionData) -> bool {
        if self.core.is_expired(&data.session_id) {
            return false;
        }
        self.expire_application(&data.student_id);
        true
    }

    pub fn end_interaction(&self, student_id: &UserId) -> Result<(), ProtocolError> {
        self.check_role("end_interaction")?;
        self.notice(MessageType::TeacherEndInteraction, student_id.clone(), None)
    }

    pub fn end_all_interaction(&self) -> Result<(), ProtocolError> {
        self.check_role("end_all_interaction")?;
        self.notice(MessageType::TeacherEndAllInteraction, UserId::default(), None)
    }

    pub fn allow_end_interaction(&self, data: &InteractionData) -> Result<(), ProtocolError> {
        self.check_role("allow_end_interaction")?;
        self.broadcast(MessageType::StudentEndInteractionAllowed, data)
    }

    pub fn interaction_allowed(&self, allowed: bool) -> Result<(), ProtocolError> {
        self.check_role("interaction_allowed")?;
        self.state().status.interaction_allowed = allowed;
        self.notice(
            MessageType::InteractionAllowed,
            UserId::default(),
            Some(("allowed", json!(allowed))),
        )
    }

    pub fn all_mic_muted(&self, muted: bool) -> Result<(), ProtocolError> {
        self.check_role("all_mic_muted")?;
        self.notice(
            MessageType::AllMicMuted,
            UserId::default(),
            Some(("muted", json!(muted))),
        )
    }

    pub fn send_interaction_updated(&self, members: Vec<Value>) -> Result<(), ProtocolError> {
        self.check_role("send_interaction_updated")?;
        self.notice(
            MessageType::InteractionMemberUpdated,
            UserId::default(),
            Some(("data", Value::Array(members))),
        )
    }

    fn toggle(
        &self,
        message_type: MessageType,
        student_id: &UserId,
        turn_on: bool,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        let spec = SessionSpec {
            message_type,
            conflict: SessionQuery::by_type(message_type).receiver(student_id),
            receiver_id: student_id.clone(),
            flag: None,
        };
        let (session_id, machine) = self.core.start_session(spec, |session_id| {
            let data = self
                .data(session_id.clone(), student_id.clone())
                .with_extra("turnOn", turn_on);
            Ok(SessionMessages {
                request: self.core.message(message_type, None, &data)?,
                on_timeout: None,
            })
        })?;
        info!(
            "teacher interaction: toggle type={message_type} student_id={student_id} turn_on={turn_on} session_id={session_id}"
        );
        Ok(machine)
    }

    pub fn toggle_camera(
        &self,
        student_id: &UserId,
        turn_on: bool,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("toggle_camera")?;
        self.toggle(MessageType::ToggleCamera, student_id, turn_on)
    }

    pub fn toggle_mic(
        &self,
        student_id: &UserId,
        turn_on: bool,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("toggle_mic")?;
        self.toggle(MessageType::ToggleMic, student_id, turn_on)
    }

    pub fn handle_toggle_answered(
        &self,
        device: Device,
        data: &InteractionData,
    ) -> Result<Arc<StateMachine>, ProtocolError> {
        self.check_role("handle_toggle_answered")?;
        let failed = data.flag("failed").unwrap_or(false);
        let machine = self.core.resolve(
            "handle_toggle_answered",
            &data.session_id,
            MachineEvent::Responsed,
            Some(json!({ "failed": failed })),
        )?;
        self.emit(InteractionEvent::DeviceAnswered { device, failed });
        Ok(machine)
    }
}

#[async_trait]
impl MessageHandler for TeacherInteractionManager {
    fn component(&self) -> &'static str {
        self.core.component()
    }

    async fn handle_message(&self, event: &NormalizedEvent) -> Result<(), ProtocolError> {
        let message_type = event.message_type;
        match message_type {
            MessageType::AcceptedInteractionInvitation
            | MessageType::RejectedInteractionInvitation
            | MessageType::ToggleCameraAnswered
            | MessageType::ToggleMicAnswered => {
                let data: InteractionData = event.payload()?;
                // Answers to another teacher's sessions.
                if !self.core.owns_session(&data.session_id) {
                    return Ok(());
                }
                match message_type {
                    MessageType::AcceptedInteractionInvitation => {
                        self.handle_invitation_accepted(&data)?;
                    }
                    MessageType::RejectedInteractionInvitation => {
                        self.handle_invitation_rejected(&data)?;
                    }
                    MessageType::ToggleCameraAnswered => {
                        self.handle_toggle_answered(Device::Camera, &data)?;
                    }
                    _ => {
                        self.handle_toggle_answered(Device::Mic, &data)?;
                    }
                }
            }
            MessageType::InteractionApplication => {
                let data: InteractionData = event.payload()?;
                let status = self.status();
                if self.receive_application(&data, status)? {
                    self.emit(InteractionEvent::ApplicationReceived(data));
                }
            }
            MessageType::CancelInteractionApplication => {
                let data: InteractionData = event.payload()?;
                if self.handle_application_canceled(&data) {
                    self.emit(InteractionEvent::ApplicationCanceled {
                        student_id: data.student_id,
                    });
                }
            }
            MessageType::InteractionApplicationSucceed => {
                let data: InteractionData = event.payload()?;
                if self.handle_application_succeed(&data) {
                    self.emit(InteractionEvent::InteractionStarted(data));
                }
            }
            MessageType::StudentEndInteraction => {
                self.emit(InteractionEvent::EndingRequested(event.payload()?));
            }
            MessageType::MicChanged | MessageType::CameraChanged => {
                let data: InteractionData = event.payload()?;
                let device = if message_type == MessageType::MicChanged {
                    Device::Mic
                } else {
                    Device::Camera
                };
                self.emit(InteractionEvent::DeviceChanged {
                    opened: data.flag("opened").unwrap_or(false),
                    student_id: data.student_id,
                    device,
                });
            }
            _ => {}
        }
        Ok(())
    }
}
