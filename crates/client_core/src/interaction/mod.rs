//! Stage interactions ("co-hosting").
//!
//! The teacher invites students and answers their applications; students apply, accept
//! or reject invitations and answer remote device toggles. All interaction messages
//! are broadcast to the group and carry an [`InteractionData`] payload, so every
//! inbound handler first checks that the message concerns its own user or session.

use serde_json::Value;
use shared::{
    domain::{SessionId, UserId},
    protocol::InteractionData,
};

mod student;
mod teacher;

pub use student::StudentInteractionManager;
pub use teacher::TeacherInteractionManager;

/// Classroom conditions the teacher checks before taking an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionStatus {
    pub full: bool,
    pub interaction_allowed: bool,
}

impl Default for InteractionStatus {
    fn default() -> Self {
        Self {
            full: false,
            interaction_allowed: true,
        }
    }
}

/// Local media state a student reports while interacting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStatus {
    pub mic_opened: bool,
    pub camera_opened: bool,
    pub rtc_pull_url: Option<String>,
}

impl MediaStatus {
    fn apply(&self, data: InteractionData) -> InteractionData {
        let data = data
            .with_extra("micOpened", self.mic_opened)
            .with_extra("cameraOpened", self.camera_opened);
        match &self.rtc_pull_url {
            Some(url) => data.with_extra("rtcPullUrl", url.clone()),
            None => data,
        }
    }
}

/// Which remote device a toggle session controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Camera,
    Mic,
}

/// Notifications surfaced to the UI by the interaction managers.
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionEvent {
    InvitationReceived(InteractionData),
    InvitationCanceled { session_id: SessionId },
    InvitationAccepted(InteractionData),
    InvitationRejected(InteractionData),
    ApplicationReceived(InteractionData),
    ApplicationCanceled { student_id: UserId },
    ApplicationAccepted(InteractionData),
    ApplicationRejected {
        session_id: SessionId,
        full: bool,
        interaction_allowed: bool,
    },
    InteractionStarted(InteractionData),
    EndingRequested(InteractionData),
    EndingAllowed { session_id: SessionId },
    InteractionEnded { student_id: Option<UserId> },
    InteractionAllowed(bool),
    AllMicMuted(bool),
    DeviceControl { device: Device, turn_on: bool },
    DeviceAnswered { device: Device, failed: bool },
    DeviceChanged {
        student_id: UserId,
        device: Device,
        opened: bool,
    },
    MembersUpdated(Vec<Value>),
}

#[cfg(test)]
#[path = "../tests/interaction_tests.rs"]
mod tests;
