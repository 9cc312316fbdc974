//! Teacher/assistant cooperation.
//!
//! Assistants cannot mute on their own account, so they ask the teacher's client to
//! do it: each request is a retried session on the assistant side, and the teacher
//! answers once per request, ignoring duplicates and late retries.

use shared::domain::{Permission, SessionId, UserId};

mod assistant;
mod teacher;

pub use assistant::{AssistantCooperationManager, MuteUserParams};
pub use teacher::TeacherCooperationManager;

/// Notifications surfaced to the UI by the cooperation managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooperationEvent {
    MuteUserRequested {
        session_id: SessionId,
        user_id: UserId,
        mute: bool,
    },
    MuteUserDone {
        user_id: UserId,
        success: bool,
    },
    MuteGroupRequested {
        session_id: SessionId,
        mute: bool,
    },
    MuteGroupDone {
        success: bool,
    },
    PermissionsSynced(Vec<Permission>),
    DocsUpdated {
        sender: Option<UserId>,
    },
}

#[cfg(test)]
#[path = "../tests/cooperation_tests.rs"]
mod tests;
