use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);
id_newtype!(SessionId);

/// Classroom identity of the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

/// Capabilities a teacher may grant to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    SwitchClassStatus,
    AttendanceManagement,
    MemberManagement,
    DrawWhiteboard,
    Courceware,
    RemoveGroupMessage,
    EditAnnouncement,
    MuteUser,
    MuteGroup,
    InteractionManagement,
    ScreenShare,
    LocalMediaShare,
    JoinInteraction,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: UserId,
    #[serde(default)]
    pub user_nick: String,
    #[serde(default)]
    pub user_avatar: String,
}

impl UserInfo {
    pub fn new(user_id: impl Into<UserId>, user_nick: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_nick: user_nick.into(),
            user_avatar: String::new(),
        }
    }

    /// Sender info used for notifications synthesized by a backend rather than a peer.
    pub fn system(label: &str) -> Self {
        Self {
            user_id: UserId::new(label),
            user_nick: String::new(),
            user_avatar: String::new(),
        }
    }
}

/// Mute state of the joined group as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMuteStatus {
    pub mute_all: bool,
    #[serde(default)]
    pub mute_user_list: Vec<UserId>,
}
