use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{GroupId, MessageId, Permission, SessionId, UserId, UserInfo};

macro_rules! message_types {
    ($($name:ident = $code:literal,)*) => {
        /// Numeric message type carried in the wire envelope.
        ///
        /// Codes are partitioned by concern: backend notifications (1000s), class
        /// lifecycle (10000s), membership (11000s), media and publish state (20000s),
        /// interaction coordination (30000s), cross-admin sync (40000s) and the
        /// mute-proxy delegation (400000s). Unknown codes round-trip as `Other`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "u32", into = "u32")]
        pub enum MessageType {
            $($name,)*
            Other(u32),
        }

        impl MessageType {
            pub fn code(self) -> u32 {
                match self {
                    $(MessageType::$name => $code,)*
                    MessageType::Other(code) => code,
                }
            }

            pub fn from_code(code: u32) -> Self {
                match code {
                    $($code => MessageType::$name,)*
                    other => MessageType::Other(other),
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)*
                    MessageType::Other(_) => "Other",
                }
            }
        }
    };
}

message_types! {
    PaaSLikeInfo = 1001,
    PaaSUserJoin = 1002,
    PaaSUserLeave = 1003,
    PaaSMuteGroup = 1004,
    PaaSCancelMuteGroup = 1005,
    PaaSMuteUser = 1006,
    PaaSCancelMuteUser = 1007,
    PaaSMuteUserListChange = 1008,
    PaaSGroupInfoChange = 1009,
    PaaSDeleteGroupMessage = 1010,

    Comment = 10001,
    ClassStart = 10003,
    ClassStop = 10004,
    ClassInfo = 10005,
    NoticeUpdate = 10006,

    KickMember = 11001,
    MemberListUpdated = 11002,

    MicChanged = 20007,
    CameraChanged = 20008,
    PublishInfoChanged = 21000,

    InteractionInvitation = 30001,
    CancelInteractionInvitation = 30002,
    AcceptedInteractionInvitation = 30003,
    RejectedInteractionInvitation = 30004,
    InteractionApplication = 30005,
    CancelInteractionApplication = 30006,
    AcceptedInteractionApplication = 30007,
    RejectedInteractionApplication = 30008,
    InteractionApplicationSucceed = 30009,
    TeacherEndInteraction = 30010,
    TeacherEndAllInteraction = 30011,
    StudentEndInteraction = 30012,
    StudentEndInteractionAllowed = 30013,
    InteractionAllowed = 30014,
    AllMicMuted = 30015,
    ToggleCamera = 30016,
    ToggleCameraAnswered = 30017,
    ToggleMic = 30018,
    ToggleMicAnswered = 30019,
    InteractionMemberUpdated = 30020,

    SyncAssistantPermissions = 40001,
    SyncDocsUpdated = 40002,

    RequestMuteUser = 400001,
    ResponseMuteUser = 400002,
    RequestMuteGroup = 400003,
    ResponseMuteGroup = 400004,
}

impl From<u32> for MessageType {
    fn from(value: u32) -> Self {
        MessageType::from_code(value)
    }
}

impl From<MessageType> for u32 {
    fn from(value: MessageType) -> Self {
        value.code()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Per-logical-message dedup token carried in `data.sid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(pub String);

impl Sid {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_audit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_mute_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_storage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_type: MessageType,
    pub skip_audit: bool,
    pub skip_mute_check: bool,
    pub no_storage: bool,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub data: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            skip_audit: false,
            skip_mute_check: false,
            no_storage: false,
            receiver_id: None,
            group_id: None,
            data: Map::new(),
        }
    }

    pub fn signal(message_type: MessageType) -> Self {
        let mut message = Self::new(message_type);
        message.skip_audit = true;
        message.skip_mute_check = true;
        message.no_storage = true;
        message
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.data = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(self)
    }

    pub fn to(mut self, receiver_id: UserId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    pub fn attach_sid(&mut self, sid: &Sid) {
        self.data
            .insert("sid".to_string(), Value::String(sid.0.clone()));
    }

    pub fn sid(&self) -> Option<&str> {
        self.data.get("sid").and_then(Value::as_str)
    }

    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            message_type: self.message_type,
            skip_audit: self.skip_audit.then_some(true),
            skip_mute_check: self.skip_mute_check.then_some(true),
            no_storage: self.no_storage.then_some(true),
            receiver_id: self.receiver_id.clone(),
            group_id: self.group_id.clone(),
            data: Value::Object(self.data.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_info: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl NormalizedEvent {
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        sender: &UserInfo,
        message_id: Option<MessageId>,
    ) -> Result<Self, serde_json::Error> {
        let data = if envelope.data.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&envelope.data)?
        };
        Ok(Self {
            message_type: envelope.message_type,
            data,
            group_id: envelope.group_id.clone(),
            sender_id: Some(sender.user_id.clone()),
            sender_info: Some(sender.clone()),
            message_id,
        })
    }

    pub fn system(message_type: MessageType, group_id: GroupId, sender: &str, data: Value) -> Self {
        Self {
            message_type,
            data,
            group_id: Some(group_id),
            sender_id: Some(UserId::new(sender)),
            sender_info: Some(UserInfo::system(sender)),
            message_id: None,
        }
    }

    pub fn sid(&self) -> Option<&str> {
        self.data.get("sid").and_then(Value::as_str)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteUserRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(default = "default_true")]
    pub mute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteGroupRequest {
    pub session_id: SessionId,
    #[serde(default = "default_true")]
    pub mute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteResponse {
    pub session_id: SessionId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSync {
    pub session_id: SessionId,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotice {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionData {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<UserId>,
    #[serde(default)]
    pub student_id: UserId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InteractionData {
    pub fn new(session_id: SessionId, student_id: UserId) -> Self {
        Self {
            session_id,
            teacher_id: None,
            student_id,
            extra: Map::new(),
        }
    }

    pub fn with_teacher(mut self, teacher_id: UserId) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }
}
