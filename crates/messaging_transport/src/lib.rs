use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GroupId, GroupMuteStatus, UserId, UserInfo},
    protocol::{MessageType, NormalizedEvent, OutboundMessage},
};
use tokio::sync::broadcast;

pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    AliyunImV1,
    AliyunImV2,
    RongCloud,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::AliyunImV1 => "aliyun_im_v1",
            TransportKind::AliyunImV2 => "aliyun_im_v2",
            TransportKind::RongCloud => "rong_cloud",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub native_mute: bool,
    pub message_history: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            native_mute: true,
            message_history: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportCredentials {
    pub token: String,
}

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn capabilities(&self) -> TransportCapabilities;
    fn set_credentials(&self, credentials: TransportCredentials);
    fn joined_group(&self) -> Option<GroupId>;
    async fn init(&self) -> anyhow::Result<()>;
    async fn un_init(&self) -> anyhow::Result<()>;
    async fn login(&self, user: &UserInfo) -> anyhow::Result<()>;
    async fn logout(&self) -> anyhow::Result<()>;
    async fn join_group(&self, group_id: &GroupId) -> anyhow::Result<()>;
    async fn leave_group(&self) -> anyhow::Result<()>;
    async fn mute_group(&self) -> anyhow::Result<()>;
    async fn cancel_mute_group(&self) -> anyhow::Result<()>;
    async fn mute_user(&self, user_id: &UserId) -> anyhow::Result<()>;
    async fn cancel_mute_user(&self, user_id: &UserId) -> anyhow::Result<()>;
    async fn send_message_to_group(&self, message: &OutboundMessage) -> anyhow::Result<()>;
    async fn send_message_to_group_user(&self, message: &OutboundMessage) -> anyhow::Result<()>;
    async fn list_messages(&self, message_type: MessageType)
        -> anyhow::Result<Vec<NormalizedEvent>>;
    async fn query_mute_group(&self) -> anyhow::Result<GroupMuteStatus>;
    async fn query_muted_users(&self) -> anyhow::Result<Vec<UserId>>;
    fn subscribe_events(&self) -> broadcast::Receiver<NormalizedEvent>;
}
