use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{GroupId, UserId};
use tracing::info;
use url::Url;

/// Persisted mute state, queried when a messaging backend cannot answer.
#[async_trait]
pub trait MuteStateService: Send + Sync {
    async fn is_mute_chatroom(&self, group_id: &GroupId) -> Result<bool>;
}

#[derive(Debug, Serialize)]
struct ChatroomRequest<'a> {
    chatroom_id: &'a str,
    server_type: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatroomUserRequest<'a> {
    chatroom_id: &'a str,
    server_type: &'a str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    minute: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    result: bool,
}

/// HTTP client for the application server's chatroom mute endpoints.
pub struct AppServerClient {
    http: reqwest::Client,
    base_url: Url,
    server_type: String,
}

impl AppServerClient {
    pub fn new(base_url: &str, server_type: impl Into<String>) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid app server url: {base_url}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            server_type: server_type.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid app server path: {path}"))
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<bool> {
        let url = self.endpoint(path)?;
        let response: ResultResponse = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.result)
    }

    pub async fn is_mute_chatroom(&self, group_id: &GroupId) -> Result<bool> {
        self.post(
            "isMuteChatroom",
            &ChatroomRequest {
                chatroom_id: group_id.as_str(),
                server_type: &self.server_type,
            },
        )
        .await
    }

    pub async fn mute_chatroom(&self, group_id: &GroupId) -> Result<bool> {
        info!("app server: mute chatroom group_id={group_id}");
        self.post(
            "muteChatroom",
            &ChatroomRequest {
                chatroom_id: group_id.as_str(),
                server_type: &self.server_type,
            },
        )
        .await
    }

    pub async fn cancel_mute_chatroom(&self, group_id: &GroupId) -> Result<bool> {
        info!("app server: cancel mute chatroom group_id={group_id}");
        self.post(
            "cancelMuteChatroom",
            &ChatroomRequest {
                chatroom_id: group_id.as_str(),
                server_type: &self.server_type,
            },
        )
        .await
    }

    pub async fn mute_user(&self, group_id: &GroupId, user_id: &UserId, minutes: u32) -> Result<bool> {
        info!("app server: mute user group_id={group_id} user_id={user_id} minutes={minutes}");
        self.post(
            "muteUser",
            &ChatroomUserRequest {
                chatroom_id: group_id.as_str(),
                server_type: &self.server_type,
                user_id: user_id.as_str(),
                minute: Some(minutes),
            },
        )
        .await
    }

    pub async fn cancel_mute_user(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        info!("app server: cancel mute user group_id={group_id} user_id={user_id}");
        self.post(
            "cancelMuteUser",
            &ChatroomUserRequest {
                chatroom_id: group_id.as_str(),
                server_type: &self.server_type,
                user_id: user_id.as_str(),
                minute: None,
            },
        )
        .await
    }
}

#[async_trait]
impl MuteStateService for AppServerClient {
    async fn is_mute_chatroom(&self, group_id: &GroupId) -> Result<bool> {
        AppServerClient::is_mute_chatroom(self, group_id).await
    }
}

#[cfg(test)]
#[path = "tests/app_server_tests.rs"]
mod tests;
