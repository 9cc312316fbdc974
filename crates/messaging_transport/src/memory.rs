//! In-process pub/sub backend.
//!
//! A [`MemoryHub`] plays the role of one vendor messaging service: it keeps group
//! membership, mute state and history, and pushes [`NormalizedEvent`]s to every
//! connected [`MemoryTransport`]. Payloads travel through the wire envelope so the
//! encoding path is the same one a network backend would use.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use shared::{
    domain::{GroupId, GroupMuteStatus, MessageId, UserId, UserInfo},
    protocol::{MessageType, NormalizedEvent, OutboundMessage},
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    MessagingTransport, TransportCapabilities, TransportCredentials, TransportKind,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct GroupState {
    owner: Option<UserId>,
    members: BTreeSet<UserId>,
    mute_all: bool,
    muted_users: BTreeSet<UserId>,
    history: Vec<NormalizedEvent>,
}

impl GroupState {
    fn mute_status(&self) -> GroupMuteStatus {
        GroupMuteStatus {
            mute_all: self.mute_all,
            mute_user_list: self.muted_users.iter().cloned().collect(),
        }
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<UserId, broadcast::Sender<NormalizedEvent>>,
    groups: HashMap<GroupId, GroupState>,
}

pub struct MemoryHub {
    kind: TransportKind,
    system_sender: String,
    next_message_id: AtomicU64,
    state: Mutex<HubState>,
}

impl MemoryHub {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            system_sender: format!("{kind}_system"),
            next_message_id: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn create_group(&self, group_id: &GroupId, owner: &UserId) {
        let mut state = lock(&self.state);
        let group = state.groups.entry(group_id.clone()).or_default();
        group.owner = Some(owner.clone());
    }

    pub fn mute_status(&self, group_id: &GroupId) -> Option<GroupMuteStatus> {
        let state = lock(&self.state);
        state.groups.get(group_id).map(GroupState::mute_status)
    }

    pub fn members(&self, group_id: &GroupId) -> Vec<UserId> {
        let state = lock(&self.state);
        state
            .groups
            .get(group_id)
            .map(|group| group.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn next_message_id(&self) -> MessageId {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        MessageId::new(format!("{}-{id}", self.kind))
    }

    fn register(&self, user_id: &UserId, sender: broadcast::Sender<NormalizedEvent>) {
        lock(&self.state).connections.insert(user_id.clone(), sender);
    }

    fn unregister(&self, user_id: &UserId) {
        lock(&self.state).connections.remove(user_id);
    }

    fn system_event(&self, message_type: MessageType, group_id: &GroupId, data: serde_json::Value) -> NormalizedEvent {
        NormalizedEvent::system(message_type, group_id.clone(), &self.system_sender, data)
    }

    fn notify(state: &HubState, recipients: impl IntoIterator<Item = UserId>, event: &NormalizedEvent) {
        for user_id in recipients {
            if let Some(sender) = state.connections.get(&user_id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn join(&self, group_id: &GroupId, user: &UserInfo) {
        let mut state = lock(&self.state);
        let group = state.groups.entry(group_id.clone()).or_default();
        if group.owner.is_none() {
            group.owner = Some(user.user_id.clone());
        }
        if !group.members.insert(user.user_id.clone()) {
            return;
        }
        let others: Vec<UserId> = group
            .members
            .iter()
            .filter(|member| **member != user.user_id)
            .cloned()
            .collect();
        let event = NormalizedEvent {
            sender_id: Some(user.user_id.clone()),
            sender_info: Some(user.clone()),
            ..self.system_event(MessageType::PaaSUserJoin, group_id, json!({ "user": user }))
        };
        Self::notify(&state, others, &event);
    }

    fn leave(&self, group_id: &GroupId, user: &UserInfo) {
        let mut state = lock(&self.state);
        let Some(group) = state.groups.get_mut(group_id) else {
            return;
        };
        if !group.members.remove(&user.user_id) {
            return;
        }
        let others: Vec<UserId> = group.members.iter().cloned().collect();
        let event = NormalizedEvent {
            sender_id: Some(user.user_id.clone()),
            sender_info: Some(user.clone()),
            ..self.system_event(MessageType::PaaSUserLeave, group_id, json!({ "user": user }))
        };
        Self::notify(&state, others, &event);
    }

    fn check_owner(&self, group: &GroupState, actor: &UserId) -> Result<()> {
        if group.owner.as_ref() != Some(actor) {
            bail!("{}: user {actor} is not allowed to change mute state", self.kind);
        }
        Ok(())
    }

    fn set_mute_all(&self, group_id: &GroupId, actor: &UserId, mute_all: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("{}: unknown group {group_id}", self.kind))?;
        self.check_owner(group, actor)?;
        group.mute_all = mute_all;
        let status = group.mute_status();
        let members: Vec<UserId> = group.members.iter().cloned().collect();
        let message_type = if mute_all {
            MessageType::PaaSMuteGroup
        } else {
            MessageType::PaaSCancelMuteGroup
        };
        let event = self.system_event(message_type, group_id, json!({ "status": status }));
        Self::notify(&state, members, &event);
        Ok(())
    }

    fn set_user_muted(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        target: &UserId,
        muted: bool,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("{}: unknown group {group_id}", self.kind))?;
        self.check_owner(group, actor)?;
        let changed = if muted {
            group.muted_users.insert(target.clone())
        } else {
            group.muted_users.remove(target)
        };
        let mute_user_list: Vec<UserId> = group.muted_users.iter().cloned().collect();
        let members: Vec<UserId> = group.members.iter().cloned().collect();
        if !changed {
            return Ok(());
        }

        let message_type = if muted {
            MessageType::PaaSMuteUser
        } else {
            MessageType::PaaSCancelMuteUser
        };
        let target_event = self.system_event(message_type, group_id, json!({ "userId": target }));
        Self::notify(&state, [target.clone()], &target_event);

        let list_event = self.system_event(
            MessageType::PaaSMuteUserListChange,
            group_id,
            json!({ "muteUserList": mute_user_list }),
        );
        Self::notify(&state, members, &list_event);
        Ok(())
    }

    fn deliver(
        &self,
        group_id: &GroupId,
        sender: &UserInfo,
        message: &OutboundMessage,
    ) -> Result<()> {
        let envelope = message.to_envelope();
        let mut state = lock(&self.state);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("{}: unknown group {group_id}", self.kind))?;
        if !group.members.contains(&sender.user_id) {
            bail!("{}: user {} has not joined {group_id}", self.kind, sender.user_id);
        }
        let is_owner = group.owner.as_ref() == Some(&sender.user_id);
        if !message.skip_mute_check && !is_owner {
            if group.mute_all {
                bail!("{}: group {group_id} is muted", self.kind);
            }
            if group.muted_users.contains(&sender.user_id) {
                bail!("{}: user {} is muted", self.kind, sender.user_id);
            }
        }

        let event = NormalizedEvent::from_envelope(&envelope, sender, Some(self.next_message_id()))?;
        if !message.no_storage {
            group.history.push(event.clone());
        }

        let recipients: Vec<UserId> = match &message.receiver_id {
            Some(receiver) => {
                if !group.members.contains(receiver) {
                    bail!("{}: receiver {receiver} has not joined {group_id}", self.kind);
                }
                vec![receiver.clone()]
            }
            None => group
                .members
                .iter()
                .filter(|member| **member != sender.user_id)
                .cloned()
                .collect(),
        };
        debug!(
            "memory hub: deliver kind={} type={} recipients={}",
            self.kind,
            message.message_type,
            recipients.len()
        );
        Self::notify(&state, recipients, &event);
        Ok(())
    }

    fn history(&self, group_id: &GroupId, message_type: MessageType) -> Vec<NormalizedEvent> {
        let state = lock(&self.state);
        state
            .groups
            .get(group_id)
            .map(|group| {
                group
                    .history
                    .iter()
                    .filter(|event| event.message_type == message_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct ConnectionState {
    initialized: bool,
    user: Option<UserInfo>,
    group: Option<GroupId>,
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    capabilities: TransportCapabilities,
    credentials: Mutex<Option<TransportCredentials>>,
    connection: Mutex<ConnectionState>,
    events: broadcast::Sender<NormalizedEvent>,
    fail_sends: AtomicBool,
    fail_identity: AtomicBool,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Arc<Self> {
        Self::with_capabilities(hub, TransportCapabilities::default())
    }

    pub fn with_capabilities(hub: Arc<MemoryHub>, capabilities: TransportCapabilities) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            hub,
            capabilities,
            credentials: Mutex::new(None),
            connection: Mutex::new(ConnectionState::default()),
            events,
            fail_sends: AtomicBool::new(false),
            fail_identity: AtomicBool::new(false),
        })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_identity(&self, fail: bool) {
        self.fail_identity.store(fail, Ordering::SeqCst);
    }

    pub fn inject(&self, event: NormalizedEvent) {
        let _ = self.events.send(event);
    }

    fn logged_in_user(&self) -> Result<UserInfo> {
        lock(&self.connection)
            .user
            .clone()
            .ok_or_else(|| anyhow!("{}: not logged in", self.hub.kind))
    }

    fn joined(&self) -> Result<(UserInfo, GroupId)> {
        let connection = lock(&self.connection);
        let user = connection
            .user
            .clone()
            .ok_or_else(|| anyhow!("{}: not logged in", self.hub.kind))?;
        let group = connection
            .group
            .clone()
            .ok_or_else(|| anyhow!("{}: no joined group", self.hub.kind))?;
        Ok((user, group))
    }

    fn ensure_native_mute(&self) -> Result<()> {
        if !self.capabilities.native_mute {
            bail!("{}: native mute is not supported", self.hub.kind);
        }
        Ok(())
    }

    fn ensure_send_allowed(&self) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("{}: send rejected by backend", self.hub.kind);
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingTransport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.hub.kind
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn set_credentials(&self, credentials: TransportCredentials) {
        *lock(&self.credentials) = Some(credentials);
    }

    fn joined_group(&self) -> Option<GroupId> {
        lock(&self.connection).group.clone()
    }

    async fn init(&self) -> Result<()> {
        lock(&self.connection).initialized = true;
        Ok(())
    }

    async fn un_init(&self) -> Result<()> {
        lock(&self.connection).initialized = false;
        Ok(())
    }

    async fn login(&self, user: &UserInfo) -> Result<()> {
        if self.fail_identity.load(Ordering::SeqCst) {
            bail!("{}: login rejected by backend", self.hub.kind);
        }
        let has_token = lock(&self.credentials)
            .as_ref()
            .is_some_and(|credentials| !credentials.token.is_empty());
        if !has_token {
            bail!("{}: please set config first", self.hub.kind);
        }
        self.hub.register(&user.user_id, self.events.clone());
        lock(&self.connection).user = Some(user.clone());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        if self.fail_identity.load(Ordering::SeqCst) {
            bail!("{}: logout rejected by backend", self.hub.kind);
        }
        let user = lock(&self.connection).user.take();
        if let Some(user) = user {
            self.hub.unregister(&user.user_id);
        }
        Ok(())
    }

    async fn join_group(&self, group_id: &GroupId) -> Result<()> {
        let user = self.logged_in_user()?;
        self.hub.join(group_id, &user);
        lock(&self.connection).group = Some(group_id.clone());
        Ok(())
    }

    async fn leave_group(&self) -> Result<()> {
        let (user, group) = {
            let mut connection = lock(&self.connection);
            let Some(group) = connection.group.take() else {
                return Ok(());
            };
            (connection.user.clone(), group)
        };
        if let Some(user) = user {
            self.hub.leave(&group, &user);
        }
        Ok(())
    }

    async fn mute_group(&self) -> Result<()> {
        self.ensure_native_mute()?;
        let (user, group) = self.joined()?;
        self.hub.set_mute_all(&group, &user.user_id, true)
    }

    async fn cancel_mute_group(&self) -> Result<()> {
        self.ensure_native_mute()?;
        let (user, group) = self.joined()?;
        self.hub.set_mute_all(&group, &user.user_id, false)
    }

    async fn mute_user(&self, user_id: &UserId) -> Result<()> {
        self.ensure_native_mute()?;
        let (user, group) = self.joined()?;
        self.hub.set_user_muted(&group, &user.user_id, user_id, true)
    }

    async fn cancel_mute_user(&self, user_id: &UserId) -> Result<()> {
        self.ensure_native_mute()?;
        let (user, group) = self.joined()?;
        self.hub.set_user_muted(&group, &user.user_id, user_id, false)
    }

    async fn send_message_to_group(&self, message: &OutboundMessage) -> Result<()> {
        self.ensure_send_allowed()?;
        let (user, group) = self.joined()?;
        let mut message = message.clone();
        message.receiver_id = None;
        self.hub.deliver(&group, &user, &message)
    }

    async fn send_message_to_group_user(&self, message: &OutboundMessage) -> Result<()> {
        self.ensure_send_allowed()?;
        if message.receiver_id.is_none() {
            bail!("{}: need receiverId", self.hub.kind);
        }
        let (user, group) = self.joined()?;
        self.hub.deliver(&group, &user, message)
    }

    async fn list_messages(&self, message_type: MessageType) -> Result<Vec<NormalizedEvent>> {
        if !self.capabilities.message_history {
            bail!("{}: message history is not supported", self.hub.kind);
        }
        let (_, group) = self.joined()?;
        Ok(self.hub.history(&group, message_type))
    }

    async fn query_mute_group(&self) -> Result<GroupMuteStatus> {
        let (_, group) = self.joined()?;
        self.hub
            .mute_status(&group)
            .ok_or_else(|| anyhow!("{}: unknown group {group}", self.hub.kind))
    }

    async fn query_muted_users(&self) -> Result<Vec<UserId>> {
        Ok(self.query_mute_group().await?.mute_user_list)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NormalizedEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
