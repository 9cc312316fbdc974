use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, RwLock, Weak},
};

use messaging_transport::{MessagingTransport, TransportCredentials, TransportKind};
use serde::Deserialize;
use shared::{
    domain::{GroupId, GroupMuteStatus, UserId, UserInfo},
    protocol::{MessageType, NormalizedEvent, OutboundMessage, Sid},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    app_server::MuteStateService,
    dedup::SeenSet,
    error::RouterError,
    fanout::{fan_out, FanoutPolicy, FanoutReport},
};

pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterEventKind {
    JoinGroup,
    LeaveGroup,
    MuteGroup,
    UnmuteGroup,
    MuteUser,
    UnmuteUser,
    MuteUserListChange,
    LikeInfo,
    GroupInfoChange,
    GroupMessageDeleted,
    MessageReceived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterEvent {
    pub kind: RouterEventKind,
    pub event: NormalizedEvent,
}

pub struct TransportBinding {
    pub transport: Arc<dyn MessagingTransport>,
    pub primary: bool,
}

impl TransportBinding {
    pub fn new(transport: Arc<dyn MessagingTransport>) -> Self {
        Self {
            transport,
            primary: false,
        }
    }

    pub fn primary(transport: Arc<dyn MessagingTransport>) -> Self {
        Self {
            transport,
            primary: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupIdSet {
    fallback: Option<GroupId>,
    per_kind: HashMap<TransportKind, GroupId>,
}

impl GroupIdSet {
    pub fn uniform(group_id: impl Into<GroupId>) -> Self {
        Self {
            fallback: Some(group_id.into()),
            per_kind: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: TransportKind, group_id: impl Into<GroupId>) -> Self {
        self.per_kind.insert(kind, group_id.into());
        self
    }

    pub fn get(&self, kind: TransportKind) -> Option<&GroupId> {
        self.per_kind.get(&kind).or(self.fallback.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub token: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    pub dedup_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub sid: Sid,
    pub report: FanoutReport,
}

struct InboundState {
    seen: SeenSet<String>,
    group_muted: Option<bool>,
    self_muted: Option<bool>,
    mute_user_list: Option<BTreeSet<UserId>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MuteUserListPayload {
    #[serde(default)]
    mute_user_list: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MuteUserPayload {
    user_id: Option<UserId>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every configured backend and presents them as one messaging channel.
pub struct MessageRouter {
    transports: RwLock<Vec<Arc<dyn MessagingTransport>>>,
    primary: Mutex<Option<TransportKind>>,
    config: Mutex<Option<RouterConfig>>,
    local_user: Mutex<Option<UserInfo>>,
    group_ids: Mutex<Option<GroupIdSet>>,
    inbound: Mutex<InboundState>,
    mute_service: Option<Arc<dyn MuteStateService>>,
    pumps: Mutex<Vec<(TransportKind, JoinHandle<()>)>>,
    events: broadcast::Sender<RouterEvent>,
}

impl MessageRouter {
    pub fn new(bindings: Vec<TransportBinding>, options: RouterOptions) -> Arc<Self> {
        Self::build(bindings, options, None)
    }

    pub fn with_mute_service(
        bindings: Vec<TransportBinding>,
        options: RouterOptions,
        mute_service: Arc<dyn MuteStateService>,
    ) -> Arc<Self> {
        Self::build(bindings, options, Some(mute_service))
    }

    fn build(
        bindings: Vec<TransportBinding>,
        options: RouterOptions,
        mute_service: Option<Arc<dyn MuteStateService>>,
    ) -> Arc<Self> {
        let primary = bindings
            .iter()
            .find(|binding| binding.primary)
            .or_else(|| bindings.first())
            .map(|binding| binding.transport.kind());
        let transports = bindings.into_iter().map(|binding| binding.transport).collect();
        let (events, _) = broadcast::channel(options.event_channel_capacity.max(1));

        Arc::new(Self {
            transports: RwLock::new(transports),
            primary: Mutex::new(primary),
            config: Mutex::new(None),
            local_user: Mutex::new(None),
            group_ids: Mutex::new(None),
            inbound: Mutex::new(InboundState {
                seen: SeenSet::new(options.dedup_capacity),
                group_muted: None,
                self_muted: None,
                mute_user_list: None,
            }),
            mute_service,
            pumps: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let transports = self.snapshot();
        let mut pumps = lock(&self.pumps);
        for transport in transports {
            let kind = transport.kind();
            if pumps.iter().any(|(running, _)| *running == kind) {
                continue;
            }
            let router: Weak<Self> = Arc::downgrade(self);
            let mut stream = BroadcastStream::new(transport.subscribe_events());
            let handle = tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    let Some(router) = router.upgrade() else {
                        break;
                    };
                    match item {
                        Ok(event) => router.handle_inbound(event),
                        Err(err) => warn!("router: inbound stream lagged on transport={kind}: {err}"),
                    }
                }
                debug!("router: inbound pump stopped transport={kind}");
            });
            pumps.push((kind, handle));
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.snapshot().iter().map(|transport| transport.kind()).collect()
    }

    pub fn primary_kind(&self) -> Option<TransportKind> {
        *lock(&self.primary)
    }

    pub fn local_user(&self) -> Option<UserInfo> {
        lock(&self.local_user).clone()
    }

    pub fn joined_group(&self) -> Option<GroupId> {
        let primary = self.primary_transport().ok()?;
        primary.joined_group().or_else(|| {
            lock(&self.group_ids)
                .as_ref()
                .and_then(|ids| ids.get(primary.kind()).cloned())
        })
    }

    fn snapshot(&self) -> Vec<Arc<dyn MessagingTransport>> {
        self.transports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn non_empty_snapshot(&self) -> Result<Vec<Arc<dyn MessagingTransport>>, RouterError> {
        let transports = self.snapshot();
        if transports.is_empty() {
            return Err(RouterError::NoTransports);
        }
        Ok(transports)
    }

    fn primary_transport(&self) -> Result<Arc<dyn MessagingTransport>, RouterError> {
        let primary = self.primary_kind().ok_or(RouterError::NoTransports)?;
        self.snapshot()
            .into_iter()
            .find(|transport| transport.kind() == primary)
            .ok_or(RouterError::NoTransports)
    }

    pub fn set_config(&self, config: RouterConfig) {
        for transport in self.snapshot() {
            transport.set_credentials(TransportCredentials {
                token: config.token.clone(),
            });
        }
        *lock(&self.config) = Some(config);
    }

    pub async fn init(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        fan_out("init", FanoutPolicy::All, &transports, |transport| async move {
            transport.init().await
        })
        .await
        .into_result()
    }

    pub async fn un_init(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        let report = fan_out("un_init", FanoutPolicy::All, &transports, |transport| async move {
            transport.un_init().await
        })
        .await;
        for (_, pump) in lock(&self.pumps).drain(..) {
            pump.abort();
        }
        report.into_result()
    }

    pub async fn login(&self, user: &UserInfo) -> Result<FanoutReport, RouterError> {
        if lock(&self.config).is_none() {
            return Err(RouterError::MissingConfig);
        }
        let transports = self.non_empty_snapshot()?;
        info!("router: login user_id={} transports={}", user.user_id, transports.len());
        let report = fan_out("login", FanoutPolicy::All, &transports, |transport| {
            let user = user.clone();
            async move { transport.login(&user).await }
        })
        .await
        .into_result()?;
        *lock(&self.local_user) = Some(user.clone());
        Ok(report)
    }

    pub async fn logout(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        let report = fan_out("logout", FanoutPolicy::All, &transports, |transport| async move {
            transport.logout().await
        })
        .await
        .into_result()?;
        *lock(&self.local_user) = None;
        Ok(report)
    }

    pub async fn join_group(&self, group_ids: &GroupIdSet) -> Result<FanoutReport, RouterError> {
        let transports: Vec<_> = self
            .non_empty_snapshot()?
            .into_iter()
            .filter(|transport| group_ids.get(transport.kind()).is_some())
            .collect();
        if transports.is_empty() {
            return Err(RouterError::Validation(
                "no group id for any configured transport".into(),
            ));
        }
        let report = fan_out("join_group", FanoutPolicy::All, &transports, |transport| {
            let group_id = group_ids.get(transport.kind()).cloned().unwrap_or_default();
            async move { transport.join_group(&group_id).await }
        })
        .await
        .into_result()?;
        *lock(&self.group_ids) = Some(group_ids.clone());
        self.seed_mute_state().await;
        Ok(report)
    }

    async fn seed_mute_state(&self) {
        let status = match self.query_mute_group().await {
            Ok(status) => status,
            Err(err) => {
                debug!("router: mute state unknown after join: {err}");
                return;
            }
        };
        let local_user = lock(&self.local_user)
            .as_ref()
            .map(|user| user.user_id.clone());
        let mut inbound = lock(&self.inbound);
        inbound.group_muted = Some(status.mute_all);
        if let Some(local) = local_user {
            inbound.self_muted = Some(status.mute_user_list.contains(&local));
        }
    }

    pub async fn leave_group(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        let report = fan_out("leave_group", FanoutPolicy::All, &transports, |transport| async move {
            transport.leave_group().await
        })
        .await
        .into_result()?;
        *lock(&self.group_ids) = None;
        let mut inbound = lock(&self.inbound);
        inbound.group_muted = None;
        inbound.self_muted = None;
        Ok(report)
    }

    pub async fn mute_group(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        fan_out("mute_group", FanoutPolicy::Any, &transports, |transport| async move {
            transport.mute_group().await
        })
        .await
        .into_result()
    }

    pub async fn cancel_mute_group(&self) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        fan_out("cancel_mute_group", FanoutPolicy::Any, &transports, |transport| async move {
            transport.cancel_mute_group().await
        })
        .await
        .into_result()
    }

    pub async fn mute_user(&self, user_id: &UserId) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        fan_out("mute_user", FanoutPolicy::Any, &transports, |transport| {
            let user_id = user_id.clone();
            async move { transport.mute_user(&user_id).await }
        })
        .await
        .into_result()
    }

    pub async fn cancel_mute_user(&self, user_id: &UserId) -> Result<FanoutReport, RouterError> {
        let transports = self.non_empty_snapshot()?;
        fan_out("cancel_mute_user", FanoutPolicy::Any, &transports, |transport| {
            let user_id = user_id.clone();
            async move { transport.cancel_mute_user(&user_id).await }
        })
        .await
        .into_result()
    }

    pub async fn send_message_to_group(
        &self,
        mut message: OutboundMessage,
    ) -> Result<SendReceipt, RouterError> {
        let transports = self.non_empty_snapshot()?;
        let sid = Sid::generate();
        message.attach_sid(&sid);
        debug!("router: send type={} sid={sid}", message.message_type);
        let report = fan_out("send_message_to_group", FanoutPolicy::Any, &transports, |transport| {
            let message = message.clone();
            async move { transport.send_message_to_group(&message).await }
        })
        .await
        .into_result()?;
        Ok(SendReceipt { sid, report })
    }

    pub async fn send_group_signal(
        &self,
        mut message: OutboundMessage,
    ) -> Result<SendReceipt, RouterError> {
        message.skip_audit = true;
        message.skip_mute_check = true;
        message.no_storage = true;
        self.send_message_to_group(message).await
    }

    pub async fn send_message_to_group_user(
        &self,
        mut message: OutboundMessage,
    ) -> Result<SendReceipt, RouterError> {
        let Some(receiver) = message.receiver_id.clone() else {
            return Err(RouterError::Validation("need receiverId".into()));
        };
        let transports = self.non_empty_snapshot()?;
        let sid = Sid::generate();
        message.attach_sid(&sid);
        debug!(
            "router: send type={} receiver={receiver} sid={sid}",
            message.message_type
        );
        let report = fan_out(
            "send_message_to_group_user",
            FanoutPolicy::Any,
            &transports,
            |transport| {
                let message = message.clone();
                async move { transport.send_message_to_group_user(&message).await }
            },
        )
        .await
        .into_result()?;
        Ok(SendReceipt { sid, report })
    }

    pub async fn list_message(
        &self,
        message_type: MessageType,
    ) -> Result<Vec<NormalizedEvent>, RouterError> {
        let primary = self.primary_transport()?;
        primary
            .list_messages(message_type)
            .await
            .map_err(|err| RouterError::Primary {
                kind: primary.kind().to_string(),
                message: format!("{err:#}"),
            })
    }

    pub async fn query_mute_group(&self) -> Result<GroupMuteStatus, RouterError> {
        let primary = self.primary_transport()?;
        let err = match primary.query_mute_group().await {
            Ok(status) => return Ok(status),
            Err(err) => err,
        };
        let primary_error = RouterError::Primary {
            kind: primary.kind().to_string(),
            message: format!("{err:#}"),
        };
        let (Some(service), Some(group_id)) = (&self.mute_service, self.joined_group()) else {
            return Err(primary_error);
        };
        warn!(
            "router: query_mute_group failed on transport={}, falling back to app server: {err:#}",
            primary.kind()
        );
        match service.is_mute_chatroom(&group_id).await {
            Ok(mute_all) => Ok(GroupMuteStatus {
                mute_all,
                mute_user_list: Vec::new(),
            }),
            Err(fallback_err) => {
                warn!("router: app server mute query failed group_id={group_id}: {fallback_err:#}");
                Err(primary_error)
            }
        }
    }

    pub async fn query_muted_user_list(&self) -> Result<Vec<UserId>, RouterError> {
        let primary = self.primary_transport()?;
        primary
            .query_muted_users()
            .await
            .map_err(|err| RouterError::Primary {
                kind: primary.kind().to_string(),
                message: format!("{err:#}"),
            })
    }

    pub fn remove_transports(&self, kinds: &[TransportKind]) {
        let remaining: Vec<TransportKind> = {
            let mut transports = self
                .transports
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            transports.retain(|transport| !kinds.contains(&transport.kind()));
            transports.iter().map(|transport| transport.kind()).collect()
        };
        lock(&self.pumps).retain(|(kind, pump)| {
            let keep = !kinds.contains(kind);
            if !keep {
                pump.abort();
            }
            keep
        });

        let mut primary = lock(&self.primary);
        if primary.map_or(true, |kind| kinds.contains(&kind)) {
            *primary = remaining.first().copied();
            info!("router: primary transport re-elected primary={primary:?}");
        }
    }

    pub fn handle_inbound(&self, event: NormalizedEvent) {
        let local_user = lock(&self.local_user)
            .as_ref()
            .map(|user| user.user_id.clone());
        let classified = {
            let mut inbound = lock(&self.inbound);
            if let Some(sid) = event.sid() {
                if !inbound.seen.insert(sid.to_string()) {
                    debug!("router: dropped duplicate sid={sid} type={}", event.message_type);
                    return;
                }
            }
            classify(&mut inbound, local_user.as_ref(), &event)
        };
        for kind in classified {
            let _ = self.events.send(RouterEvent {
                kind,
                event: event.clone(),
            });
        }
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        if let Ok(mut pumps) = self.pumps.lock() {
            for (_, pump) in pumps.drain(..) {
                pump.abort();
            }
        }
    }
}

fn classify(
    inbound: &mut InboundState,
    local_user: Option<&UserId>,
    event: &NormalizedEvent,
) -> Vec<RouterEventKind> {
    match event.message_type {
        MessageType::PaaSUserJoin => vec![RouterEventKind::JoinGroup],
        MessageType::PaaSUserLeave => vec![RouterEventKind::LeaveGroup],
        MessageType::PaaSLikeInfo => vec![RouterEventKind::LikeInfo],
        MessageType::PaaSGroupInfoChange => vec![RouterEventKind::GroupInfoChange],
        MessageType::PaaSDeleteGroupMessage => vec![RouterEventKind::GroupMessageDeleted],
        MessageType::PaaSMuteGroup => group_mute_edge(inbound, true),
        MessageType::PaaSCancelMuteGroup => group_mute_edge(inbound, false),
        MessageType::PaaSMuteUser | MessageType::PaaSCancelMuteUser => {
            let muted = event.message_type == MessageType::PaaSMuteUser;
            let target = event
                .payload::<MuteUserPayload>()
                .ok()
                .and_then(|payload| payload.user_id);
            match (target, local_user) {
                (Some(target), Some(local)) if target != *local => Vec::new(),
                _ => self_mute_edge(inbound, muted),
            }
        }
        MessageType::PaaSMuteUserListChange => {
            let list: BTreeSet<UserId> = event
                .payload::<MuteUserListPayload>()
                .map(|payload| payload.mute_user_list.into_iter().collect())
                .unwrap_or_default();
            let mut kinds = Vec::new();
            if let Some(local) = local_user {
                let muted = list.contains(local);
                if muted || inbound.self_muted.is_some() {
                    kinds.extend(self_mute_edge(inbound, muted));
                }
            }
            if inbound.mute_user_list.as_ref() != Some(&list) {
                inbound.mute_user_list = Some(list);
                kinds.push(RouterEventKind::MuteUserListChange);
            }
            kinds
        }
        _ => vec![RouterEventKind::MessageReceived],
    }
}

fn group_mute_edge(inbound: &mut InboundState, muted: bool) -> Vec<RouterEventKind> {
    if inbound.group_muted == Some(muted) {
        return Vec::new();
    }
    inbound.group_muted = Some(muted);
    if muted {
        vec![RouterEventKind::MuteGroup]
    } else {
        vec![RouterEventKind::UnmuteGroup]
    }
}

fn self_mute_edge(inbound: &mut InboundState, muted: bool) -> Vec<RouterEventKind> {
    if inbound.self_muted == Some(muted) {
        return Vec::new();
    }
    inbound.self_muted = Some(muted);
    if muted {
        vec![RouterEventKind::MuteUser]
    } else {
        vec![RouterEventKind::UnmuteUser]
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
