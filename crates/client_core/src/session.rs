use std::sync::{Arc, Mutex};

use chrono::Utc;
use shared::{
    domain::{SessionId, UserId},
    protocol::MessageType,
};

use crate::{dedup::SeenSet, state_machine::StateMachine};

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub receiver_id: UserId,
    pub message_type: MessageType,
    pub machine: Arc<StateMachine>,
    pub flag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionQuery {
    pub session_id: Option<SessionId>,
    pub receiver_id: Option<UserId>,
    pub message_type: Option<MessageType>,
    pub flag: Option<String>,
}

impl SessionQuery {
    pub fn by_id(session_id: &SessionId) -> Self {
        Self {
            session_id: Some(session_id.clone()),
            ..Self::default()
        }
    }

    pub fn by_type(message_type: MessageType) -> Self {
        Self {
            message_type: Some(message_type),
            ..Self::default()
        }
    }

    pub fn receiver(mut self, receiver_id: &UserId) -> Self {
        self.receiver_id = Some(receiver_id.clone());
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.session_id
            .as_ref()
            .map_or(true, |id| *id == session.session_id)
            && self
                .receiver_id
                .as_ref()
                .map_or(true, |id| *id == session.receiver_id)
            && self
                .message_type
                .map_or(true, |message_type| message_type == session.message_type)
            && self
                .flag
                .as_ref()
                .map_or(true, |flag| session.flag.as_ref() == Some(flag))
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    pending: Vec<Session>,
    expired: SeenSet<SessionId>,
}

impl SessionRegistry {
    pub fn new(expired_capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            expired: SeenSet::new(expired_capacity),
        }
    }

    pub fn find(&self, query: &SessionQuery) -> Option<&Session> {
        self.pending.iter().find(|session| query.matches(session))
    }

    pub fn insert(&mut self, session: Session) {
        self.pending.push(session);
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        let index = self
            .pending
            .iter()
            .position(|session| session.session_id == *session_id)?;
        self.expire(session_id.clone());
        Some(self.pending.remove(index))
    }

    pub fn expire(&mut self, session_id: SessionId) {
        self.expired.insert(session_id);
    }

    pub fn is_expired(&self, session_id: &SessionId) -> bool {
        self.expired.contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Produces `"<epoch-ms>_<type code>"` ids, bumping the millisecond part when two ids
/// would otherwise collide.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last_ms: Mutex<i64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, message_type: MessageType) -> SessionId {
        let now = Utc::now().timestamp_millis();
        let mut last = self
            .last_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ms = now.max(*last + 1);
        *last = ms;
        SessionId::new(format!("{ms}_{}", message_type.code()))
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
