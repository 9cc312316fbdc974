use std::sync::Arc;

use shared::domain::{Role, UserId, UserInfo};
use tokio::task::JoinHandle;
use tracing::info;

pub mod app_server;
pub mod config;
pub mod cooperation;
pub mod dedup;
pub mod error;
pub mod fanout;
pub mod interaction;
pub mod manager;
pub mod router;
pub mod session;
pub mod state_machine;

pub use app_server::{AppServerClient, MuteStateService};
pub use config::{load_settings, ClientSettings, TransportSettings};
pub use cooperation::{
    AssistantCooperationManager, CooperationEvent, MuteUserParams, TeacherCooperationManager,
};
pub use error::{ConfigError, ProtocolError, RouterError, TransitionError};
pub use interaction::{
    InteractionEvent, InteractionStatus, MediaStatus, StudentInteractionManager,
    TeacherInteractionManager,
};
pub use manager::{attach, ManagerOptions, MessageHandler};
pub use router::{
    GroupIdSet, MessageRouter, RouterConfig, RouterEvent, RouterEventKind, RouterOptions,
    TransportBinding,
};
pub use state_machine::{LifecycleEvent, MachineEvent, MachineState, RetryPolicy, StateMachine};

pub enum Cooperation {
    Teacher(Arc<TeacherCooperationManager>),
    Assistant(Arc<AssistantCooperationManager>),
}

pub enum Interaction {
    Teacher(Arc<TeacherInteractionManager>),
    Student(Arc<StudentInteractionManager>),
}

#[derive(Debug, Clone)]
pub struct ClassroomSession {
    pub user: UserInfo,
    pub role: Role,
    pub token: String,
    pub groups: GroupIdSet,
    pub peer: Option<UserId>,
}

/// One signed-in classroom participant: the router plus the managers for its role,
/// each fed by the router's inbound messages.
pub struct ClassroomClient {
    router: Arc<MessageRouter>,
    role: Role,
    cooperation: Option<Cooperation>,
    interaction: Interaction,
    handlers: Vec<JoinHandle<()>>,
}

impl ClassroomClient {
    pub async fn connect(
        settings: &ClientSettings,
        bindings: Vec<TransportBinding>,
        mute_service: Option<Arc<dyn MuteStateService>>,
        session: ClassroomSession,
    ) -> Result<Self, ProtocolError> {
        let router = match mute_service {
            Some(service) => {
                MessageRouter::with_mute_service(bindings, settings.router_options(), service)
            }
            None => MessageRouter::new(bindings, settings.router_options()),
        };
        router.start();
        router.set_config(RouterConfig {
            token: session.token.clone(),
        });
        router.init().await?;
        router.login(&session.user).await?;
        router.join_group(&session.groups).await?;

        let options = ManagerOptions {
            default_receiver: session.peer.clone(),
            ..settings.manager_options()
        };
        let role = session.role;
        let mut handlers = Vec::new();
        let cooperation = match role {
            Role::Teacher => {
                let manager =
                    TeacherCooperationManager::new(role, Arc::clone(&router), options.clone());
                handlers.push(attach(&router, &manager));
                Some(Cooperation::Teacher(manager))
            }
            Role::Assistant => {
                let manager =
                    AssistantCooperationManager::new(role, Arc::clone(&router), options.clone());
                handlers.push(attach(&router, &manager));
                Some(Cooperation::Assistant(manager))
            }
            Role::Student => None,
        };
        let interaction = match role {
            Role::Student => {
                let manager = StudentInteractionManager::new(role, Arc::clone(&router), options);
                handlers.push(attach(&router, &manager));
                Interaction::Student(manager)
            }
            Role::Teacher | Role::Assistant => {
                let manager = TeacherInteractionManager::new(role, Arc::clone(&router), options);
                handlers.push(attach(&router, &manager));
                Interaction::Teacher(manager)
            }
        };

        info!(
            "classroom: connected user_id={} role={role} transports={:?}",
            session.user.user_id,
            router.transport_kinds()
        );
        Ok(Self {
            router,
            role,
            cooperation,
            interaction,
            handlers,
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cooperation(&self) -> Option<&Cooperation> {
        self.cooperation.as_ref()
    }

    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }

    pub fn teacher_cooperation(&self) -> Option<&Arc<TeacherCooperationManager>> {
        match &self.cooperation {
            Some(Cooperation::Teacher(manager)) => Some(manager),
            _ => None,
        }
    }

    pub fn assistant_cooperation(&self) -> Option<&Arc<AssistantCooperationManager>> {
        match &self.cooperation {
            Some(Cooperation::Assistant(manager)) => Some(manager),
            _ => None,
        }
    }

    pub fn teacher_interaction(&self) -> Option<&Arc<TeacherInteractionManager>> {
        match &self.interaction {
            Interaction::Teacher(manager) => Some(manager),
            Interaction::Student(_) => None,
        }
    }

    pub fn student_interaction(&self) -> Option<&Arc<StudentInteractionManager>> {
        match &self.interaction {
            Interaction::Student(manager) => Some(manager),
            Interaction::Teacher(_) => None,
        }
    }

    pub async fn disconnect(self) -> Result<(), ProtocolError> {
        for handler in &self.handlers {
            handler.abort();
        }
        self.router.leave_group().await?;
        self.router.logout().await?;
        self.router.un_init().await?;
        Ok(())
    }
}

impl Drop for ClassroomClient {
    fn drop(&mut self) {
        for handler in &self.handlers {
            handler.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
