use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::DEFAULT_CONFIG_FILE, load_settings, ClassroomClient, ClassroomSession,
    ClientSettings, CooperationEvent, GroupIdSet, InteractionEvent, MachineEvent, MachineState,
    MuteUserParams, ProtocolError, StateMachine, TransportSettings,
};
use messaging_transport::{
    memory::{MemoryHub, MemoryTransport},
    MessagingTransport,
};
use shared::domain::{GroupId, Role, UserId, UserInfo};
use tokio::{
    sync::broadcast,
    time::{timeout, Duration},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TEACHER: &str = "teacher";
const ASSISTANT: &str = "assistant";

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long, default_value = "demo-class")]
    group: String,
    #[arg(long, default_value = "s1")]
    student: String,
    /// Seconds to wait for each step before giving up.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// The assistant asks the teacher to mute the student.
    MuteUser {
        #[arg(long)]
        unmute: bool,
    },
    /// The assistant asks the teacher to mute the whole group.
    MuteGroup {
        #[arg(long)]
        unmute: bool,
    },
    /// The teacher invites the student on stage and the student accepts.
    Invite,
}

struct Classroom {
    settings: ClientSettings,
    hubs: Vec<Arc<MemoryHub>>,
    groups: GroupIdSet,
}

impl Classroom {
    fn new(settings: ClientSettings, group: &str) -> Self {
        let hubs = settings
            .enabled_transports()
            .map(|transport| {
                let hub = MemoryHub::new(transport.kind);
                hub.create_group(&GroupId::new(group), &UserId::new(TEACHER));
                hub
            })
            .collect();
        Self {
            settings,
            hubs,
            groups: GroupIdSet::uniform(group),
        }
    }

    async fn join(&self, user: &str, role: Role, peer: Option<&str>) -> Result<ClassroomClient> {
        let mut hubs = self.hubs.iter();
        let mut missing = false;
        let bindings = self.settings.bindings(|transport: &TransportSettings| {
            let hub = match hubs.next() {
                Some(hub) => Arc::clone(hub),
                None => {
                    missing = true;
                    MemoryHub::new(transport.kind)
                }
            };
            MemoryTransport::with_capabilities(hub, transport.capabilities())
                as Arc<dyn MessagingTransport>
        });
        if missing {
            bail!("backend list changed while joining");
        }
        let client = ClassroomClient::connect(
            &self.settings,
            bindings,
            self.settings.mute_service()?,
            ClassroomSession {
                user: UserInfo::new(user, user),
                role,
                token: format!("{user}-demo-token"),
                groups: self.groups.clone(),
                peer: peer.map(UserId::new),
            },
        )
        .await
        .with_context(|| format!("connect {user}"))?;
        println!("{user} joined as {role}");
        Ok(client)
    }
}

async fn next_matching<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    wait: Duration,
    wanted: impl Fn(&T) -> bool,
) -> Result<T> {
    timeout(wait, async {
        loop {
            let event = rx.recv().await?;
            if wanted(&event) {
                return Ok::<_, broadcast::error::RecvError>(event);
            }
        }
    })
    .await
    .context("timed out")?
    .map_err(|err| anyhow!("event stream closed: {err}"))
}

fn refused(err: ProtocolError) -> anyhow::Error {
    let api = err.to_api_error();
    let args = api.args.map(|args| args.to_string()).unwrap_or_default();
    anyhow!("{} [{}] {args}", api.message, api.code.as_str())
}

async fn await_outcome(machine: &StateMachine, wait: Duration) -> Result<()> {
    let mut lifecycle = machine.subscribe();
    if machine.is(MachineState::Responsed) {
        println!("request answered");
        return Ok(());
    }
    let event = next_matching(&mut lifecycle, wait, |event| {
        matches!(
            event.event,
            MachineEvent::Responsed | MachineEvent::Rejected | MachineEvent::Cancel
        )
    })
    .await?;
    println!(
        "request finished with {} after {} retries payload={}",
        event.event,
        event.retry_count,
        event.payload.map(|p| p.to_string()).unwrap_or_default()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let wait = Duration::from_secs(args.wait_secs);

    let settings = load_settings(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    info!(
        "demo: backends={:?} retry_interval_ms={} retry_limit={}",
        settings.enabled_transports().map(|t| t.kind).collect::<Vec<_>>(),
        settings.retry_interval_ms,
        settings.retry_limit
    );
    let classroom = Classroom::new(settings, &args.group);

    let teacher = classroom.join(TEACHER, Role::Teacher, Some(ASSISTANT)).await?;
    let assistant = classroom
        .join(ASSISTANT, Role::Assistant, Some(TEACHER))
        .await?;
    let student = classroom.join(&args.student, Role::Student, None).await?;
    let student_id = UserId::new(args.student.as_str());

    match args.command {
        Command::MuteUser { unmute } => {
            let teacher_side = teacher
                .teacher_cooperation()
                .context("teacher cooperation")?;
            let mut done = teacher_side.subscribe_events();
            let params = if unmute {
                MuteUserParams::unmute(student_id.clone())
            } else {
                MuteUserParams::mute(student_id.clone())
            };
            let machine = assistant
                .assistant_cooperation()
                .context("assistant cooperation")?
                .mute_user(params, None)
                .map_err(refused)?;
            await_outcome(&machine, wait).await?;
            let event = next_matching(&mut done, wait, |event| {
                matches!(event, CooperationEvent::MuteUserDone { .. })
            })
            .await?;
            println!("teacher reported {event:?}");
            println!(
                "muted users: {:?}",
                student.router().query_muted_user_list().await?
            );
        }
        Command::MuteGroup { unmute } => {
            let machine = assistant
                .assistant_cooperation()
                .context("assistant cooperation")?
                .mute_group(!unmute, None)
                .map_err(refused)?;
            await_outcome(&machine, wait).await?;
            let status = student.router().query_mute_group().await?;
            println!("group mute_all={}", status.mute_all);
        }
        Command::Invite => {
            let student_side = student
                .student_interaction()
                .context("student interaction")?;
            let mut invitations = student_side.subscribe_events();
            let machine = teacher
                .teacher_interaction()
                .context("teacher interaction")?
                .invite(&student_id)
                .map_err(refused)?;
            let invitation = next_matching(&mut invitations, wait, |event| {
                matches!(event, InteractionEvent::InvitationReceived(_))
            })
            .await?;
            if let InteractionEvent::InvitationReceived(data) = invitation {
                println!("{} received invitation {}", args.student, data.session_id);
                student_side.send_accepted_resp(&data)?;
            }
            await_outcome(&machine, wait).await?;
        }
    }

    student.disconnect().await?;
    assistant.disconnect().await?;
    teacher.disconnect().await?;
    Ok(())
}
