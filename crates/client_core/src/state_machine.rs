use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::debug;

use crate::error::TransitionError;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_RETRY_LIMIT: u32 = 11;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    Initial,
    Requesting,
    RetryRequesting,
    Responsed,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Initial => "Initial",
            MachineState::Requesting => "Requesting",
            MachineState::RetryRequesting => "RetryRequesting",
            MachineState::Responsed => "Responsed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineEvent {
    Request,
    Retry,
    Responsed,
    Rejected,
    Cancel,
    Timeout,
}

impl fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineEvent::Request => "Request",
            MachineEvent::Retry => "Retry",
            MachineEvent::Responsed => "Responsed",
            MachineEvent::Rejected => "Rejected",
            MachineEvent::Cancel => "Cancel",
            MachineEvent::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event: MachineEvent,
    /// State the machine was in when the event fired. For `Timeout` this is the
    /// state before the reset to `Initial`.
    pub state: MachineState,
    pub retry_count: u32,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

pub type TransitionHook = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct MachineCore {
    state: MachineState,
    retry_count: u32,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
    hooks: Vec<(MachineEvent, TransitionHook)>,
}

impl MachineCore {
    fn clear_timer(&mut self) {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn reset(&mut self) {
        self.state = MachineState::Initial;
        self.retry_count = 0;
        self.clear_timer();
    }

    fn hooks_for(&self, events: &[MachineEvent]) -> Vec<TransitionHook> {
        events
            .iter()
            .flat_map(|wanted| {
                self.hooks
                    .iter()
                    .filter(move |(event, _)| event == wanted)
                    .map(|(_, hook)| Arc::clone(hook))
            })
            .collect()
    }
}

/// Request/response state machine with timer-driven retries.
///
/// Hooks registered for [`MachineEvent::Request`] carry the send side effect and run
/// again on every retry. Hooks run outside the internal lock.
pub struct StateMachine {
    policy: RetryPolicy,
    core: Mutex<MachineCore>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl StateMachine {
    pub fn new(policy: RetryPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Arc::new(Self {
            policy,
            core: Mutex::new(MachineCore {
                state: MachineState::Initial,
                retry_count: 0,
                timer_generation: 0,
                timer: None,
                hooks: Vec::new(),
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MachineCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> MachineState {
        self.lock().state
    }

    pub fn is(&self, state: MachineState) -> bool {
        self.state() == state
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn has_pending_timer(&self) -> bool {
        self.lock().timer.is_some()
    }

    pub fn on(&self, event: MachineEvent, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.lock().hooks.push((event, Arc::new(hook)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn transition(
        self: &Arc<Self>,
        event: MachineEvent,
        payload: Option<Value>,
    ) -> Result<(), TransitionError> {
        let mut core = self.lock();
        let from = core.state;
        let in_flight = matches!(
            from,
            MachineState::Requesting | MachineState::RetryRequesting
        );
        let allowed = match event {
            MachineEvent::Request => from == MachineState::Initial,
            MachineEvent::Retry
            | MachineEvent::Responsed
            | MachineEvent::Rejected
            | MachineEvent::Cancel
            | MachineEvent::Timeout => in_flight,
        };
        if !allowed {
            return Err(TransitionError { state: from, event });
        }

        match event {
            MachineEvent::Request => {
                core.state = MachineState::Requesting;
                self.arm_timer(&mut core);
                let record = self.record(&core, event, payload);
                let hooks = core.hooks_for(&[MachineEvent::Request]);
                drop(core);
                self.emit(hooks, record);
            }
            MachineEvent::Retry => self.retry(core),
            MachineEvent::Timeout => self.timeout(core),
            MachineEvent::Responsed => {
                core.clear_timer();
                core.retry_count = 0;
                core.state = MachineState::Responsed;
                let record = self.record(&core, event, payload);
                let hooks = core.hooks_for(&[event]);
                drop(core);
                self.emit(hooks, record);
            }
            MachineEvent::Rejected | MachineEvent::Cancel => {
                let record = self.record(&core, event, payload);
                core.reset();
                let hooks = core.hooks_for(&[event]);
                drop(core);
                self.emit(hooks, record);
            }
        }
        Ok(())
    }

    fn record(&self, core: &MachineCore, event: MachineEvent, payload: Option<Value>) -> LifecycleEvent {
        LifecycleEvent {
            event,
            state: core.state,
            retry_count: core.retry_count,
            payload,
        }
    }

    fn emit(&self, hooks: Vec<TransitionHook>, record: LifecycleEvent) {
        debug!(
            "state machine: event={} state={} retry_count={}",
            record.event, record.state, record.retry_count
        );
        for hook in hooks {
            hook(&record);
        }
        let _ = self.events.send(record);
    }

    fn arm_timer(self: &Arc<Self>, core: &mut MachineCore) {
        core.clear_timer();
        let generation = core.timer_generation;
        let machine: Weak<Self> = Arc::downgrade(self);
        let interval = self.policy.interval;
        core.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(machine) = machine.upgrade() {
                machine.on_timer(generation);
            }
        }));
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let mut core = self.lock();
        if core.timer_generation != generation
            || !matches!(
                core.state,
                MachineState::Requesting | MachineState::RetryRequesting
            )
        {
            return;
        }
        // The handle belongs to the task running this call; detach it instead of
        // aborting it.
        core.timer = None;
        if core.retry_count < self.policy.limit {
            self.retry(core);
        } else {
            self.timeout(core);
        }
    }

    fn retry(self: &Arc<Self>, mut core: MutexGuard<'_, MachineCore>) {
        core.retry_count += 1;
        core.state = MachineState::RetryRequesting;
        self.arm_timer(&mut core);
        let resend = self.record(&core, MachineEvent::Request, None);
        let retry = self.record(&core, MachineEvent::Retry, None);
        let send_hooks = core.hooks_for(&[MachineEvent::Request]);
        let retry_hooks = core.hooks_for(&[MachineEvent::Retry]);
        drop(core);

        self.emit(send_hooks, resend);
        self.emit(retry_hooks, retry);
    }

    fn timeout(&self, mut core: MutexGuard<'_, MachineCore>) {
        let record = self.record(&core, MachineEvent::Timeout, None);
        core.reset();
        let hooks = core.hooks_for(&[MachineEvent::Timeout]);
        drop(core);
        self.emit(hooks, record);
    }

    pub fn reset(&self) {
        self.lock().reset();
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.lock() {
            core.clear_timer();
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.lock();
        f.debug_struct("StateMachine")
            .field("state", &core.state)
            .field("retry_count", &core.retry_count)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/state_machine_tests.rs"]
mod tests;
