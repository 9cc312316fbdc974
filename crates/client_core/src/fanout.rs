use std::{fmt, future::Future, sync::Arc};

use futures::future::join_all;
use messaging_transport::{MessagingTransport, TransportKind};
use tracing::warn;

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutPolicy {
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOutcome {
    pub kind: TransportKind,
    pub error: Option<String>,
}

impl TransportOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub operation: &'static str,
    pub policy: FanoutPolicy,
    pub outcomes: Vec<TransportOutcome>,
}

impl FanoutReport {
    pub fn is_success(&self) -> bool {
        match self.policy {
            FanoutPolicy::All => self.outcomes.iter().all(TransportOutcome::is_ok),
            FanoutPolicy::Any => self.outcomes.iter().any(TransportOutcome::is_ok),
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_ok())
            .map(|outcome| outcome.kind)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransportOutcome> + '_ {
        self.outcomes.iter().filter(|outcome| !outcome.is_ok())
    }

    pub fn into_result(self) -> Result<Self, RouterError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RouterError::Fanout(self))
        }
    }
}

impl fmt::Display for FanoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({:?})", self.operation, self.policy)?;
        for failure in self.failures() {
            write!(
                f,
                "; {}: {}",
                failure.kind,
                failure.error.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

pub async fn fan_out<F, Fut>(
    operation: &'static str,
    policy: FanoutPolicy,
    transports: &[Arc<dyn MessagingTransport>],
    op: F,
) -> FanoutReport
where
    F: Fn(Arc<dyn MessagingTransport>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let calls = transports.iter().map(|transport| {
        let kind = transport.kind();
        let call = op(Arc::clone(transport));
        async move { (kind, call.await) }
    });

    let outcomes = join_all(calls)
        .await
        .into_iter()
        .map(|(kind, result)| match result {
            Ok(()) => TransportOutcome { kind, error: None },
            Err(err) => {
                warn!("fanout: {operation} failed on transport={kind}: {err:#}");
                TransportOutcome {
                    kind,
                    error: Some(format!("{err:#}")),
                }
            }
        })
        .collect();

    FanoutReport {
        operation,
        policy,
        outcomes,
    }
}

#[cfg(test)]
#[path = "tests/fanout_tests.rs"]
mod tests;
