//! Timers that feed timeout events back into the dispatcher queue

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::agreement::queue::Ingress;
use crate::agreement::types::{RoundId, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn new(id: u64) -> Self {
        TimerToken(id)
    }
}

/// Timers of the node's part in a commit-reveal epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTimer {
    /// The commit phase is over; later commitments are refused.
    CommitDeadline,
    /// The inter-phase gap elapsed; the reveal may be published.
    RevealDue,
    /// The reveal phase is over; the epoch is combined.
    RevealDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTarget {
    Round(RoundId, TimerKind),
    Session(SessionTimer),
}

/// Synthetic event injected into the dispatcher when a timer expires.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub token: TimerToken,
    pub target: TimerTarget,
}

/// Timer collaborator. Expiry must be delivered through the node's event
/// queue, never by touching engine state from another thread.
pub trait TimerService: Send {
    fn arm(&mut self, target: TimerTarget, after: Duration) -> TimerToken;

    /// Cancel a pending timer. Unknown or already fired tokens are ignored.
    fn cancel(&mut self, token: TimerToken);
}

/// Timers backed by `tokio::time::sleep` tasks.
pub struct TokioTimers {
    ingress: Ingress,
    next: u64,
    tasks: HashMap<TimerToken, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(ingress: Ingress) -> Self {
        TokioTimers {
            ingress,
            next: 0,
            tasks: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|(_, task)| !task.is_finished()).count()
    }
}

impl TimerService for TokioTimers {
    fn arm(&mut self, target: TimerTarget, after: Duration) -> TimerToken {
        self.next += 1;
        let token = TimerToken(self.next);
        let ingress = self.ingress.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if ingress.fire(TimerFired { token, target }).is_err() {
                debug!("Timer: dispatcher gone, dropping expiry");
            }
        });
        self.tasks.retain(|_, task| !task.is_finished());
        self.tasks.insert(token, task);
        token
    }

    fn cancel(&mut self, token: TimerToken) {
        if let Some(task) = self.tasks.remove(&token) {
            task.abort();
        }
    }
}
