use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// A registered runner, identified by the address it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerAddr {
    pub host: String,
    pub port: u16,
}

impl RunnerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RunnerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of recording a runner's acceptance of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Recorded,
    /// The runner was evicted between accepting and being recorded.
    RunnerGone,
    /// The commit is no longer pending; its results already arrived.
    Withdrawn,
}

/// Runner registry, commit ledger and pending queue.
///
/// Every method that touches more than one structure does so in a single
/// `&mut self` call, so holding the surrounding write lock for the duration of
/// one call is the whole critical section. Invariants maintained here:
///
/// - a commit id is in at most one of `pending` and `ledger`
/// - every runner referenced by `ledger` is in `runners`
///
/// `claims` records pending commit ids that some task is currently trying to
/// place; a second task asking for the same id is turned away.
#[derive(Debug, Default)]
pub struct DispatcherState {
    runners: Vec<RunnerAddr>,
    ledger: HashMap<String, RunnerAddr>,
    pending: VecDeque<String>,
    claims: HashSet<String>,
}

impl DispatcherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner. Registration order is dispatch order.
    pub fn register_runner(&mut self, runner: RunnerAddr) {
        tracing::info!(runner = %runner, "Runner registered");
        self.runners.push(runner);
    }

    /// Evict a runner and move any commit it held back to pending.
    /// Returns the orphaned commit ids.
    pub fn remove_runner(&mut self, runner: &RunnerAddr) -> Vec<String> {
        self.runners.retain(|r| r != runner);

        let orphaned: Vec<String> = self
            .ledger
            .iter()
            .filter(|(_, owner)| *owner == runner)
            .map(|(commit_id, _)| commit_id.clone())
            .collect();

        for commit_id in &orphaned {
            self.ledger.remove(commit_id);
            if !self.pending.contains(commit_id) {
                self.pending.push_back(commit_id.clone());
            }
        }

        tracing::info!(runner = %runner, orphaned = ?orphaned, "Runner removed");
        orphaned
    }

    /// Record that `runner` accepted the pending `commit_id`: insert into the
    /// ledger, drop it from pending and release its claim.
    pub fn assign(&mut self, commit_id: &str, runner: &RunnerAddr) -> Assignment {
        if !self.is_pending(commit_id) {
            self.claims.remove(commit_id);
            return Assignment::Withdrawn;
        }
        if !self.is_registered(runner) {
            return Assignment::RunnerGone;
        }
        self.ledger.insert(commit_id.to_string(), runner.clone());
        self.pending.retain(|c| c != commit_id);
        self.claims.remove(commit_id);
        tracing::info!(commit_id, runner = %runner, "Commit dispatched");
        Assignment::Recorded
    }

    /// Forget a commit whose results arrived. Idempotent.
    pub fn complete(&mut self, commit_id: &str) -> Option<RunnerAddr> {
        self.pending.retain(|c| c != commit_id);
        self.claims.remove(commit_id);
        self.ledger.remove(commit_id)
    }

    /// Queue a commit for (re)dispatch unless it is already dispatched or queued.
    pub fn enqueue_pending(&mut self, commit_id: &str) -> bool {
        if self.ledger.contains_key(commit_id) || self.pending.iter().any(|c| c == commit_id) {
            return false;
        }
        self.pending.push_back(commit_id.to_string());
        true
    }

    /// Take the exclusive right to dispatch `commit_id`. Only pending commits
    /// can be claimed, and only by one task at a time.
    pub fn try_claim(&mut self, commit_id: &str) -> bool {
        if !self.is_pending(commit_id) {
            return false;
        }
        self.claims.insert(commit_id.to_string())
    }

    pub fn release_claim(&mut self, commit_id: &str) {
        self.claims.remove(commit_id);
    }

    /// Snapshot of registered runners in registration order.
    pub fn runners(&self) -> Vec<RunnerAddr> {
        self.runners.clone()
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    pub fn is_registered(&self, runner: &RunnerAddr) -> bool {
        self.runners.contains(runner)
    }

    /// Snapshot of the pending queue, oldest first.
    pub fn pending_commits(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    pub fn is_pending(&self, commit_id: &str) -> bool {
        self.pending.iter().any(|c| c == commit_id)
    }

    pub fn assigned_runner(&self, commit_id: &str) -> Option<&RunnerAddr> {
        self.ledger.get(commit_id)
    }

    pub fn is_claimed(&self, commit_id: &str) -> bool {
        self.claims.contains(commit_id)
    }

    pub fn dispatched_count(&self) -> usize {
        self.ledger.len()
    }

    /// Verify the pending/ledger and ledger/registry invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (commit_id, runner) in &self.ledger {
            if self.pending.contains(commit_id) {
                return Err(format!("commit {commit_id} is both pending and dispatched"));
            }
            if !self.runners.contains(runner) {
                return Err(format!(
                    "commit {commit_id} is dispatched to unregistered runner {runner}"
                ));
            }
        }
        let unique: HashSet<&String> = self.pending.iter().collect();
        if unique.len() != self.pending.len() {
            return Err("pending queue contains duplicates".to_string());
        }
        Ok(())
    }
}
