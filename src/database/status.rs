use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unresolved,
    Opening,
    Open,
    AwaitingCreation,
    AwaitingRollbackChoice,
    RollingBack,
    Blocked,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::AwaitingCreation => "awaiting_creation",
            Self::AwaitingRollbackChoice => "awaiting_rollback_choice",
            Self::RollingBack => "rolling_back",
            Self::Blocked => "blocked",
        }
    }
}

/// The only ways the UI can move the lifecycle forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    CreateStore,
    BeginRollbackDiscovery,
    CommitRollback,
    TerminateProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Informational, shown while an engine call is in flight.
    Progress,
    /// Resolved by the single action the condition offers.
    Recoverable,
    /// Only way out is terminating the process.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingCondition {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Command>,
    pub kind: ConditionKind,
}

impl BlockingCondition {
    pub fn is_fatal(&self) -> bool {
        self.kind == ConditionKind::Fatal
    }

    pub fn offers(&self, command: Command) -> bool {
        self.action == Some(command)
    }
}

/// One consistent view of the status cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Bumped on every write. Commands and in-flight operations carry the
    /// generation they were issued against.
    pub generation: u64,
    pub state: LifecycleState,
    pub condition: Option<BlockingCondition>,
}

/// Process-wide observable cell holding the lifecycle state and at most one
/// blocking condition.
///
/// Writes are serialized by the underlying watch channel, so every subscriber
/// sees transitions in order and never a half-applied state/condition pair.
pub struct StatusChannel {
    tx: watch::Sender<StatusSnapshot>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot {
            generation: 0,
            state: LifecycleState::Unresolved,
            condition: None,
        });
        Self { tx }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn current(&self) -> Option<BlockingCondition> {
        self.tx.borrow().condition.clone()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    pub fn is_blocked(&self) -> bool {
        self.tx.borrow().condition.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    /// Replaces the current condition, whatever it is.
    pub fn set(&self, condition: BlockingCondition) -> u64 {
        self.write(None, Some(condition))
    }

    /// Removes the current condition. The lifecycle state is left alone; only
    /// the controller moves the store to `Open`.
    pub fn clear(&self) -> u64 {
        self.write(None, None)
    }

    /// Unconditional state + condition write.
    pub(crate) fn transition(
        &self,
        state: LifecycleState,
        condition: Option<BlockingCondition>,
    ) -> u64 {
        self.write(Some(state), condition)
    }

    /// Applies the transition only if nothing else has written since
    /// `expected`. Returns the new generation, or `None` when the caller's
    /// view is stale.
    pub(crate) fn transition_if_current(
        &self,
        expected: u64,
        state: LifecycleState,
        condition: Option<BlockingCondition>,
    ) -> Option<u64> {
        let mut applied = None;
        self.tx.send_if_modified(|snap| {
            if snap.generation != expected {
                return false;
            }
            snap.generation += 1;
            snap.state = state;
            snap.condition = condition;
            applied = Some(snap.generation);
            true
        });
        applied
    }

    /// Consumes `expected` without changing what is displayed, so the same
    /// action cannot be triggered twice from one condition.
    pub(crate) fn claim(&self, expected: u64) -> Option<u64> {
        let mut claimed = None;
        self.tx.send_if_modified(|snap| {
            if snap.generation != expected {
                return false;
            }
            snap.generation += 1;
            claimed = Some(snap.generation);
            true
        });
        claimed
    }

    fn write(&self, state: Option<LifecycleState>, condition: Option<BlockingCondition>) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|snap| {
            snap.generation += 1;
            if let Some(state) = state {
                snap.state = state;
            }
            snap.condition = condition;
            generation = snap.generation;
        });
        generation
    }

    pub fn to_json(&self) -> serde_json::Value {
        let snap = self.snapshot();
        serde_json::json!({
            "generation": snap.generation,
            "state": snap.state.as_str(),
            "condition": snap.condition,
        })
    }
}
