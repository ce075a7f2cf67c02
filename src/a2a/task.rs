//! Per-task state machine.
//!
//! ```text
//! Pending ─► Dispatched ─► Succeeded
//!    │           ├───────► Failed
//!    │           ├───────► TimedOut ─► Retrying / Failed
//!    │           └───────► Retrying ─► Dispatched / Failed
//!    └─► Skipped / Failed
//! ```
//!
//! `Succeeded`, `Failed` and `Skipped` are terminal.

use crate::a2a::types::Message;
use crate::error::{A2aError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatched,
    Retrying,
    TimedOut,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            // Failed straight from Pending: breaker rejection or cancellation
            // before the first call.
            Pending => matches!(next, Dispatched | Skipped | Failed),
            Dispatched => matches!(next, Succeeded | Failed | TimedOut | Retrying),
            TimedOut => matches!(next, Retrying | Failed),
            Retrying => matches!(next, Dispatched | Failed),
            Succeeded | Failed | Skipped => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Retrying => "retrying",
            Self::TimedOut => "timed_out",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// Why a task did not succeed, in a form that can be embedded in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub agent: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            agent: agent.into(),
            message: message.into(),
        }
    }

    pub fn from_error(agent: &str, err: &A2aError) -> Self {
        Self {
            kind: err.kind(),
            agent: err.agent().unwrap_or(agent).to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (agent {}): {}", self.kind, self.agent, self.message)
    }
}

/// One node of a plan. Owned by the dispatcher until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent: String,
    /// Capability label the node was planned for (its primary tag).
    pub capability: String,
    pub input: Message,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        agent: impl Into<String>,
        capability: impl Into<String>,
        input: Message,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            agent: agent.into(),
            capability: capability.into(),
            input,
            depends_on: Vec::new(),
            optional: false,
            state: TaskState::Pending,
            result: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(task = %self.id, agent = %self.agent, from = %self.state, to = %next, "Task transition");
        if next == TaskState::Retrying {
            self.retry_count += 1;
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn succeed(&mut self, result: Message) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Succeeded)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: TaskError) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn skip(&mut self, reason: TaskError) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Skipped)?;
        self.error = Some(reason);
        Ok(())
    }
}

/// Overall state of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    /// Every non-optional node succeeded.
    Succeeded,
    /// At least one node succeeded, some required node did not.
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Derive the final status from terminal tasks.
    pub fn from_tasks(tasks: &[Task], cancelled: bool) -> Self {
        let all_required_ok = tasks
            .iter()
            .filter(|t| !t.optional)
            .all(|t| t.state == TaskState::Succeeded);
        let any_ok = tasks.iter().any(|t| t.state == TaskState::Succeeded);

        if cancelled {
            Self::Cancelled
        } else if all_required_ok && any_ok {
            Self::Succeeded
        } else if any_ok {
            Self::PartiallySucceeded
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskState::*;

    const ALL: [TaskState; 7] = [
        Pending, Dispatched, Retrying, TimedOut, Succeeded, Failed, Skipped,
    ];

    fn task() -> Task {
        Task::new("n1", "s1", "summarizer", "summarization", Message::user("x"))
    }

    #[rstest]
    #[case(Pending, Dispatched)]
    #[case(Pending, Skipped)]
    #[case(Pending, Failed)]
    #[case(Dispatched, Succeeded)]
    #[case(Dispatched, Failed)]
    #[case(Dispatched, TimedOut)]
    #[case(Dispatched, Retrying)]
    #[case(TimedOut, Retrying)]
    #[case(TimedOut, Failed)]
    #[case(Retrying, Dispatched)]
    #[case(Retrying, Failed)]
    fn test_valid_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
    }

    #[rstest]
    #[case(Pending, Succeeded)]
    #[case(Pending, Retrying)]
    #[case(Dispatched, Pending)]
    #[case(Dispatched, Skipped)]
    #[case(TimedOut, Succeeded)]
    #[case(Retrying, Succeeded)]
    fn test_invalid_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
    }

    #[rstest]
    #[case(Succeeded)]
    #[case(Failed)]
    #[case(Skipped)]
    fn test_terminal_states_are_final(#[case] terminal: TaskState) {
        assert!(terminal.is_terminal());
        for next in ALL {
            assert!(!terminal.can_transition_to(next));
        }
    }

    #[test]
    fn test_retry_cycle_counts_attempts() {
        let mut t = task();
        t.transition(Dispatched).expect("dispatch");
        t.transition(TimedOut).expect("timeout");
        t.transition(Retrying).expect("retry");
        t.transition(Dispatched).expect("redispatch");
        t.transition(Retrying).expect("retry");
        t.transition(Dispatched).expect("redispatch");
        t.succeed(Message::agent("done")).expect("succeed");
        assert_eq!(t.retry_count, 2);
        assert!(t.is_terminal());
        assert_eq!(t.result.as_ref().map(Message::text).as_deref(), Some("done"));
    }

    #[test]
    fn test_transition_out_of_terminal_is_rejected() {
        let mut t = task();
        t.skip(TaskError::new(ErrorKind::TaskFailed, "summarizer", "upstream failed"))
            .expect("skip");
        let err = t.transition(Dispatched).expect_err("terminal");
        assert_eq!(err, InvalidTransition { from: Skipped, to: Dispatched });
        assert_eq!(t.state, Skipped);
    }

    #[test]
    fn test_task_error_from_a2a_error() {
        let err = A2aError::Timeout {
            agent: "flights".into(),
            after_ms: 30,
        };
        let te = TaskError::from_error("ignored", &err);
        assert_eq!(te.kind, ErrorKind::Timeout);
        assert_eq!(te.agent, "flights");

        let te = TaskError::from_error("hotels", &A2aError::Cancelled);
        assert_eq!(te.agent, "hotels");
        assert_eq!(te.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_plan_status_ignores_optional_failures() {
        let mut ok = task();
        ok.transition(Dispatched).expect("dispatch");
        ok.succeed(Message::agent("ok")).expect("succeed");

        let mut optional = task();
        optional.id = "n2".into();
        optional.optional = true;
        optional
            .fail(TaskError::new(ErrorKind::TaskFailed, "x", "nope"))
            .expect("fail");
        assert_eq!(
            PlanStatus::from_tasks(&[ok.clone(), optional.clone()], false),
            PlanStatus::Succeeded
        );

        optional.optional = false;
        assert_eq!(
            PlanStatus::from_tasks(&[ok.clone(), optional.clone()], false),
            PlanStatus::PartiallySucceeded
        );
        assert_eq!(
            PlanStatus::from_tasks(std::slice::from_ref(&optional), false),
            PlanStatus::Failed
        );
        assert_eq!(PlanStatus::from_tasks(&[ok], true), PlanStatus::Cancelled);
    }
}
