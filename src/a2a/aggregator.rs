//! Result Aggregator: fold a finished plan into one reply message.
//!
//! Sections follow plan declaration order, never completion order. Every
//! task that did not succeed is listed with its error kind and agent,
//! both in the text and in the `failures` metadata entry.

use crate::a2a::dispatcher::PlanOutcome;
use crate::a2a::task::{PlanStatus, Task, TaskError, TaskState};
use crate::a2a::types::{Message, Part, Role};
use crate::error::{A2aError, Result};
use serde_json::json;

/// Build the reply for a terminal plan.
///
/// Returns `AllTasksFailed` (or `Cancelled` for a cancelled plan) when no
/// task succeeded; any success yields a message, partial or not.
pub fn aggregate(outcome: &PlanOutcome) -> Result<Message> {
    let incomplete: Vec<&Task> = outcome
        .tasks
        .iter()
        .filter(|t| t.state != TaskState::Succeeded)
        .collect();

    if outcome.succeeded().next().is_none() {
        if outcome.status == PlanStatus::Cancelled {
            return Err(A2aError::Cancelled);
        }
        return Err(A2aError::AllTasksFailed {
            count: outcome.tasks.len(),
            failures: incomplete.iter().map(|t| failure_of(t)).collect(),
        });
    }

    let mut parts: Vec<Part> = Vec::new();
    let single = outcome.tasks.len() == 1;
    for task in outcome.succeeded() {
        let Some(result) = &task.result else {
            continue;
        };
        if single {
            parts.extend(result.parts.iter().cloned());
            continue;
        }
        parts.push(Part::text(format!(
            "## [{}] {} (agent: {})\n{}",
            task.id,
            task.capability,
            task.agent,
            result.text()
        )));
        parts.extend(result.parts.iter().filter(|p| p.as_text().is_none()).cloned());
    }

    if !incomplete.is_empty() {
        let mut report = String::from("## Incomplete sub-tasks");
        for task in &incomplete {
            let failure = failure_of(task);
            report.push_str(&format!(
                "\n- [{}] {} {}{}: {} from agent {}: {}",
                task.id,
                task.capability,
                task.state,
                if task.optional { " (optional)" } else { "" },
                failure.kind,
                failure.agent,
                failure.message
            ));
        }
        parts.push(Part::text(report));
    }

    let mut message = Message::new(Role::Agent, parts);
    message
        .metadata
        .insert("plan_id".to_string(), json!(outcome.plan_id));
    message
        .metadata
        .insert("plan_status".to_string(), json!(outcome.status));
    message.metadata.insert(
        "failures".to_string(),
        json!(incomplete
            .iter()
            .map(|t| {
                let f = failure_of(t);
                json!({
                    "task": t.id,
                    "state": t.state,
                    "kind": f.kind,
                    "agent": f.agent,
                    "message": f.message,
                })
            })
            .collect::<Vec<_>>()),
    );
    Ok(message)
}

fn failure_of(task: &Task) -> TaskError {
    task.error.clone().unwrap_or_else(|| {
        TaskError::new(
            crate::error::ErrorKind::TaskFailed,
            task.agent.clone(),
            format!("task ended in state {}", task.state),
        )
    })
}
