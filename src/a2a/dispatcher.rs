//! Task Dispatcher: executes a plan against remote agents.
//!
//! The coordinator loop launches one unit per node whose prerequisites have
//! all succeeded, bounded by a semaphore shared with every other plan. A
//! node whose prerequisite ends in anything but success is skipped along
//! with everything downstream of it, without a single call. Independent
//! branches always drain; the plan is never failed eagerly.
//!
//! Each unit walks its task through the state machine:
//! breaker check, permit, call (streaming when the agent offers it),
//! then success, retry with backoff, or terminal failure.

use crate::a2a::breaker::BreakerBoard;
use crate::a2a::client::{call_agent, AgentCall, AgentClient, CallMode};
use crate::a2a::planner::Plan;
use crate::a2a::registry::AgentRegistry;
use crate::a2a::task::{PlanStatus, Task, TaskError, TaskState};
use crate::a2a::types::{AgentCard, Message, Part};
use crate::config::DispatchConfig;
use crate::error::{A2aError, ErrorKind};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Called with a snapshot of a task every time it changes state.
pub type TaskObserver = Arc<dyn Fn(&Task) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub plan_id: String,
    pub session_id: String,
    pub status: PlanStatus,
    /// Terminal tasks, in plan declaration order.
    pub tasks: Vec<Task>,
}

impl PlanOutcome {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.state == TaskState::Succeeded)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn AgentClient>,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerBoard>,
    permits: Arc<Semaphore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn AgentClient>,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerBoard>,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_agent_calls.max(1)));
        Self {
            client,
            registry,
            breakers,
            permits,
            config,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerBoard> {
        &self.breakers
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub async fn execute(&self, plan: Plan, cancel: CancellationToken) -> PlanOutcome {
        self.execute_observed(plan, cancel, None).await
    }

    /// Run `plan` to completion. Cancelling `cancel` stops the plan: calls
    /// in flight are abandoned and their tasks fail, tasks not yet started
    /// are skipped. The overall plan timeout has the same effect.
    pub async fn execute_observed(
        &self,
        plan: Plan,
        cancel: CancellationToken,
        observer: Option<TaskObserver>,
    ) -> PlanOutcome {
        let deadline = Instant::now() + self.config.overall_plan_timeout();
        let units_cancel = cancel.child_token();
        let order: Vec<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();

        let mut waiting: Vec<Task> = plan.tasks.clone();
        let mut done: HashMap<String, Task> = HashMap::new();
        let mut launched: HashMap<tokio::task::Id, Task> = HashMap::new();
        let mut units: JoinSet<Task> = JoinSet::new();
        let mut timed_out = false;

        tracing::info!(plan = %plan.id, nodes = plan.tasks.len(), "Dispatching plan");

        loop {
            self.settle_waiting(&plan, &mut waiting, &mut done, &observer);

            let mut still_waiting = Vec::with_capacity(waiting.len());
            for mut task in waiting.drain(..) {
                let ready = plan
                    .graph
                    .prerequisites(&task.id)
                    .iter()
                    .all(|p| done.get(*p).is_some_and(|t| t.state == TaskState::Succeeded));
                if !ready {
                    still_waiting.push(task);
                    continue;
                }

                task.input = with_upstream_context(&task, &plan, &done);
                let Some(card) = self.resolve_card(&plan, &task.agent) else {
                    let err = A2aError::Registry(crate::error::RegistryError::NotFound(
                        task.agent.clone(),
                    ));
                    let err = TaskError::from_error(&task.agent, &err);
                    finish(&mut task, Err(err));
                    notify(&observer, &task);
                    done.insert(task.id.clone(), task);
                    continue;
                };

                let unit = self.clone();
                let token = units_cancel.clone();
                let obs = observer.clone();
                let plan_id = plan.id.clone();
                let snapshot = task.clone();
                let handle = units.spawn(async move {
                    unit.run_unit(plan_id, task, card, token, deadline, obs).await
                });
                launched.insert(handle.id(), snapshot);
            }
            waiting = still_waiting;

            if units.is_empty() {
                // Nothing running and nothing launchable: every task is settled.
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                joined = units.join_next_with_id() => {
                    if let Some(joined) = joined {
                        let task = self.collect_unit(joined, &mut launched);
                        done.insert(task.id.clone(), task);
                    }
                }
            }
        }

        let cancelled = !timed_out && cancel.is_cancelled();
        if cancelled || timed_out {
            units_cancel.cancel();
            while let Some(joined) = units.join_next_with_id().await {
                let mut task = self.collect_unit(joined, &mut launched);
                if timed_out && task.error.as_ref().is_some_and(|e| e.kind == ErrorKind::Cancelled) {
                    task.error = Some(self.plan_timeout_error(&task.agent));
                }
                done.insert(task.id.clone(), task);
            }
            for mut task in waiting.drain(..) {
                let reason = if timed_out {
                    self.plan_timeout_error(&task.agent)
                } else {
                    TaskError::from_error(&task.agent, &A2aError::Cancelled)
                };
                if task.skip(reason).is_ok() {
                    notify(&observer, &task);
                }
                done.insert(task.id.clone(), task);
            }
            let reason = if timed_out { "deadline" } else { "cancelled" };
            tracing::warn!(plan = %plan.id, reason, "Plan stopped before completion");
        }

        let tasks: Vec<Task> = order.iter().filter_map(|id| done.remove(id)).collect();
        let status = PlanStatus::from_tasks(&tasks, cancelled);
        tracing::info!(plan = %plan.id, status = %status, "Plan finished");

        PlanOutcome {
            plan_id: plan.id,
            session_id: plan.session_id,
            status,
            tasks,
        }
    }

    /// Skip every waiting task with a prerequisite that ended unsuccessfully.
    /// Runs to a fixed point so whole chains are skipped in one pass.
    fn settle_waiting(
        &self,
        plan: &Plan,
        waiting: &mut Vec<Task>,
        done: &mut HashMap<String, Task>,
        observer: &Option<TaskObserver>,
    ) {
        loop {
            let mut changed = false;
            let mut keep = Vec::with_capacity(waiting.len());
            for mut task in waiting.drain(..) {
                let blocker = plan.graph.prerequisites(&task.id).into_iter().find_map(|p| {
                    done.get(p)
                        .filter(|t| t.is_terminal() && t.state != TaskState::Succeeded)
                });
                match blocker {
                    Some(upstream) => {
                        let kind = upstream
                            .error
                            .as_ref()
                            .map(|e| e.kind)
                            .unwrap_or(ErrorKind::TaskFailed);
                        let reason = TaskError::new(
                            kind,
                            task.agent.clone(),
                            format!("skipped: dependency '{}' did not succeed", upstream.id),
                        );
                        tracing::info!(plan = %plan.id, task = %task.id, upstream = %upstream.id, "Skipping task");
                        if task.skip(reason).is_ok() {
                            notify(observer, &task);
                        }
                        done.insert(task.id.clone(), task);
                        changed = true;
                    }
                    None => keep.push(task),
                }
            }
            *waiting = keep;
            if !changed {
                break;
            }
        }
    }

    fn collect_unit(
        &self,
        joined: Result<(tokio::task::Id, Task), tokio::task::JoinError>,
        launched: &mut HashMap<tokio::task::Id, Task>,
    ) -> Task {
        match joined {
            Ok((id, task)) => {
                launched.remove(&id);
                task
            }
            Err(e) => {
                let mut task = launched.remove(&e.id()).unwrap_or_else(|| {
                    Task::new("unknown", "", "unknown", "", Message::agent(""))
                });
                tracing::error!(task = %task.id, "Dispatch unit aborted: {}", e);
                let err = TaskError::new(ErrorKind::TaskFailed, task.agent.clone(), e.to_string());
                force_fail(&mut task, err);
                task
            }
        }
    }

    fn resolve_card(&self, plan: &Plan, agent: &str) -> Option<AgentCard> {
        self.registry
            .get(agent)
            .ok()
            .or_else(|| plan.agents.get(agent).cloned())
    }

    fn plan_timeout_error(&self, agent: &str) -> TaskError {
        TaskError::from_error(
            agent,
            &A2aError::Timeout {
                agent: agent.to_string(),
                after_ms: self.config.overall_plan_timeout_ms,
            },
        )
    }

    /// One execution unit: drives a single task to a terminal state.
    async fn run_unit(
        self,
        plan_id: String,
        mut task: Task,
        card: AgentCard,
        cancel: CancellationToken,
        deadline: Instant,
        observer: Option<TaskObserver>,
    ) -> Task {
        let agent = card.name.clone();
        let mode = if self.config.prefer_streaming && card.capabilities.streaming {
            CallMode::Stream
        } else {
            CallMode::Sync
        };

        loop {
            let trial = match self.breakers.acquire(&agent) {
                Ok(trial) => trial,
                Err(retry_in) => {
                    let err = A2aError::AgentUnavailable {
                        agent: agent.clone(),
                        retry_in_ms: millis(retry_in),
                    };
                    tracing::warn!(plan = %plan_id, task = %task.id, agent = %agent, "Circuit open, not calling agent");
                    finish(&mut task, Err(TaskError::from_error(&agent, &err)));
                    notify(&observer, &task);
                    return task;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = self.permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                drop(trial);
                finish(&mut task, Err(TaskError::from_error(&agent, &A2aError::Cancelled)));
                notify(&observer, &task);
                return task;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                drop(permit);
                drop(trial);
                finish(&mut task, Err(self.plan_timeout_error(&agent)));
                notify(&observer, &task);
                return task;
            }

            step(&mut task, TaskState::Dispatched);
            notify(&observer, &task);

            // A fresh call id per attempt.
            let call = AgentCall::new(task.session_id.clone(), task.input.clone());
            let call_timeout = self.config.agent_call_timeout().min(remaining);
            tracing::debug!(
                plan = %plan_id,
                task = %task.id,
                agent = %agent,
                call_id = %call.call_id,
                attempt = task.retry_count + 1,
                "Calling agent"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(A2aError::Cancelled),
                r = tokio::time::timeout(
                    call_timeout,
                    call_agent(self.client.as_ref(), &card, &call, mode, call_timeout),
                ) => r.unwrap_or_else(|_| Err(A2aError::Timeout {
                    agent: agent.clone(),
                    after_ms: millis(call_timeout),
                })),
            };
            drop(permit);

            match result {
                Ok(message) => {
                    trial.succeeded();
                    finish(&mut task, Ok(message));
                    notify(&observer, &task);
                    return task;
                }
                Err(err) if err.is_retryable() => {
                    trial.failed();
                    if matches!(err, A2aError::Timeout { .. }) {
                        step(&mut task, TaskState::TimedOut);
                    }
                    let last = TaskError::from_error(&agent, &err);

                    if task.retry_count >= self.config.retry.max_retries || cancel.is_cancelled() {
                        tracing::warn!(task = %task.id, agent = %agent, "Giving up: {}", err);
                        finish(&mut task, Err(last));
                        notify(&observer, &task);
                        return task;
                    }

                    step(&mut task, TaskState::Retrying);
                    task.error = Some(last);
                    notify(&observer, &task);
                    let delay = self.config.retry.delay_for(task.retry_count);
                    tracing::info!(
                        task = %task.id,
                        agent = %agent,
                        attempt = task.retry_count,
                        delay_ms = millis(delay),
                        "Retrying after: {}",
                        err
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            finish(&mut task, Err(TaskError::from_error(&agent, &A2aError::Cancelled)));
                            notify(&observer, &task);
                            return task;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    drop(trial);
                    tracing::warn!(task = %task.id, agent = %agent, "Task failed: {}", err);
                    finish(&mut task, Err(TaskError::from_error(&agent, &err)));
                    notify(&observer, &task);
                    return task;
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn notify(observer: &Option<TaskObserver>, task: &Task) {
    if let Some(f) = observer {
        f(task);
    }
}

fn step(task: &mut Task, next: TaskState) {
    if let Err(e) = task.transition(next) {
        tracing::error!(task = %task.id, "{}", e);
    }
}

fn finish(task: &mut Task, outcome: Result<Message, TaskError>) {
    let applied = match outcome {
        Ok(message) => task.succeed(message),
        Err(err) => task.fail(err),
    };
    if let Err(e) = applied {
        tracing::error!(task = %task.id, "{}", e);
    }
}

/// Fail a task whatever state its unit left it in.
fn force_fail(task: &mut Task, err: TaskError) {
    if task.is_terminal() {
        return;
    }
    if task.state == TaskState::Pending || task.state.can_transition_to(TaskState::Failed) {
        finish(task, Err(err));
    }
}

/// The node's own input followed by the outputs of its prerequisites.
fn with_upstream_context(task: &Task, plan: &Plan, done: &HashMap<String, Task>) -> Message {
    let mut input = task.input.clone();
    let mut seen = HashSet::new();
    for dep in plan.graph.prerequisites(&task.id) {
        if !seen.insert(dep) {
            continue;
        }
        let Some(result) = done.get(dep).and_then(|t| t.result.as_ref()) else {
            continue;
        };
        input
            .parts
            .push(Part::text(format!("[output of {}]\n{}", dep, result.text())));
        input
            .parts
            .extend(result.parts.iter().filter(|p| p.as_text().is_none()).cloned());
    }
    input
}
