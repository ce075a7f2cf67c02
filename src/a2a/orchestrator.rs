//! Orchestrator: the request path end to end.
//!
//! Session read and append, registry snapshot, planning with the prior
//! turns as context, dispatch and aggregation, plus a record of every plan
//! so `tasks/get` and `tasks/cancel` can find it while it runs and after it
//! finishes.

use crate::a2a::aggregator::aggregate;
use crate::a2a::breaker::BreakerBoard;
use crate::a2a::client::AgentClient;
use crate::a2a::dispatcher::{Dispatcher, PlanOutcome, TaskObserver};
use crate::a2a::health::HealthMonitor;
use crate::a2a::matcher::{Candidate, MatchConstraints, Matcher};
use crate::a2a::planner::PlanBuilder;
use crate::a2a::registry::AgentRegistry;
use crate::a2a::session::{Session, SessionStore};
use crate::a2a::task::{PlanStatus, Task, TaskError, TaskState};
use crate::a2a::types::{AgentCard, Message};
use crate::config::Config;
use crate::error::{A2aError, Result};
use crate::utils::{retry, RetryConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One caller request.
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    /// Used as the plan id when given.
    pub plan_id: Option<String>,
    pub session_id: Option<String>,
    pub message: Message,
}

impl OrchestrationRequest {
    pub fn new(message: Message) -> Self {
        Self {
            plan_id: None,
            session_id: None,
            message,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReply {
    pub plan_id: String,
    pub session_id: String,
    pub status: PlanStatus,
    pub message: Message,
}

/// Live view of a plan, kept after it finishes.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRecord {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub status: PlanStatus,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanLookupError {
    #[error("plan not found: {0}")]
    NotFound(String),

    #[error("plan {id} is already {status}")]
    NotCancelable { id: String, status: PlanStatus },
}

type PlanRecords = Arc<RwLock<HashMap<String, PlanRecord>>>;

/// Marks a plan cancelled if its orchestration future is dropped early.
struct ActivePlan {
    id: String,
    records: PlanRecords,
    cancel: CancellationToken,
    finished: bool,
}

impl Drop for ActivePlan {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cancel.cancel();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(&self.id)
            && record.status == PlanStatus::Running
        {
            tracing::warn!(plan = %self.id, "Caller went away, plan cancelled");
            for task in record.tasks.iter_mut().filter(|t| !t.is_terminal()) {
                let reason = TaskError::from_error(&task.agent, &A2aError::Cancelled);
                let settled = if task.state == TaskState::Pending {
                    task.skip(reason)
                } else {
                    task.fail(reason)
                };
                if let Err(e) = settled {
                    tracing::error!(plan = %self.id, task = %task.id, "{}", e);
                }
            }
            record.status = PlanStatus::Cancelled;
            record.finished_at = Some(Utc::now());
        }
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn AgentClient>,
    planner: PlanBuilder,
    matcher: Matcher,
    dispatcher: Dispatcher,
    sessions: Arc<SessionStore>,
    plans: PlanRecords,
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config, registry: Arc<AgentRegistry>, client: Arc<dyn AgentClient>) -> Self {
        let breakers = Arc::new(BreakerBoard::new(config.breaker.clone()));
        let dispatcher = Dispatcher::new(
            client.clone(),
            registry.clone(),
            breakers,
            config.dispatch.clone(),
        );
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(config.session.ttl_secs)));
        Self {
            registry,
            client,
            planner: PlanBuilder::default(),
            matcher: Matcher::default(),
            dispatcher,
            sessions,
            plans: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch and register the card of every seed URL. Fetches are retried
    /// with the dispatch backoff policy; a seed that never answers is
    /// logged and skipped. Returns the names registered.
    pub async fn register_seeds(&self, urls: &[String]) -> Vec<String> {
        let timeout = Duration::from_millis(self.config.registry.health_timeout_ms);
        let policy = RetryConfig {
            max_retries: self.config.dispatch.retry.max_retries.min(2),
            ..self.config.dispatch.retry.clone()
        };
        let mut registered = Vec::new();
        for url in urls {
            let fetched = retry(&policy, || self.client.fetch_card(url, timeout)).await;
            match fetched.and_then(|card| {
                let name = card.name.clone();
                self.registry.register(card)?;
                Ok(name)
            }) {
                Ok(name) => {
                    tracing::info!(agent = %name, url = %url, "Registered seed agent");
                    registered.push(name);
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "Could not register seed agent"),
            }
        }
        registered
    }

    /// Rank registered agents for a query.
    pub fn discover(&self, query: &str, constraints: &MatchConstraints) -> Result<Vec<Candidate>> {
        let snapshot = self.registry.snapshot();
        let candidates = self.matcher.match_query(query, constraints, &snapshot);
        if candidates.is_empty() {
            return Err(A2aError::DiscoveryEmpty {
                query: query.to_string(),
            });
        }
        Ok(candidates)
    }

    /// Run one request to completion and return the aggregated reply.
    ///
    /// Dropping the returned future cancels the plan.
    pub async fn handle(&self, request: OrchestrationRequest) -> Result<OrchestrationReply> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let history = self
            .sessions
            .get(&session_id)
            .unwrap_or_else(|_| Session::new(&session_id));
        self.sessions.append(&session_id, request.message.clone());

        let snapshot: Vec<AgentCard> = self.registry.snapshot();
        let mut plan = self
            .planner
            .build_for_message(&request.message, &history, &snapshot)?;
        if let Some(id) = request.plan_id {
            plan.id = id;
        }
        let plan_id = plan.id.clone();

        let cancel = CancellationToken::new();
        self.insert_record(PlanRecord {
            id: plan_id.clone(),
            session_id: session_id.clone(),
            query: plan.query.clone(),
            status: PlanStatus::Running,
            tasks: plan.tasks.clone(),
            created_at: Utc::now(),
            finished_at: None,
            cancel: cancel.clone(),
        })?;
        let mut active = ActivePlan {
            id: plan_id.clone(),
            records: self.plans.clone(),
            cancel: cancel.clone(),
            finished: false,
        };

        let outcome = self
            .dispatcher
            .execute_observed(plan, cancel, Some(self.observer(&plan_id)))
            .await;
        active.finished = true;
        self.finish_record(&outcome);

        let message = aggregate(&outcome)?;
        self.sessions.append(&session_id, message.clone());
        tracing::info!(plan = %plan_id, status = %outcome.status, "Orchestration finished");
        Ok(OrchestrationReply {
            plan_id,
            session_id,
            status: outcome.status,
            message,
        })
    }

    pub fn plan_record(&self, plan_id: &str) -> std::result::Result<PlanRecord, PlanLookupError> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plan_id)
            .cloned()
            .ok_or_else(|| PlanLookupError::NotFound(plan_id.to_string()))
    }

    /// Cancel a running plan. Its tasks settle as the dispatcher unwinds.
    pub fn cancel(&self, plan_id: &str) -> std::result::Result<PlanRecord, PlanLookupError> {
        let record = self.plan_record(plan_id)?;
        if record.status != PlanStatus::Running {
            return Err(PlanLookupError::NotCancelable {
                id: plan_id.to_string(),
                status: record.status,
            });
        }
        tracing::info!(plan = %plan_id, "Cancelling plan");
        record.cancel.cancel();
        Ok(record)
    }

    /// Drop records of plans that finished longer than `max_age` ago.
    pub fn prune_plans(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        let before = plans.len();
        plans.retain(|_, r| r.finished_at.is_none_or(|at| at > cutoff));
        before - plans.len()
    }

    /// Start the health monitor and the session/plan purger.
    pub fn spawn_background(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let monitor = HealthMonitor::new(self.registry.clone(), self.client.clone(), &self.config.registry);
        let purger = self
            .sessions
            .clone()
            .spawn_purger(Duration::from_secs(self.config.session.purge_interval_secs.max(1)), cancel.clone());

        let this = self;
        let prune_cancel = cancel.clone();
        let pruner = tokio::spawn(async move {
            let interval = Duration::from_secs(this.config.session.purge_interval_secs.max(1));
            let retention = Duration::from_secs(this.config.session.ttl_secs);
            loop {
                tokio::select! {
                    _ = prune_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let removed = this.prune_plans(retention);
                        if removed > 0 {
                            tracing::debug!(removed, "Pruned finished plan records");
                        }
                    }
                }
            }
        });

        vec![monitor.spawn(cancel), purger, pruner]
    }

    fn insert_record(&self, record: PlanRecord) -> Result<()> {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        if plans
            .get(&record.id)
            .is_some_and(|r| r.status == PlanStatus::Running)
        {
            return Err(A2aError::Planning(format!(
                "plan id '{}' is already running",
                record.id
            )));
        }
        plans.insert(record.id.clone(), record);
        Ok(())
    }

    fn observer(&self, plan_id: &str) -> TaskObserver {
        let plans = self.plans.clone();
        let plan_id = plan_id.to_string();
        Arc::new(move |task: &Task| {
            let mut plans = plans.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = plans.get_mut(&plan_id)
                && let Some(slot) = record.tasks.iter_mut().find(|t| t.id == task.id)
                && !slot.is_terminal()
            {
                *slot = task.clone();
            }
        })
    }

    fn finish_record(&self, outcome: &PlanOutcome) {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = plans.get_mut(&outcome.plan_id) {
            record.status = outcome.status;
            record.tasks = outcome.tasks.clone();
            record.finished_at = Some(Utc::now());
        }
    }
}
