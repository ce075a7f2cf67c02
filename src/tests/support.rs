//! Scripted in-process agent client for dispatch and orchestration tests.
//!
//! Unlike the mockall mock, calls here really suspend, so concurrency,
//! timeouts and cancellation can be observed.

use crate::a2a::client::{AgentCall, AgentClient, FrameStream};
use crate::a2a::types::{AgentCard, HealthStatus, Message};
use crate::error::{A2aError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    /// Reply `"{agent}: {input text}"`.
    Echo,
    Reply(String),
    /// Agent-reported failure.
    Fail(String),
    /// Connection-level failure.
    Reset,
    /// Never answer.
    Hang,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedClient {
    delay: Duration,
    behaviours: Mutex<HashMap<String, Behaviour>>,
    calls: Mutex<Vec<(String, Message)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            behaviours: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set(&self, agent: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .expect("behaviours")
            .insert(agent.to_string(), behaviour);
    }

    /// Agents called so far, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(agent, _)| agent.clone())
            .collect()
    }

    /// Inputs sent to `agent`, in call order.
    pub(crate) fn inputs_to(&self, agent: &str) -> Vec<Message> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(a, _)| a == agent)
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub(crate) fn calls_to(&self, agent: &str) -> usize {
        self.calls().iter().filter(|a| *a == agent).count()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    async fn send(&self, card: &AgentCard, call: &AgentCall, _deadline: Duration) -> Result<Message> {
        self.calls
            .lock()
            .expect("calls")
            .push((card.name.clone(), call.message.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let behaviour = self
            .behaviours
            .lock()
            .expect("behaviours")
            .get(&card.name)
            .cloned()
            .unwrap_or(Behaviour::Echo);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match behaviour {
            Behaviour::Echo => Ok(Message::agent(format!("{}: {}", card.name, call.message.text()))),
            Behaviour::Reply(text) => Ok(Message::agent(text)),
            Behaviour::Fail(reason) => Err(A2aError::TaskFailed {
                agent: card.name.clone(),
                message: reason,
            }),
            Behaviour::Reset => Err(A2aError::Transport {
                agent: card.name.clone(),
                message: "connection reset by peer".to_string(),
            }),
            Behaviour::Hang => {
                futures::future::pending::<()>().await;
                Err(A2aError::Cancelled)
            }
        }
    }

    async fn stream(&self, card: &AgentCard, _call: &AgentCall, _deadline: Duration) -> Result<FrameStream> {
        Err(A2aError::Protocol {
            agent: card.name.clone(),
            message: "streaming not scripted".to_string(),
        })
    }

    async fn probe(&self, _card: &AgentCard, _timeout: Duration) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn fetch_card(&self, base_url: &str, _timeout: Duration) -> Result<AgentCard> {
        Err(A2aError::Transport {
            agent: base_url.to_string(),
            message: "no cards scripted".to_string(),
        })
    }
}
