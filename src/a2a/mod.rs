//! A2A (Agent-to-Agent) orchestration engine.
//!
//! Request path: [`registry`] snapshot → [`matcher`] → [`planner`] →
//! [`dispatcher`] (over [`client`], guarded by [`breaker`]) →
//! [`aggregator`]. [`orchestrator`] ties the path together with the
//! [`session`] store; [`handler`] and [`server`] expose it over
//! JSON-RPC 2.0 and HTTP.

pub mod agent_card;
pub mod aggregator;
pub mod breaker;
pub mod client;
pub mod dispatcher;
pub mod graph;
pub mod handler;
pub mod health;
pub mod matcher;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod server;
pub mod session;
pub mod sse;
pub mod task;
pub mod types;

pub use client::{AgentClient, HttpAgentClient};
pub use orchestrator::{OrchestrationReply, OrchestrationRequest, Orchestrator};
pub use registry::AgentRegistry;
