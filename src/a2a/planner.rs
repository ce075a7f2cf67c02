//! Plan Builder: turn a request into a graph of agent-bound tasks.
//!
//! Free text is split into sequential stages on "then" and into parallel
//! parts on "and" / ";". Each part is tagged with the registry tags its
//! words mention (matched by stem); parts that mention no tag are folded
//! into a neighbour so "search and compare flights" stays one node.
//! Every node is bound to the matcher's top candidate, and the tail of the
//! session history rides along in each node's input. No I/O happens here:
//! the result depends only on the query, the session and the registry
//! snapshot.

use crate::a2a::graph::{Dependency, TaskGraph};
use crate::a2a::matcher::{keywords, MatchConstraints, Matcher};
use crate::a2a::session::Session;
use crate::a2a::task::Task;
use crate::a2a::types::{AgentCard, HealthStatus, Message, Part, Role};
use crate::utils::truncate_str;
use crate::error::{A2aError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

// `None` only if a pattern failed to compile; text is then left unsplit.
static STAGE_SPLIT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(?:,\s*)?\band\s+then\b|(?:,\s*)?\bthen\b").ok());
/// Prior messages forwarded to agents, newest last.
pub const CONTEXT_MESSAGES: usize = 6;
const CONTEXT_MESSAGE_BYTES: usize = 500;

static PART_SPLIT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i);|\band\b").ok());

fn split_on(pattern: &Lazy<Option<Regex>>, text: &str) -> Vec<String> {
    match pattern.as_ref() {
        Some(re) => re.split(text).map(clean).filter(|s| !s.is_empty()).collect(),
        None => vec![clean(text)],
    }
}

/// One unit of work before it is bound to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequest {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Failure of an optional node does not fail the plan.
    #[serde(default)]
    pub optional: bool,
}

impl SubRequest {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            tags: Vec::new(),
            depends_on: Vec::new(),
            optional: false,
        }
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub session_id: String,
    pub query: String,
    /// Nodes in declaration order.
    pub tasks: Vec<Task>,
    pub graph: TaskGraph,
    /// Cards the nodes were bound to, as seen at planning time.
    pub agents: BTreeMap<String, AgentCard>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    matcher: Matcher,
}

impl PlanBuilder {
    pub fn new(matcher: Matcher) -> Self {
        Self { matcher }
    }

    /// Split free text into sub-requests using the snapshot's tag vocabulary.
    pub fn decompose(&self, query: &str, snapshot: &[AgentCard]) -> Vec<SubRequest> {
        let vocabulary = tag_vocabulary(snapshot);
        let mut requests: Vec<SubRequest> = Vec::new();
        let mut previous_stage: Vec<String> = Vec::new();

        for stage in split_on(&STAGE_SPLIT, query) {
            let mut parts: Vec<(String, Vec<String>)> = Vec::new();
            let mut carry: Option<String> = None;

            for fragment in split_on(&PART_SPLIT, &stage) {
                let text = match carry.take() {
                    Some(prefix) => format!("{} and {}", prefix, fragment),
                    None => fragment,
                };
                let tags = infer_tags(&text, &vocabulary);
                if !tags.is_empty() {
                    parts.push((text, tags));
                } else if let Some(last) = parts.last_mut() {
                    last.0 = format!("{} and {}", last.0, text);
                } else {
                    carry = Some(text);
                }
            }
            if let Some(rest) = carry {
                parts.push((rest, Vec::new()));
            }

            let mut this_stage = Vec::with_capacity(parts.len());
            for (text, tags) in parts {
                let id = format!("t{}", requests.len() + 1);
                requests.push(SubRequest {
                    id: id.clone(),
                    text,
                    tags,
                    depends_on: previous_stage.clone(),
                    optional: false,
                });
                this_stage.push(id);
            }
            if !this_stage.is_empty() {
                previous_stage = this_stage;
            }
        }

        if requests.is_empty() {
            requests.push(SubRequest::new("t1", query.trim()));
        }
        requests
    }

    /// Decompose `query` and bind every node to its best agent. `session`
    /// holds the turns before this one.
    pub fn build_plan(&self, query: &str, session: &Session, snapshot: &[AgentCard]) -> Result<Plan> {
        let requests = self.decompose(query, snapshot);
        let mut plan = self.build_from_requests(query, requests, &session.id, snapshot)?;
        if let Some(context) = conversation_context(session) {
            for task in &mut plan.tasks {
                task.input.parts.push(context.clone());
            }
        }
        Ok(plan)
    }

    /// Plan for a full message: non-text parts and accepted output modes
    /// are forwarded to every node.
    pub fn build_for_message(
        &self,
        message: &Message,
        session: &Session,
        snapshot: &[AgentCard],
    ) -> Result<Plan> {
        let query = message.text();
        let mut plan = self.build_plan(&query, session, snapshot)?;
        let attachments: Vec<Part> = message
            .parts
            .iter()
            .filter(|p| p.as_text().is_none())
            .cloned()
            .collect();
        for task in &mut plan.tasks {
            task.input.parts.extend(attachments.iter().cloned());
            task.input.accepted_output_modes = message.accepted_output_modes.clone();
        }
        Ok(plan)
    }

    /// Bind already-decomposed sub-requests.
    ///
    /// Fails with `DiscoveryEmpty` when no node has any candidate and with
    /// `Planning` when only some do, when ids are invalid, or when the
    /// dependencies form a cycle. Optional nodes without a candidate are
    /// dropped as long as nothing depends on them.
    pub fn build_from_requests(
        &self,
        query: &str,
        requests: Vec<SubRequest>,
        session_id: &str,
        snapshot: &[AgentCard],
    ) -> Result<Plan> {
        if requests.is_empty() {
            return Err(A2aError::Planning("request produced no sub-tasks".to_string()));
        }

        let mut unbound: Vec<&SubRequest> = Vec::new();
        let mut bound: Vec<(&SubRequest, AgentCard, String)> = Vec::new();
        for req in &requests {
            let constraints = MatchConstraints {
                tags: req.tags.clone(),
                max_results: Some(1),
                ..MatchConstraints::default()
            };
            match self.matcher.match_query(&req.text, &constraints, snapshot).into_iter().next() {
                Some(best) => {
                    let capability = req
                        .tags
                        .first()
                        .cloned()
                        .unwrap_or_else(|| best.matched_skill.clone());
                    bound.push((req, best.card, capability));
                }
                None => unbound.push(req),
            }
        }

        if bound.is_empty() {
            return Err(A2aError::DiscoveryEmpty {
                query: query.to_string(),
            });
        }

        let mut dropped: HashSet<&str> = HashSet::new();
        for req in &unbound {
            let needed = requests
                .iter()
                .any(|r| r.depends_on.iter().any(|d| d == &req.id));
            if req.optional && !needed {
                tracing::warn!(node = %req.id, "Dropping optional sub-task with no available agent");
                dropped.insert(req.id.as_str());
            } else {
                return Err(A2aError::Planning(format!(
                    "no agent available for sub-task '{}' ({}){}",
                    req.id,
                    crate::utils::truncate_str(&req.text, 80),
                    if req.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" with tags [{}]", req.tags.join(", "))
                    }
                )));
            }
        }

        let plan_id = Uuid::new_v4().to_string();
        let mut tasks = Vec::with_capacity(bound.len());
        let mut edges = Vec::new();
        let mut agents = BTreeMap::new();
        for (req, card, capability) in bound {
            let mut task = Task::new(
                req.id.clone(),
                session_id,
                card.name.clone(),
                capability,
                Message::user(req.text.clone()),
            );
            task.optional = req.optional;
            task.depends_on = req
                .depends_on
                .iter()
                .filter(|d| !dropped.contains(d.as_str()))
                .cloned()
                .collect();
            for dep in &task.depends_on {
                edges.push(Dependency::new(dep.clone(), task.id.clone()));
            }
            agents.insert(card.name.clone(), card);
            tasks.push(task);
        }

        let graph = TaskGraph::new(tasks.iter().map(|t| t.id.clone()).collect(), edges);
        graph
            .validate()
            .map_err(|e| A2aError::Planning(e.to_string()))?;

        tracing::info!(
            plan = %plan_id,
            nodes = tasks.len(),
            edges = graph.edges.len(),
            "Plan built"
        );
        Ok(Plan {
            id: plan_id,
            session_id: session_id.to_string(),
            query: query.to_string(),
            tasks,
            graph,
            agents,
        })
    }
}

/// The last few turns as one text part, or `None` on a fresh session.
fn conversation_context(session: &Session) -> Option<Part> {
    let start = session.messages.len().saturating_sub(CONTEXT_MESSAGES);
    let turns = &session.messages[start..];
    if turns.is_empty() {
        return None;
    }
    let lines: Vec<String> = turns
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "user",
                Role::Agent => "agent",
                Role::System => "system",
            };
            format!("{}: {}", who, truncate_str(&m.text(), CONTEXT_MESSAGE_BYTES))
        })
        .collect();
    Some(Part::text(format!("[conversation so far]\n{}", lines.join("\n"))))
}

fn clean(s: &str) -> String {
    s.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?'))
        .to_string()
}

/// Tags of reachable agents, first occurrence wins, compared case-insensitively.
fn tag_vocabulary(snapshot: &[AgentCard]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut vocabulary = Vec::new();
    for card in snapshot
        .iter()
        .filter(|c| c.health_status != HealthStatus::Unreachable)
    {
        for tag in card.tags() {
            if seen.insert(tag.to_lowercase()) {
                vocabulary.push(tag.to_string());
            }
        }
    }
    vocabulary
}

/// Tags all of whose words occur (by stem) in `text`.
fn infer_tags(text: &str, vocabulary: &[String]) -> Vec<String> {
    let words = keywords(text);
    vocabulary
        .iter()
        .filter(|tag| {
            let needed = keywords(tag);
            !needed.is_empty() && needed.is_subset(&words)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::agent_card::test_card;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn travel_snapshot() -> Vec<AgentCard> {
        vec![test_card("flight-finder", &["flights"]), test_card("hotel-booker", &["hotels"])]
    }

    #[test]
    fn test_single_capability_query() {
        let snapshot = vec![test_card("summarizer", &["summarization"])];
        let plan = PlanBuilder::default()
            .build_plan("Summarize document X", &Session::new("s1"), &snapshot)
            .expect("plan");

        assert_eq!(plan.len(), 1);
        let task = &plan.tasks[0];
        assert_eq!(task.agent, "summarizer");
        assert_eq!(task.capability, "summarization");
        assert_eq!(task.input.text(), "Summarize document X");
        assert!(plan.graph.edges.is_empty());
    }

    #[test]
    fn test_parallel_parts_have_no_edges() {
        let plan = PlanBuilder::default()
            .build_plan("Search flights to Lisbon and search hotels in Alfama", &Session::new("s1"), &travel_snapshot())
            .expect("plan");

        let agents: Vec<&str> = plan.tasks.iter().map(|t| t.agent.as_str()).collect();
        assert_eq!(agents, vec!["flight-finder", "hotel-booker"]);
        assert!(plan.graph.edges.is_empty());
        assert!(plan.tasks.iter().all(|t| t.depends_on.is_empty()));
    }

    #[test]
    fn test_then_creates_dependency() {
        let plan = PlanBuilder::default()
            .build_plan("Search flights to Lisbon, then book a hotel near the airport", &Session::new("s1"), &travel_snapshot())
            .expect("plan");

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec!["t1"]);
        assert_eq!(plan.graph.edges, vec![Dependency::new("t1", "t2")]);
    }

    #[test]
    fn test_untagged_fragments_fold_into_neighbours() {
        let builder = PlanBuilder::default();
        let requests = builder.decompose("Search and compare flights; also hotels", &travel_snapshot());
        let texts: Vec<&str> = requests.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["Search and compare flights", "also hotels"]);
        assert_eq!(requests[0].tags, vec!["flights"]);
        assert_eq!(requests[1].tags, vec!["hotels"]);
    }

    #[test]
    fn test_untagged_query_is_one_node() {
        let requests = PlanBuilder::default().decompose("What is the weather like?", &travel_snapshot());
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tags.is_empty());
        assert_eq!(requests[0].text, "What is the weather like");
    }

    #[test]
    fn test_no_candidates_is_discovery_empty() {
        let err = PlanBuilder::default()
            .build_plan("Summarize document X", &Session::new("s1"), &[])
            .expect_err("empty registry");
        assert_eq!(err.kind(), ErrorKind::DiscoveryEmpty);
    }

    #[test]
    fn test_partial_candidates_is_planning_error() {
        let requests = vec![
            SubRequest::new("a", "search flights").tagged(&["flights"]),
            SubRequest::new("b", "rent a car").tagged(&["cars"]),
        ];
        let err = PlanBuilder::default()
            .build_from_requests("trip", requests, "s1", &travel_snapshot())
            .expect_err("missing capability");
        assert_eq!(err.kind(), ErrorKind::PlanningError);
        assert!(err.to_string().contains("cars"));
    }

    #[test]
    fn test_unreachable_agents_are_not_bound() {
        let mut snapshot = travel_snapshot();
        snapshot[1].health_status = HealthStatus::Unreachable;
        let err = PlanBuilder::default()
            .build_from_requests(
                "hotels",
                vec![SubRequest::new("h", "search hotels").tagged(&["hotels"])],
                "s1",
                &snapshot,
            )
            .expect_err("unreachable");
        assert_eq!(err.kind(), ErrorKind::DiscoveryEmpty);
    }

    #[test]
    fn test_optional_node_without_agent_is_dropped() {
        let mut car = SubRequest::new("c", "rent a car").tagged(&["cars"]);
        car.optional = true;
        let requests = vec![SubRequest::new("f", "search flights").tagged(&["flights"]), car];
        let plan = PlanBuilder::default()
            .build_from_requests("trip", requests, "s1", &travel_snapshot())
            .expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks[0].id, "f");
    }

    #[test]
    fn test_cycle_is_planning_error() {
        let requests = vec![
            SubRequest::new("a", "search flights").tagged(&["flights"]).after(&["b"]),
            SubRequest::new("b", "search hotels").tagged(&["hotels"]).after(&["a"]),
        ];
        let err = PlanBuilder::default()
            .build_from_requests("loop", requests, "s1", &travel_snapshot())
            .expect_err("cycle");
        assert_eq!(err.kind(), ErrorKind::PlanningError);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_message_attachments_are_forwarded() {
        let snapshot = vec![test_card("vision", &["image"])];
        let mut message = Message::new(
            Role::User,
            vec![Part::text("Describe this image"), Part::inline_image(b"png", "image/png")],
        );
        message.accepted_output_modes = vec!["text/markdown".to_string()];
        let plan = PlanBuilder::default()
            .build_for_message(&message, &Session::new("s1"), &snapshot)
            .expect("plan");
        let input = &plan.tasks[0].input;
        assert_eq!(input.parts.len(), 2);
        assert_eq!(input.parts[1].kind(), "image");
        assert_eq!(input.accepted_output_modes, vec!["text/markdown"]);
    }

    #[test]
    fn test_prior_turns_are_forwarded_to_every_node() {
        let mut session = Session::new("s1");
        for i in 0..8 {
            session.messages.push(Message::user(format!("question {i}")));
            session.messages.push(Message::agent(format!("answer {i}")));
        }
        let plan = PlanBuilder::default()
            .build_plan("Search flights to Lisbon and search hotels in Alfama", &session, &travel_snapshot())
            .expect("plan");

        for task in &plan.tasks {
            assert_eq!(task.session_id, "s1");
            let context = task.input.parts.last().and_then(Part::as_text).expect("context part");
            assert!(context.starts_with("[conversation so far]"));
            assert!(context.ends_with("agent: answer 7"));
            assert!(context.contains("user: question 5"));
            assert!(!context.contains("answer 4"));
        }
        assert_eq!(plan.tasks[0].input.parts.len(), 2);
    }

    #[test]
    fn test_fresh_session_adds_no_context() {
        let plan = PlanBuilder::default()
            .build_plan("Summarize document X", &Session::new("s1"), &[test_card("summarizer", &["summarization"])])
            .expect("plan");
        assert_eq!(plan.tasks[0].input.parts.len(), 1);
    }

    proptest! {
        #[test]
        fn plans_are_always_acyclic(
            deps in proptest::collection::vec(proptest::collection::vec(0usize..6, 0..3), 1..6),
        ) {
            let n = deps.len();
            let requests: Vec<SubRequest> = deps
                .iter()
                .enumerate()
                .map(|(i, ds)| {
                    let mut r = SubRequest::new(format!("n{i}"), "search flights").tagged(&["flights"]);
                    r.depends_on = ds.iter().filter(|d| **d < n).map(|d| format!("n{d}")).collect();
                    r
                })
                .collect();
            match PlanBuilder::default().build_from_requests("q", requests, "s", &travel_snapshot()) {
                Ok(plan) => prop_assert!(plan.graph.topological_order().is_ok()),
                Err(e) => prop_assert_eq!(e.kind(), ErrorKind::PlanningError),
            }
        }
    }
}
