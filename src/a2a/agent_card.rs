//! Agent Card generation and validation.
//!
//! Builds the card this gateway publishes at `.well-known/agent.json`, and
//! checks the cards remote agents hand us before they enter the registry.

use crate::a2a::types::*;
use crate::error::RegistryError;

/// Build the Agent Card for this Crabswarm instance.
pub fn build_agent_card(host: &str, port: u16) -> AgentCard {
    let base_url = format!("http://{}:{}", host, port);

    AgentCard {
        name: format!("Crabswarm Orchestrator (v{})", crate::VERSION),
        url: format!("{}/a2a/v1", base_url),
        description: Some(
            "A2A orchestration engine. Decomposes requests into sub-tasks, \
             dispatches them to registered agents and merges the results."
                .to_string(),
        ),
        version: Some(crate::VERSION.to_string()),
        capabilities: AgentCapabilities {
            streaming: false,
            batch: true,
            multimodal: true,
            extensions: Default::default(),
        },
        skills: vec![
            AgentSkill {
                id: "orchestration".to_string(),
                name: "Multi-Agent Orchestration".to_string(),
                description: "Split a request into sub-tasks, route each to the best \
                              registered agent and return one consolidated answer."
                    .to_string(),
                tags: vec![
                    "orchestration".to_string(),
                    "planning".to_string(),
                    "multi-agent".to_string(),
                ],
                examples: vec!["Search flights to Lisbon and then book a hotel.".to_string()],
                input_modes: vec!["text/plain".to_string()],
                output_modes: vec!["text/plain".to_string(), "application/json".to_string()],
            },
            AgentSkill {
                id: "discovery".to_string(),
                name: "Agent Discovery".to_string(),
                description: "Rank registered agents by how well their skills fit a query."
                    .to_string(),
                tags: vec!["discovery".to_string(), "registry".to_string()],
                examples: vec!["Which agent can summarize PDF documents?".to_string()],
                input_modes: vec!["text/plain".to_string()],
                output_modes: vec!["application/json".to_string()],
            },
        ],
        default_input_modes: vec!["text/plain".to_string(), "application/json".to_string()],
        default_output_modes: vec!["text/plain".to_string(), "application/json".to_string()],
        health_status: HealthStatus::Healthy,
        health_url: Some(format!("{}/a2a/health", base_url)),
        provider: Some(AgentProvider {
            organization: "Crabswarm Contributors".to_string(),
            url: Some("https://github.com/adolfousier/crabswarm".to_string()),
        }),
    }
}

/// Check the fields the registry depends on: a name, a parseable URL and
/// at least one skill with an id.
pub fn validate_card(card: &AgentCard) -> Result<(), RegistryError> {
    if card.name.trim().is_empty() {
        return Err(RegistryError::Invalid("name must not be empty".to_string()));
    }
    if card.url.trim().is_empty() {
        return Err(RegistryError::Invalid(format!(
            "agent '{}' has an empty url",
            card.name
        )));
    }
    if let Err(e) = reqwest::Url::parse(&card.url) {
        return Err(RegistryError::Invalid(format!(
            "agent '{}' has an invalid url '{}': {}",
            card.name, card.url, e
        )));
    }
    if card.skills.is_empty() {
        return Err(RegistryError::Invalid(format!(
            "agent '{}' declares no skills",
            card.name
        )));
    }
    if let Some(skill) = card.skills.iter().find(|s| s.id.trim().is_empty()) {
        return Err(RegistryError::Invalid(format!(
            "agent '{}' has a skill without an id ({:?})",
            card.name, skill.name
        )));
    }
    Ok(())
}

/// Resolve the endpoint used for health probes.
pub fn health_endpoint(card: &AgentCard) -> Option<String> {
    if let Some(url) = &card.health_url {
        return Some(url.clone());
    }
    reqwest::Url::parse(&card.url)
        .and_then(|u| u.join("/a2a/health"))
        .ok()
        .map(String::from)
}

#[cfg(test)]
pub(crate) fn test_card(name: &str, tags: &[&str]) -> AgentCard {
    AgentCard {
        name: name.to_string(),
        url: format!("http://{}.agents.local:9000/a2a/v1", name),
        description: None,
        version: Some("1.0.0".to_string()),
        capabilities: AgentCapabilities::default(),
        skills: vec![AgentSkill {
            id: format!("{}-skill", name),
            name: name.to_string(),
            description: format!("{} agent", name),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            examples: vec![],
            input_modes: vec![],
            output_modes: vec![],
        }],
        default_input_modes: vec!["text/plain".to_string()],
        default_output_modes: vec!["text/plain".to_string()],
        health_status: HealthStatus::Healthy,
        health_url: None,
        provider: None,
    }
}
