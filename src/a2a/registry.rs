//! Agent Card Registry.
//!
//! Catalog of remote agents keyed by name. The outer map lock is held only
//! to insert, remove or look up an entry; each card sits behind its own
//! lock so health updates for one agent never block another.

use crate::a2a::agent_card::validate_card;
use crate::a2a::client::AgentClient;
use crate::a2a::types::{AgentCard, Capability, HealthStatus};
use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

struct RegistryEntry {
    /// Insertion sequence; preserved across re-registration.
    seq: u64,
    card: RwLock<AgentCard>,
    unreachable_streak: AtomicU32,
}

impl RegistryEntry {
    fn card(&self) -> AgentCard {
        self.card
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Filter for [`AgentRegistry::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RegistryFilter {
    /// Agent must carry at least one of these tags.
    pub tags: Vec<String>,
    pub capability: Option<Capability>,
}

impl RegistryFilter {
    fn matches(&self, card: &AgentCard) -> bool {
        let tags_ok = self.tags.is_empty() || self.tags.iter().any(|t| card.has_tag(t));
        let cap_ok = self
            .capability
            .as_ref()
            .is_none_or(|c| card.capabilities.supports(c));
        tags_ok && cap_ok
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    next_seq: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a card. Re-registering a name replaces the card
    /// (last write wins) but keeps its original position in listings.
    pub fn register(&self, card: AgentCard) -> Result<(), RegistryError> {
        validate_card(&card)?;
        let name = card.name.clone();

        // Replace under the map lock so a concurrent deregister cannot
        // orphan the write.
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
        {
            *entry.card.write().unwrap_or_else(PoisonError::into_inner) = card;
            entry.unreachable_streak.store(0, Ordering::Relaxed);
            tracing::info!(agent = %name, "A2A: Updated agent card");
            return Ok(());
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&name) {
            // Lost a race with a concurrent register of the same name.
            Some(entry) => {
                *entry.card.write().unwrap_or_else(PoisonError::into_inner) = card;
            }
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entries.insert(
                    name.clone(),
                    Arc::new(RegistryEntry {
                        seq,
                        card: RwLock::new(card),
                        unreachable_streak: AtomicU32::new(0),
                    }),
                );
            }
        }
        drop(entries);

        tracing::info!(agent = %name, "A2A: Registered agent");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<AgentCard, RegistryError> {
        self.entry(name)
            .map(|e| e.card())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Cards matching `filter`, in insertion order.
    pub fn list(&self, filter: &RegistryFilter) -> Vec<AgentCard> {
        let mut entries: Vec<Arc<RegistryEntry>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);

        entries
            .iter()
            .map(|e| e.card())
            .filter(|card| filter.matches(card))
            .collect()
    }

    /// Every registered card, in insertion order.
    pub fn snapshot(&self) -> Vec<AgentCard> {
        self.list(&RegistryFilter::default())
    }

    pub fn deregister(&self, name: &str) -> Result<AgentCard, RegistryError> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(entry) => {
                tracing::info!(agent = %name, "A2A: Deregistered agent");
                Ok(entry.card())
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set an agent's health status, returning the previous one.
    pub fn set_health(
        &self,
        name: &str,
        status: HealthStatus,
    ) -> Result<HealthStatus, RegistryError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if status == HealthStatus::Unreachable {
            entry.unreachable_streak.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.unreachable_streak.store(0, Ordering::Relaxed);
        }

        let mut card = entry.card.write().unwrap_or_else(PoisonError::into_inner);
        let previous = card.health_status;
        card.health_status = status;
        Ok(previous)
    }

    /// Consecutive probes that found the agent unreachable.
    pub fn unreachable_streak(&self, name: &str) -> Option<u32> {
        self.entry(name)
            .map(|e| e.unreachable_streak.load(Ordering::Relaxed))
    }

    /// Probe one agent's health endpoint and record the result.
    pub async fn health_check(
        &self,
        name: &str,
        client: &dyn AgentClient,
        timeout: Duration,
    ) -> Result<HealthStatus, RegistryError> {
        let card = self.get(name)?;
        let status = client.probe(&card, timeout).await;
        let previous = self.set_health(name, status)?;
        if previous != status {
            tracing::info!(
                agent = %name,
                from = %previous,
                to = %status,
                "A2A: Agent health changed"
            );
        }
        Ok(status)
    }

    fn entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
