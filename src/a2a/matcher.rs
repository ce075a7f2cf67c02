//! Discovery: rank registered agents for a query.
//!
//! Scoring is pluggable through [`Scorer`]. The matcher itself owns the
//! gates (health, tags, capability), the health multiplier and the
//! deterministic ordering; it never touches the registry or the network.

use crate::a2a::types::{AgentCard, AgentSkill, Capability, HealthStatus};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Similarity of a query to one skill, in `[0, 1]`.
pub trait Scorer: Send + Sync {
    fn score(&self, query: &str, skill: &AgentSkill) -> f64;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "for", "from", "in", "is", "it",
    "me", "my", "of", "on", "or", "please", "the", "then", "this", "to", "with", "you", "your",
];

const SUFFIXES: &[&str] = &[
    "izations", "ization", "ations", "ation", "izers", "izer", "izing", "ize", "ings", "ing",
    "ers", "er", "es", "ed", "s",
];

/// Crude suffix stripping so that "summarize", "summarizer" and
/// "summarization" meet on the same stem.
pub fn stem(word: &str) -> String {
    let lower = word.to_lowercase();
    for suffix in SUFFIXES {
        if lower.len() > suffix.len() + 2 && lower.ends_with(suffix) {
            return lower[..lower.len() - suffix.len()].to_string();
        }
    }
    lower
}

/// Stemmed content words of `text`.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

/// Fraction of the query's keywords found anywhere in the skill's id,
/// name, description, examples or tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordScorer;

impl Scorer for KeywordScorer {
    fn score(&self, query: &str, skill: &AgentSkill) -> f64 {
        let wanted = keywords(query);
        if wanted.is_empty() {
            return 0.0;
        }

        let mut vocabulary = keywords(&skill.id);
        vocabulary.extend(keywords(&skill.name));
        vocabulary.extend(keywords(&skill.description));
        for text in skill.examples.iter().chain(skill.tags.iter()) {
            vocabulary.extend(keywords(text));
        }

        let hits = wanted.iter().filter(|w| vocabulary.contains(*w)).count();
        hits as f64 / wanted.len() as f64
    }
}

/// 1.0 when the query equals the skill's id, name or one of its tags
/// (case-insensitive), else 0.0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactScorer;

impl Scorer for ExactScorer {
    fn score(&self, query: &str, skill: &AgentSkill) -> f64 {
        let q = query.trim();
        let hit = q.eq_ignore_ascii_case(&skill.id)
            || q.eq_ignore_ascii_case(&skill.name)
            || skill.tags.iter().any(|t| q.eq_ignore_ascii_case(t));
        if hit { 1.0 } else { 0.0 }
    }
}

/// Similarity credited to a skill that passed an explicit tag gate but
/// shares no words with the query.
pub const TAG_MATCH_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct MatchConstraints {
    /// Agent must have a skill carrying one of these tags.
    pub tags: Vec<String>,
    pub capability: Option<Capability>,
    pub max_results: Option<usize>,
    /// Candidates scoring below this are dropped.
    pub min_score: f64,
}

impl MatchConstraints {
    pub fn tagged(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub agent: String,
    pub score: f64,
    pub matched_skill: String,
    pub health: HealthStatus,
    pub card: AgentCard,
}

#[derive(Clone)]
pub struct Matcher {
    scorer: Arc<dyn Scorer>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Arc::new(KeywordScorer))
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher").finish_non_exhaustive()
    }
}

impl Matcher {
    pub fn new(scorer: Arc<dyn Scorer>) -> Self {
        Self { scorer }
    }

    /// Rank `cards` (given in registry insertion order) for `query`.
    ///
    /// An empty result means no agent is available; callers surface that
    /// to the user rather than treating it as an internal error.
    pub fn match_query(
        &self,
        query: &str,
        constraints: &MatchConstraints,
        cards: &[AgentCard],
    ) -> Vec<Candidate> {
        let tag_gated = !constraints.tags.is_empty();
        let mut candidates: Vec<Candidate> = Vec::new();

        for card in cards {
            if card.health_status == HealthStatus::Unreachable {
                continue;
            }
            if let Some(cap) = &constraints.capability
                && !card.capabilities.supports(cap)
            {
                continue;
            }

            let eligible: Vec<&AgentSkill> = card
                .skills
                .iter()
                .filter(|s| {
                    !tag_gated
                        || s.tags
                            .iter()
                            .any(|t| constraints.tags.iter().any(|w| w.eq_ignore_ascii_case(t)))
                })
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let mut best: Option<(&AgentSkill, f64)> = None;
            for skill in eligible {
                let s = self.scorer.score(query, skill).clamp(0.0, 1.0);
                if best.is_none_or(|(_, b)| s > b) {
                    best = Some((skill, s));
                }
            }
            let Some((skill, similarity)) = best else {
                continue;
            };

            let similarity = if tag_gated {
                similarity.max(TAG_MATCH_FLOOR)
            } else {
                similarity
            };
            let score = similarity * card.health_status.multiplier();
            if score <= 0.0 || score < constraints.min_score {
                continue;
            }

            candidates.push(Candidate {
                agent: card.name.clone(),
                score,
                matched_skill: skill.id.clone(),
                health: card.health_status,
                card: card.clone(),
            });
        }

        // Stable: equal scores keep insertion order.
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        if let Some(max) = constraints.max_results {
            candidates.truncate(max);
        }

        tracing::debug!(
            query = %crate::utils::truncate_str(query, 80),
            candidates = candidates.len(),
            "Discovery matched agents"
        );
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::agent_card::test_card;
    use proptest::prelude::*;

    fn names(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.agent.as_str()).collect()
    }

    #[test]
    fn test_stem_joins_word_families() {
        assert_eq!(stem("summarize"), "summar");
        assert_eq!(stem("Summarization"), "summar");
        assert_eq!(stem("summarizer"), "summar");
        assert_eq!(stem("flights"), "flight");
        assert_eq!(stem("booking"), "book");
        assert_eq!(stem("it"), "it");
    }

    #[test]
    fn test_keyword_scorer() {
        let card = test_card("summarizer", &["summarization"]);
        let score = KeywordScorer.score("Summarize document X", &card.skills[0]);
        assert!((score - 0.5).abs() < f64::EPSILON, "score was {score}");
        assert_eq!(KeywordScorer.score("the and of", &card.skills[0]), 0.0);
    }

    #[test]
    fn test_health_multiplier_and_unreachable_exclusion() {
        let healthy = test_card("writer-a", &["writing"]);
        let mut degraded = test_card("writer-b", &["writing"]);
        degraded.skills[0].description = healthy.skills[0].description.clone();
        degraded.health_status = HealthStatus::Degraded;
        let mut down = test_card("writer-c", &["writing"]);
        down.health_status = HealthStatus::Unreachable;

        let matcher = Matcher::new(Arc::new(ExactScorer));
        let found = matcher.match_query(
            "writing",
            &MatchConstraints::default(),
            &[degraded, down, healthy],
        );
        assert_eq!(names(&found), vec!["writer-a", "writer-b"]);
        assert_eq!(found[0].score, 1.0);
        assert_eq!(found[1].score, 0.5);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let cards = vec![
            test_card("second", &["flights"]),
            test_card("first", &["flights"]),
            test_card("third", &["flights"]),
        ];
        let found = Matcher::new(Arc::new(ExactScorer)).match_query(
            "flights",
            &MatchConstraints::default(),
            &cards,
        );
        assert_eq!(names(&found), vec!["second", "first", "third"]);
    }

    #[test]
    fn test_tag_gate_excludes_and_admits() {
        let cards = vec![
            test_card("flights", &["flights", "travel"]),
            test_card("hotels", &["hotels", "travel"]),
        ];
        let matcher = Matcher::default();

        let found = matcher.match_query("anything at all", &MatchConstraints::tagged(["hotels"]), &cards);
        assert_eq!(names(&found), vec!["hotels"]);
        assert!((found[0].score - TAG_MATCH_FLOOR).abs() < f64::EPSILON);

        let found = matcher.match_query("x", &MatchConstraints::tagged(["cooking"]), &cards);
        assert!(found.is_empty());
    }

    #[test]
    fn test_without_tags_zero_similarity_is_excluded() {
        let cards = vec![test_card("flights", &["flights"])];
        let found =
            Matcher::default().match_query("bake a cake", &MatchConstraints::default(), &cards);
        assert!(found.is_empty());
    }

    #[test]
    fn test_capability_and_max_results() {
        let mut streamer = test_card("streamer", &["search"]);
        streamer.capabilities.streaming = true;
        let cards = vec![test_card("plain", &["search"]), streamer, test_card("other", &["search"])];

        let constraints = MatchConstraints {
            capability: Some(Capability::Streaming),
            ..MatchConstraints::tagged(["search"])
        };
        let found = Matcher::default().match_query("search", &constraints, &cards);
        assert_eq!(names(&found), vec!["streamer"]);

        let constraints = MatchConstraints {
            max_results: Some(2),
            ..MatchConstraints::tagged(["search"])
        };
        assert_eq!(Matcher::default().match_query("search", &constraints, &cards).len(), 2);
    }

    #[test]
    fn test_ranked_by_similarity() {
        let mut precise = test_card("precise", &["travel"]);
        precise.skills[0].description = "Search and compare flights".to_string();
        let vague = test_card("vague", &["travel"]);
        let found = Matcher::default().match_query(
            "search flights",
            &MatchConstraints::tagged(["travel"]),
            &[vague, precise],
        );
        assert_eq!(names(&found), vec!["precise", "vague"]);
    }

    fn arb_health() -> impl Strategy<Value = HealthStatus> {
        prop_oneof![
            Just(HealthStatus::Healthy),
            Just(HealthStatus::Degraded),
            Just(HealthStatus::Unreachable),
        ]
    }

    proptest! {
        #[test]
        fn match_never_returns_unreachable(
            health in proptest::collection::vec(arb_health(), 1..12),
            query in "[a-z ]{0,20}",
            gated in any::<bool>(),
        ) {
            let cards: Vec<AgentCard> = health
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    let mut card = test_card(&format!("agent-{i}"), &["common"]);
                    card.health_status = *h;
                    card
                })
                .collect();
            let constraints = if gated {
                MatchConstraints::tagged(["common"])
            } else {
                MatchConstraints::default()
            };
            for candidate in Matcher::default().match_query(&query, &constraints, &cards) {
                prop_assert_ne!(candidate.health, HealthStatus::Unreachable);
                prop_assert!(candidate.score > 0.0 && candidate.score <= 1.0);
            }
        }
    }
}
