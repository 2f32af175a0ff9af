//! Capability matching between tasks and worker sessions.
//!
//! Scoring is pure: it reads session profiles and a task description and
//! never touches the store, so the hub can rank candidates for a claim
//! suggestion or a help broadcast from a single `list_sessions` snapshot.

use crate::config::RoutingConfig;
use crate::types::{CapabilityProfile, ContextTier, RankedSession, Session, SessionStatus};
use regex_lite::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::LazyLock;

// Letters, digits and the joiners used in tech names (c++, c#, node.js, grpc-web)
static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_+#.\-]*").expect("word pattern is valid"));

/// Lower-cased words of a text, trailing punctuation stripped.
pub fn keywords(text: &str) -> HashSet<String> {
    let lowered = text.to_lowercase();
    WORD_PATTERN
        .find_iter(&lowered)
        .map(|m| m.as_str().trim_end_matches(['.', '-']).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// What is known about a task when routing it.
#[derive(Debug, Clone, Default)]
pub struct RouteQuery {
    tags: HashSet<String>,
    words: HashSet<String>,
    description_chars: usize,
}

impl RouteQuery {
    pub fn new(description: &str, tags: &[String]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.trim().to_lowercase()).collect(),
            words: keywords(description),
            description_chars: description.chars().count(),
        }
    }

    /// A capability term matches a tag exactly, or every word of it
    /// appears in the description.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return false;
        }
        if self.tags.contains(&term) {
            return true;
        }
        let words = keywords(&term);
        !words.is_empty() && words.iter().all(|w| self.words.contains(w))
    }
}

/// Match score of one profile against a task. May be negative.
pub fn score(
    config: &RoutingConfig,
    profile: &CapabilityProfile,
    claimed_tasks: i64,
    query: &RouteQuery,
) -> f64 {
    let best_for = profile.best_for.iter().filter(|t| query.matches(t)).count() as f64;
    let strengths = profile.strengths.iter().filter(|t| query.matches(t)).count() as f64;

    let mut total = best_for * config.best_for_weight + strengths * config.strength_weight;
    total -= claimed_tasks.max(0) as f64 * config.workload_penalty;

    if query.description_chars >= config.long_description_chars {
        total += match profile.context_tier {
            ContextTier::Large => config.large_context_bonus,
            ContextTier::Medium => config.medium_context_bonus,
            ContextTier::Small => 0.0,
        };
    }
    total
}

/// Higher score first, then lighter load, then the longer-registered session.
fn compare_ranked(a: &RankedSession, b: &RankedSession) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.session.claimed_tasks.cmp(&b.session.claimed_tasks))
        .then_with(|| a.session.registered_at.cmp(&b.session.registered_at))
        .then_with(|| a.session.id.cmp(&b.session.id))
}

/// Every non-offline session with its score, best match first.
pub fn rank_sessions(
    config: &RoutingConfig,
    sessions: &[Session],
    query: &RouteQuery,
) -> Vec<RankedSession> {
    let mut ranked: Vec<RankedSession> = sessions
        .iter()
        .filter(|s| s.status != SessionStatus::Offline)
        .map(|s| RankedSession {
            score: score(config, &s.capabilities, s.claimed_tasks, query),
            session: s.clone(),
        })
        .collect();
    ranked.sort_by(compare_ranked);
    ranked
}

/// The session a new task should go to, if any clears `min_score`.
/// Sessions at their claim limit are not considered.
pub fn best_agent_for(
    config: &RoutingConfig,
    sessions: &[Session],
    query: &RouteQuery,
) -> Option<RankedSession> {
    rank_sessions(config, sessions, query)
        .into_iter()
        .filter(|r| !r.session.is_at_capacity())
        .find(|r| r.score >= config.min_score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, strengths: &[&str], best_for: &[&str], tier: ContextTier) -> Session {
        Session {
            id: id.to_string(),
            name: id.to_string(),
            capabilities: CapabilityProfile {
                strengths: strengths.iter().map(|s| s.to_string()).collect(),
                best_for: best_for.iter().map(|s| s.to_string()).collect(),
                context_tier: tier,
            },
            status: SessionStatus::Idle,
            current_task: None,
            active_tasks: 0,
            claimed_tasks: 0,
            completed_tasks: 0,
            help_requests: 0,
            max_claims: 3,
            registered_at: 0,
            last_heartbeat: 0,
        }
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keywords_keep_tech_names() {
        let words = keywords("Port the C++ parser to Node.js, then tidy up.");
        assert!(words.contains("c++"));
        assert!(words.contains("node.js"));
        assert!(words.contains("up"));
        assert!(!words.contains("up."));
    }

    #[test]
    fn terms_match_tags_or_description_words() {
        let query = RouteQuery::new("Fix the flaky database migration", &tags(&["Backend"]));
        assert!(query.matches("backend"));
        assert!(query.matches("Database"));
        assert!(query.matches("database migration"));
        assert!(!query.matches("frontend"));
        assert!(!query.matches("database schema"));
        assert!(!query.matches("  "));
    }

    #[test]
    fn best_for_outweighs_strength() {
        let config = RoutingConfig::default();
        let query = RouteQuery::new("rust refactor", &[]);
        let specialist = session("a", &[], &["rust"], ContextTier::Small);
        let generalist = session("b", &["rust"], &[], ContextTier::Small);
        assert_eq!(score(&config, &specialist.capabilities, 0, &query), 3.0);
        assert_eq!(score(&config, &generalist.capabilities, 0, &query), 2.0);
    }

    #[test]
    fn workload_penalty_applies_per_active_task() {
        let config = RoutingConfig::default();
        let query = RouteQuery::new("rust", &[]);
        let profile = session("a", &["rust"], &["rust"], ContextTier::Small).capabilities;
        assert_eq!(score(&config, &profile, 2, &query), 5.0 - 3.0);
    }

    #[test]
    fn long_descriptions_favor_large_context() {
        let config = RoutingConfig::default();
        let long = "x".repeat(config.long_description_chars);
        let query = RouteQuery::new(&long, &[]);
        let large = CapabilityProfile {
            context_tier: ContextTier::Large,
            ..Default::default()
        };
        let medium = CapabilityProfile::default();
        let small = CapabilityProfile {
            context_tier: ContextTier::Small,
            ..Default::default()
        };
        assert_eq!(score(&config, &large, 0, &query), 2.0);
        assert_eq!(score(&config, &medium, 0, &query), 1.0);
        assert_eq!(score(&config, &small, 0, &query), 0.0);

        let short = RouteQuery::new("short", &[]);
        assert_eq!(score(&config, &large, 0, &short), 0.0);
    }

    #[test]
    fn best_agent_skips_offline_and_full_sessions() {
        let config = RoutingConfig::default();
        let query = RouteQuery::new("", &tags(&["frontend"]));

        let mut offline = session("offline", &[], &["frontend"], ContextTier::Medium);
        offline.status = SessionStatus::Offline;
        let mut full = session("full", &[], &["frontend"], ContextTier::Medium);
        full.claimed_tasks = 1;
        full.max_claims = 1;
        let ok = session("ok", &["frontend"], &[], ContextTier::Medium);

        let best = best_agent_for(&config, &[offline, full, ok], &query).unwrap();
        assert_eq!(best.session.id, "ok");
    }

    #[test]
    fn no_decision_below_min_score() {
        let config = RoutingConfig::default();
        let query = RouteQuery::new("write docs", &[]);
        let sessions = vec![session("a", &["rust"], &["backend"], ContextTier::Large)];
        assert!(best_agent_for(&config, &sessions, &query).is_none());
    }

    #[test]
    fn ties_prefer_lighter_load_then_earlier_registration() {
        let config = RoutingConfig {
            workload_penalty: 0.0,
            ..RoutingConfig::default()
        };
        let query = RouteQuery::new("", &tags(&["ops"]));

        let mut busy = session("busy", &["ops"], &[], ContextTier::Medium);
        busy.claimed_tasks = 1;
        let mut late = session("late", &["ops"], &[], ContextTier::Medium);
        late.registered_at = 20;
        let mut early = session("early", &["ops"], &[], ContextTier::Medium);
        early.registered_at = 10;

        let ranked = rank_sessions(&config, &[busy, late, early], &query);
        let order: Vec<&str> = ranked.iter().map(|r| r.session.id.as_str()).collect();
        assert_eq!(order, vec!["early", "late", "busy"]);
    }
}
