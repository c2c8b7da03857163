//! Candidate gathering, triage scoring, and dependency-aware ordering
//! feeding the supervisor's spawn decisions.
//!
//! Three independent concerns live here, applied in order: [`score_all`]
//! turns each polled issue into a triage score, [`reorder_for_dependencies`]
//! nudges issues that reference an still-open blocker behind it, and
//! [`sort_candidates`] (a thin re-export of the triage crate's own
//! function) applies the configured priority strategy. The dependency
//! pass runs first so it can't be undone by the priority sort clobbering
//! its ordering for two issues that tie on score.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use shipwright_tracker::TrackedIssue;
use shipwright_triage::{score, AiTriageAnalyzer, PriorOutcome, TriageInput};

/// One polled issue plus its triage score and parsed dependency refs.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub issue: TrackedIssue,
    pub score: i32,
    /// Other issue numbers this candidate's title/body says it depends on
    /// (`"depends on #12"` / `"blocked by #12"`).
    pub depends_on: Vec<u64>,
}

/// `"depends on #N"` / `"blocked by #N"`, case-insensitive. Anything else
/// mentioning `#N` (e.g. `"closes #12"`) is not a dependency.
fn dependency_pattern() -> Regex {
    Regex::new(r"(?i)(?:depends on|blocked by)\s*#(\d+)").expect("valid regex")
}

fn parse_depends_on(issue: &TrackedIssue) -> Vec<u64> {
    let haystack = format!("{} {}", issue.title, issue.body);
    dependency_pattern()
        .captures_iter(&haystack)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .collect()
}

/// Whether `prior_outcome` should be looked up for `issue_id`; callers
/// supply this from their own memory/history source (e.g. the most
/// recent `pipeline.completed` result for the same issue in a prior run).
pub type PriorOutcomeLookup<'a> = dyn Fn(u64) -> Option<PriorOutcome> + 'a;

/// Score every polled issue, looking up prior-outcome memory and parsing
/// dependency references along the way. `analyzer` is the optional AI
/// triage hook; `None` falls back to the deterministic scorer.
pub fn score_all(
    issues: Vec<TrackedIssue>,
    prior_outcome: &PriorOutcomeLookup,
    analyzer: Option<&dyn AiTriageAnalyzer>,
) -> Vec<Candidate> {
    let open_ids: HashSet<u64> = issues.iter().map(|i| i.id).collect();
    let depends_on_by_issue: HashMap<u64, Vec<u64>> = issues
        .iter()
        .map(|i| (i.id, parse_depends_on(i)))
        .collect();
    let blocks_others_ids: HashSet<u64> = depends_on_by_issue
        .values()
        .flatten()
        .copied()
        .filter(|dep| open_ids.contains(dep))
        .collect();

    issues
        .into_iter()
        .map(|issue| {
            let depends_on = depends_on_by_issue.get(&issue.id).cloned().unwrap_or_default();
            let has_open_blocker = depends_on.iter().any(|id| open_ids.contains(id));
            let blocks_others = blocks_others_ids.contains(&issue.id);
            let input = TriageInput {
                title: issue.title.clone(),
                body: issue.body.clone(),
                labels: issue.labels.clone(),
                created_at: issue.created_at,
                has_open_blocker,
                blocks_others,
                prior_outcome: prior_outcome(issue.id),
            };
            let triage_score = score(&input, analyzer);
            Candidate {
                issue,
                score: triage_score,
                depends_on,
            }
        })
        .collect()
}

/// Move each candidate to just after the last of its still-present
/// dependencies, in up to three passes. Stops as soon as a pass makes no
/// change, and never loops more than three times regardless — a
/// dependency cycle (`A depends on B`, `B depends on A`) settles into
/// *some* stable order rather than spinning or panicking.
pub fn reorder_for_dependencies(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut order: Vec<Candidate> = candidates;

    for _ in 0..3 {
        let positions: HashMap<u64, usize> = order
            .iter()
            .enumerate()
            .map(|(i, c)| (c.issue.id, i))
            .collect();

        let mut move_after: Option<(usize, usize)> = None; // (from_index, after_index)
        for (idx, candidate) in order.iter().enumerate() {
            let last_dep_pos = candidate
                .depends_on
                .iter()
                .filter_map(|dep| positions.get(dep).copied())
                .max();
            if let Some(dep_pos) = last_dep_pos {
                if dep_pos > idx {
                    move_after = Some((idx, dep_pos));
                    break;
                }
            }
        }

        let Some((from, after)) = move_after else {
            break;
        };
        let item = order.remove(from);
        // `after` was an index into the pre-removal vector; removing an
        // earlier element shifts it back by one.
        order.insert(after, item);
    }

    order
}
