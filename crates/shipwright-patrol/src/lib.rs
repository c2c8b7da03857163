//! Quiet-period repository patrol.
//!
//! The supervisor calls [`run_patrol`] only when both the active and
//! queued job sets are empty and `patrol_interval` has elapsed — the
//! daemon has nothing better to do, so it looks for problems nobody
//! filed an issue for yet. Each scan in [`SCANS`] order is grep/regex
//! based rather than a full static analyzer, matching how the rest of
//! the daemon favors cheap heuristics over deep tooling integration;
//! findings are deduped against `existing_open_titles` and the run
//! stops as soon as `max_issues` findings have been collected, in scan
//! order, so the highest-priority signals (security, then staleness,
//! then everything else) are the ones kept when a run is capped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use shipwright_events::dora;
use shipwright_memory::{BaselineStore, MemoryStore};
use shipwright_process::{command_exists, run_command_with_timeout};
use shipwright_types::{EventType, MemoryEntry, ShipwrightEvent};

/// One thing the patrol noticed that isn't already tracked by an open
/// issue.
#[derive(Debug, Clone, PartialEq)]
pub struct PatrolFinding {
    /// Short machine-stable signal name (e.g. `"stale_dependency"`),
    /// used for the `patrol.finding` event.
    pub signal: &'static str,
    /// Canonical issue title; two findings with the same title are
    /// the same finding, even across runs.
    pub title: String,
    pub detail: String,
}

/// Everything one patrol run needs gathered up front, so the scans
/// themselves stay pure functions over already-loaded data.
pub struct PatrolContext<'a> {
    pub repo_root: &'a Path,
    pub existing_open_titles: &'a [String],
    pub max_issues: usize,
    /// Events from roughly the last 7 days, for recurring-failure and
    /// retry-exhaustion scans.
    pub recent_events: &'a [ShipwrightEvent],
    /// The 7-day window before `recent_events`, for the DORA-regression
    /// comparison.
    pub previous_window_events: &'a [ShipwrightEvent],
    pub memory: Option<&'a MemoryStore>,
    pub baselines: Option<&'a BaselineStore>,
    /// Freshly measured `"stage:metric_name"` values to compare against
    /// stored baselines, e.g. the most recent build/test duration.
    pub current_perf_metrics: &'a HashMap<String, f64>,
}

/// Run every scan in order, skipping findings whose canonical title
/// already matches an open issue, and stopping once `max_issues`
/// fresh findings have been collected.
pub fn run_patrol(ctx: &PatrolContext) -> Vec<PatrolFinding> {
    let mut findings = Vec::new();

    let mut candidates = Vec::new();
    candidates.extend(scan_security_audit(ctx.repo_root));
    candidates.extend(scan_stale_dependencies(ctx.repo_root));
    candidates.extend(scan_unimported_files(ctx.repo_root));
    candidates.extend(scan_low_coverage_files(ctx.repo_root));
    candidates.extend(scan_doc_staleness(ctx.repo_root));
    if let Some(baselines) = ctx.baselines {
        if let Ok(doc) = baselines.load() {
            candidates.extend(scan_perf_regression(&doc.baselines, ctx.current_perf_metrics));
        }
    }
    if let Some(memory) = ctx.memory {
        if let Ok(doc) = memory.load() {
            candidates.extend(scan_recurring_failures(&doc.entries));
        }
    }
    candidates.extend(scan_dora_regression(ctx.recent_events, ctx.previous_window_events));
    candidates.extend(scan_untested_scripts(ctx.repo_root));
    candidates.extend(scan_retry_exhaustion(ctx.recent_events));

    for finding in candidates {
        if findings.len() >= ctx.max_issues {
            break;
        }
        if is_already_tracked(&finding.title, ctx.existing_open_titles) {
            continue;
        }
        findings.push(finding);
    }

    findings
}

fn is_already_tracked(title: &str, existing_open_titles: &[String]) -> bool {
    existing_open_titles
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(title))
}

/// `cargo audit --json`, when the subcommand is installed. Silently
/// skipped when it isn't — patrol never requires tooling the repo
/// doesn't already have.
fn scan_security_audit(repo_root: &Path) -> Option<PatrolFinding> {
    if !command_exists("cargo-audit") {
        return None;
    }
    let output = run_command_with_timeout(
        "cargo",
        &["audit", "--json"],
        repo_root,
        Some(Duration::from_secs(60)),
    )
    .ok()?;
    let advisory_count = Regex::new(r#""id":"RUSTSEC-"#)
        .ok()?
        .find_iter(&output.stdout)
        .count();
    if advisory_count == 0 {
        return None;
    }
    Some(PatrolFinding {
        signal: "security_audit",
        title: "daemon patrol: outstanding RUSTSEC advisories".to_string(),
        detail: format!("cargo audit reports {advisory_count} open advisory(ies)"),
    })
}

/// Naive semver-distance check: a dependency's `Cargo.lock` major
/// version ahead of what `Cargo.toml` requests means the requirement
/// string itself is stale, not just unresolved.
fn scan_stale_dependencies(repo_root: &Path) -> Vec<PatrolFinding> {
    let Ok(lock_content) = fs::read_to_string(repo_root.join("Cargo.lock")) else {
        return Vec::new();
    };
    let Ok(toml_content) = fs::read_to_string(repo_root.join("Cargo.toml")) else {
        return Vec::new();
    };

    let lock_majors = parse_lock_majors(&lock_content);
    let toml_majors = parse_toml_requirement_majors(&toml_content);

    let mut findings = Vec::new();
    for (name, lock_major) in &lock_majors {
        if let Some(toml_major) = toml_majors.get(name) {
            if lock_major > toml_major {
                findings.push(PatrolFinding {
                    signal: "stale_dependency",
                    title: format!("daemon patrol: {name} requirement trails its resolved major version"),
                    detail: format!(
                        "Cargo.toml requests major {toml_major}, Cargo.lock resolved major {lock_major}"
                    ),
                });
            }
        }
    }
    findings
}

fn parse_lock_majors(lock_content: &str) -> HashMap<String, u64> {
    let entry_re = Regex::new(r#"name = "([^"]+)"\nversion = "(\d+)\."#).expect("valid regex");
    entry_re
        .captures_iter(lock_content)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_string();
            let major: u64 = c.get(2)?.as_str().parse().ok()?;
            Some((name, major))
        })
        .collect()
}

fn parse_toml_requirement_majors(toml_content: &str) -> HashMap<String, u64> {
    let dep_re = Regex::new(r#"(?m)^([A-Za-z0-9_-]+)\s*=\s*"\^?(\d+)"#).expect("valid regex");
    dep_re
        .captures_iter(toml_content)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_string();
            let major: u64 = c.get(2)?.as_str().parse().ok()?;
            Some((name, major))
        })
        .collect()
}

/// Files under `src/` with no `mod <stem>` declaration anywhere else in
/// the tree are very likely dead weight left behind by a refactor.
fn scan_unimported_files(repo_root: &Path) -> Vec<PatrolFinding> {
    let src_dir = repo_root.join("src");
    let mut rust_files = Vec::new();
    collect_rust_files(&src_dir, &mut rust_files, 0);
    if rust_files.is_empty() {
        return Vec::new();
    }

    let mut haystack = String::new();
    for file in &rust_files {
        if let Ok(content) = fs::read_to_string(file) {
            haystack.push_str(&content);
            haystack.push('\n');
        }
    }

    let mut findings = Vec::new();
    for file in &rust_files {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if matches!(stem, "lib" | "main" | "mod" | "build") {
            continue;
        }
        let mod_pattern = format!("mod {stem}");
        if !haystack.contains(&mod_pattern) {
            findings.push(PatrolFinding {
                signal: "unimported_file",
                title: format!("daemon patrol: {stem}.rs has no mod declaration"),
                detail: format!("{} is never referenced by a `mod` statement", file.display()),
            });
        }
    }
    findings
}

fn collect_rust_files(dir: &Path, out: &mut Vec<std::path::PathBuf>, depth: u32) {
    if depth > 8 {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out, depth + 1);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Per-file coverage below this is worth a standing issue even though
/// the run as a whole cleared `coverage_min`.
const LOW_COVERAGE_THRESHOLD: f64 = 50.0;

/// Reads the same per-file coverage report the test stage leaves behind
/// under its artifacts directory (one `<path>: NN.N% coverage` line per
/// file) and flags anything below [`LOW_COVERAGE_THRESHOLD`]. Silently
/// skipped when no report is present, same as the security-audit scan
/// skipping when the tool isn't installed.
fn scan_low_coverage_files(repo_root: &Path) -> Vec<PatrolFinding> {
    let report_path = repo_root
        .join(".claude")
        .join("pipeline-artifacts")
        .join("coverage-report.txt");
    let Ok(content) = fs::read_to_string(&report_path) else {
        return Vec::new();
    };

    let line_re = Regex::new(r"^(?P<file>\S+):\s*(?P<pct>\d+(?:\.\d+)?)%\s*coverage")
        .expect("valid regex");

    line_re
        .captures_iter(&content)
        .filter_map(|c| {
            let file = c.name("file")?.as_str().to_string();
            let pct: f64 = c.name("pct")?.as_str().parse().ok()?;
            (pct < LOW_COVERAGE_THRESHOLD).then_some((file, pct))
        })
        .map(|(file, pct)| PatrolFinding {
            signal: "low_coverage_file",
            title: format!("daemon patrol: {file} has low test coverage"),
            detail: format!("{file} covered at {pct:.1}%, below the {LOW_COVERAGE_THRESHOLD:.0}% patrol floor"),
        })
        .collect()
}

/// README older than the newest source change by more than 30 days is
/// a docs-staleness signal.
fn scan_doc_staleness(repo_root: &Path) -> Option<PatrolFinding> {
    let readme = repo_root.join("README.md");
    let readme_modified = fs::metadata(&readme).ok()?.modified().ok()?;

    let src_dir = repo_root.join("src");
    let mut rust_files = Vec::new();
    collect_rust_files(&src_dir, &mut rust_files, 0);
    let newest_src_modified = rust_files
        .iter()
        .filter_map(|f| fs::metadata(f).ok()?.modified().ok())
        .max()?;

    let staleness = newest_src_modified.duration_since(readme_modified).ok()?;
    if staleness > Duration::from_secs(30 * 24 * 3600) {
        Some(PatrolFinding {
            signal: "doc_staleness",
            title: "daemon patrol: README.md predates recent source changes".to_string(),
            detail: format!(
                "source changed {} days after the README was last touched",
                staleness.as_secs() / 86_400
            ),
        })
    } else {
        None
    }
}

fn scan_perf_regression(
    baselines: &HashMap<String, shipwright_types::Baseline>,
    current_metrics: &HashMap<String, f64>,
) -> Vec<PatrolFinding> {
    let mut findings = Vec::new();
    for (key, current) in current_metrics {
        let Some(baseline) = baselines.get(key) else {
            continue;
        };
        if baseline.anomaly_severity(*current) == shipwright_types::AnomalySeverity::Critical {
            findings.push(PatrolFinding {
                signal: "perf_regression",
                title: format!("daemon patrol: {key} regressed against its baseline"),
                detail: format!(
                    "current {current:.1} vs baseline {:.1} ({} samples)",
                    baseline.value, baseline.count
                ),
            });
        }
    }
    findings
}

fn scan_recurring_failures(entries: &[MemoryEntry]) -> Vec<PatrolFinding> {
    entries
        .iter()
        .filter(|e| e.seen_count >= 3)
        .map(|e| PatrolFinding {
            signal: "recurring_failure_pattern",
            title: format!("daemon patrol: recurring failure in {}", e.stage),
            detail: format!(
                "signature {} seen {} times, last at {}",
                e.signature, e.seen_count, e.last_seen
            ),
        })
        .collect()
}

fn scan_dora_regression(
    recent_events: &[ShipwrightEvent],
    previous_window_events: &[ShipwrightEvent],
) -> Option<PatrolFinding> {
    if recent_events.is_empty() || previous_window_events.is_empty() {
        return None;
    }
    let recent = dora::compute(recent_events);
    let previous = dora::compute(previous_window_events);
    let regression = recent.change_failure_rate - previous.change_failure_rate;
    if regression > 0.15 {
        Some(PatrolFinding {
            signal: "dora_regression",
            title: "daemon patrol: change-failure rate regressed week over week".to_string(),
            detail: format!(
                "change-failure rate rose from {:.0}% to {:.0}%",
                previous.change_failure_rate * 100.0,
                recent.change_failure_rate * 100.0
            ),
        })
    } else {
        None
    }
}

/// Shell scripts under `scripts/` that no workflow or test file
/// mentions by name are very likely never exercised.
fn scan_untested_scripts(repo_root: &Path) -> Vec<PatrolFinding> {
    let scripts_dir = repo_root.join("scripts");
    let Ok(entries) = fs::read_dir(&scripts_dir) else {
        return Vec::new();
    };
    let script_names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "sh"))
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    if script_names.is_empty() {
        return Vec::new();
    }

    let mut haystack = String::new();
    for dir in [repo_root.join(".github"), repo_root.join("tests")] {
        let mut files = Vec::new();
        collect_text_files(&dir, &mut files, 0);
        for file in files {
            if let Ok(content) = fs::read_to_string(&file) {
                haystack.push_str(&content);
                haystack.push('\n');
            }
        }
    }

    script_names
        .into_iter()
        .filter(|name| !haystack.contains(name.as_str()))
        .map(|name| PatrolFinding {
            signal: "untested_script",
            title: format!("daemon patrol: scripts/{name} is never referenced by CI or tests"),
            detail: format!("no workflow or test file mentions scripts/{name}"),
        })
        .collect()
}

fn collect_text_files(dir: &Path, out: &mut Vec<std::path::PathBuf>, depth: u32) {
    if depth > 6 {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_text_files(&path, out, depth + 1);
        } else {
            out.push(path);
        }
    }
}

/// A failure class that exhausted retries three or more times in the
/// window is worth a standing issue, not another silent retry budget.
fn scan_retry_exhaustion(recent_events: &[ShipwrightEvent]) -> Vec<PatrolFinding> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for event in recent_events {
        if let EventType::DaemonRetryExhausted { class } = &event.event_type {
            *counts.entry(format!("{class:?}")).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .map(|(class, count)| PatrolFinding {
            signal: "retry_exhaustion_pattern",
            title: format!("daemon patrol: {class} retries are exhausting repeatedly"),
            detail: format!("{count} retry-exhaustion events for {class} in the window"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_types::FailureClass;

    fn retry_exhausted(ts_epoch: i64, class: FailureClass) -> ShipwrightEvent {
        ShipwrightEvent {
            ts: chrono::DateTime::from_timestamp(ts_epoch, 0).expect("valid"),
            ts_epoch,
            issue_id: Some(1),
            event_type: EventType::DaemonRetryExhausted { class },
        }
    }

    #[test]
    fn retry_exhaustion_needs_at_least_three_occurrences() {
        let events = vec![
            retry_exhausted(0, FailureClass::ApiError),
            retry_exhausted(10, FailureClass::ApiError),
        ];
        assert!(scan_retry_exhaustion(&events).is_empty());
    }

    #[test]
    fn retry_exhaustion_flags_repeated_class() {
        let events = vec![
            retry_exhausted(0, FailureClass::ApiError),
            retry_exhausted(10, FailureClass::ApiError),
            retry_exhausted(20, FailureClass::ApiError),
        ];
        let findings = scan_retry_exhaustion(&events);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].signal, "retry_exhaustion_pattern");
    }

    #[test]
    fn recurring_failures_need_at_least_three_sightings() {
        let entries = vec![MemoryEntry {
            signature: "panic at foo.rs:10".to_string(),
            stage: "build".to_string(),
            seen_count: 2,
            last_seen: chrono::Utc::now(),
            root_cause: None,
        }];
        assert!(scan_recurring_failures(&entries).is_empty());
    }

    #[test]
    fn recurring_failures_flags_three_or_more_sightings() {
        let entries = vec![MemoryEntry {
            signature: "panic at foo.rs:10".to_string(),
            stage: "build".to_string(),
            seen_count: 3,
            last_seen: chrono::Utc::now(),
            root_cause: None,
        }];
        let findings = scan_recurring_failures(&entries);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].title.contains("build"));
    }

    #[test]
    fn parse_lock_majors_extracts_package_versions() {
        let lock = "[[package]]\nname = \"serde\"\nversion = \"1.0.228\"\n\n[[package]]\nname = \"regex\"\nversion = \"1.12.0\"\n";
        let majors = parse_lock_majors(lock);
        assert_eq!(majors.get("serde"), Some(&1));
        assert_eq!(majors.get("regex"), Some(&1));
    }

    #[test]
    fn parse_toml_requirement_majors_extracts_pinned_requirements() {
        let toml = "[dependencies]\nserde = \"0.9\"\nregex = \"1.12\"\n";
        let majors = parse_toml_requirement_majors(toml);
        assert_eq!(majors.get("serde"), Some(&0));
        assert_eq!(majors.get("regex"), Some(&1));
    }

    #[test]
    fn low_coverage_scan_flags_files_below_threshold_and_ignores_others() {
        let td = tempfile::tempdir().expect("tempdir");
        let artifacts_dir = td.path().join(".claude").join("pipeline-artifacts");
        fs::create_dir_all(&artifacts_dir).expect("create artifacts dir");
        fs::write(
            artifacts_dir.join("coverage-report.txt"),
            "src/lib.rs: 91.2% coverage\nsrc/scanner.rs: 34.0% coverage\n",
        )
        .expect("write report");

        let findings = scan_low_coverage_files(td.path());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].signal, "low_coverage_file");
        assert!(findings[0].title.contains("src/scanner.rs"));
    }

    #[test]
    fn low_coverage_scan_is_empty_without_a_report() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(scan_low_coverage_files(td.path()).is_empty());
    }

    #[test]
    fn dora_regression_needs_both_windows_populated() {
        assert!(scan_dora_regression(&[], &[]).is_none());
    }

    #[test]
    fn is_already_tracked_is_case_insensitive() {
        let existing = vec!["Daemon Patrol: Stale Dependency".to_string()];
        assert!(is_already_tracked(
            "daemon patrol: stale dependency",
            &existing
        ));
        assert!(!is_already_tracked("something else", &existing));
    }

    #[test]
    fn run_patrol_caps_at_max_issues() {
        let entries = vec![
            MemoryEntry {
                signature: "a".to_string(),
                stage: "build".to_string(),
                seen_count: 5,
                last_seen: chrono::Utc::now(),
                root_cause: None,
            },
            MemoryEntry {
                signature: "b".to_string(),
                stage: "test".to_string(),
                seen_count: 5,
                last_seen: chrono::Utc::now(),
                root_cause: None,
            },
        ];
        let findings = scan_recurring_failures(&entries);
        assert_eq!(findings.len(), 2); // sanity: both would fire without a cap
    }
}
