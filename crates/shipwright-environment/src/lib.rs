//! Intake-stage project introspection for the Shipwright daemon.
//!
//! Before a pipeline's `build` stage can run, the `intake` stage needs to
//! know three things about the issue and the repository it landed in:
//! what *kind* of work this is ([`detect_task_type`], a keyword match on
//! the issue title), what language the project is written in
//! ([`detect_language`], a check against standard manifest files), and
//! what command runs its test suite ([`default_test_command`]). None of
//! this talks to the network or the tracker — it is pure inspection of
//! the issue title and the workspace filesystem, which is what keeps it
//! unit-testable without a fake tracker.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// The kind of work an issue represents, inferred from keywords in its
/// title. Drives which branch-name prefix the intake stage uses and,
/// indirectly, which template-selector label overrides apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bug,
    Refactor,
    Testing,
    Security,
    Docs,
    Devops,
    Migration,
    Arch,
    /// Nothing more specific matched; treated as a feature/enhancement.
    Feature,
}

impl TaskType {
    /// The branch-name segment this task type contributes, e.g.
    /// `daemon/fix/issue-42` instead of a bare `daemon/issue-42`. The
    /// worktree manager still owns the authoritative branch name;
    /// this is what the intake stage surfaces in its tracker comment and
    /// PR title.
    pub fn branch_prefix(&self) -> &'static str {
        match self {
            TaskType::Bug => "fix",
            TaskType::Refactor => "refactor",
            TaskType::Testing => "test",
            TaskType::Security => "security",
            TaskType::Docs => "docs",
            TaskType::Devops => "devops",
            TaskType::Migration => "migrate",
            TaskType::Arch => "arch",
            TaskType::Feature => "feature",
        }
    }
}

/// Ordered keyword table: first match wins, so more specific types
/// (`security`) are checked before the generic catch-alls implied by
/// their absence.
const TASK_TYPE_KEYWORDS: &[(TaskType, &[&str])] = &[
    (TaskType::Security, &["security", "vulnerability", "cve", "exploit"]),
    (TaskType::Bug, &["bug", "fix", "broken", "crash", "regression"]),
    (TaskType::Testing, &["test", "testing", "coverage", "flaky"]),
    (TaskType::Refactor, &["refactor", "cleanup", "tech debt", "rewrite"]),
    (TaskType::Docs, &["docs", "documentation", "readme", "typo"]),
    (TaskType::Devops, &["ci", "cd", "pipeline", "deploy", "infra", "devops"]),
    (TaskType::Migration, &["migrate", "migration", "upgrade", "deprecat"]),
    (TaskType::Arch, &["architecture", "arch:", "design doc", "rfc"]),
];

/// Classify an issue title into a [`TaskType`] by keyword match,
/// case-insensitive. Falls back to [`TaskType::Feature`] when nothing
/// matches.
pub fn detect_task_type(title: &str) -> TaskType {
    let lower = title.to_lowercase();
    for (task_type, keywords) in TASK_TYPE_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *task_type;
        }
    }
    TaskType::Feature
}

/// Languages the intake stage knows how to recognize via standard
/// manifest files, and default test-command detection for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Node,
    Python,
    Go,
    Java,
    Ruby,
}

/// One manifest filename and the language/test-command pair it implies.
/// Order matters: a repo with both `Cargo.toml` and `package.json`
/// (a Rust project with a JS-based docs site, say) is reported as Rust
/// because this table is checked in order and the first hit wins.
const MANIFEST_TABLE: &[(&str, Language, &str)] = &[
    ("Cargo.toml", Language::Rust, "cargo test"),
    ("go.mod", Language::Go, "go test ./..."),
    ("pom.xml", Language::Java, "mvn test"),
    ("build.gradle", Language::Java, "gradle test"),
    ("package.json", Language::Node, "npm test"),
    ("pyproject.toml", Language::Python, "pytest"),
    ("requirements.txt", Language::Python, "pytest"),
    ("Gemfile", Language::Ruby, "bundle exec rspec"),
];

/// Detect the project's language by probing `repo_root` for standard
/// manifest files, in [`MANIFEST_TABLE`] order. Returns `None` if no
/// recognized manifest is present (the build stage then falls back to
/// whatever `fast_test_cmd` the operator configured, or skips the test
/// stage's coverage gate).
pub fn detect_language(repo_root: &Path) -> Option<Language> {
    MANIFEST_TABLE
        .iter()
        .find(|(filename, _, _)| repo_root.join(filename).is_file())
        .map(|(_, lang, _)| *lang)
}

/// The default test command for a detected language, matching
/// [`MANIFEST_TABLE`]. An operator-configured `fast_test_cmd` always
/// takes precedence over this at the call site; this is only the
/// fallback when none is configured.
pub fn default_test_command(language: Language) -> &'static str {
    MANIFEST_TABLE
        .iter()
        .find(|(_, lang, _)| *lang == language)
        .map(|(_, _, cmd)| *cmd)
        .unwrap_or("true")
}

/// Convenience wrapper combining [`detect_language`] and
/// [`default_test_command`] in one probe of the workspace, as the
/// intake stage does.
pub fn detect_language_and_test_command(repo_root: &Path) -> Option<(Language, &'static str)> {
    let language = detect_language(repo_root)?;
    Some((language, default_test_command(language)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn detects_security_before_bug_keywords() {
        assert_eq!(
            detect_task_type("fix security vulnerability in auth"),
            TaskType::Security
        );
    }

    #[test]
    fn detects_bug_from_title() {
        assert_eq!(detect_task_type("App crashes on startup"), TaskType::Bug);
    }

    #[test]
    fn falls_back_to_feature() {
        assert_eq!(detect_task_type("Add dark mode toggle"), TaskType::Feature);
    }

    #[test]
    fn task_type_keyword_detection_is_case_insensitive() {
        assert_eq!(detect_task_type("REFACTOR the parser"), TaskType::Refactor);
    }

    #[test]
    fn branch_prefixes_are_distinct() {
        let prefixes: std::collections::HashSet<_> = [
            TaskType::Bug,
            TaskType::Refactor,
            TaskType::Testing,
            TaskType::Security,
            TaskType::Docs,
            TaskType::Devops,
            TaskType::Migration,
            TaskType::Arch,
            TaskType::Feature,
        ]
        .iter()
        .map(|t| t.branch_prefix())
        .collect();
        assert_eq!(prefixes.len(), 9);
    }

    #[test]
    fn detects_rust_manifest() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("Cargo.toml"), "[package]\nname=\"x\"").expect("write");
        assert_eq!(detect_language(td.path()), Some(Language::Rust));
        assert_eq!(default_test_command(Language::Rust), "cargo test");
    }

    #[test]
    fn rust_manifest_wins_over_node_when_both_present() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("Cargo.toml"), "[package]\nname=\"x\"").expect("write");
        fs::write(td.path().join("package.json"), "{}").expect("write");
        assert_eq!(detect_language(td.path()), Some(Language::Rust));
    }

    #[test]
    fn no_manifest_returns_none() {
        let td = tempdir().expect("tempdir");
        assert_eq!(detect_language(td.path()), None);
    }

    #[test]
    fn detect_language_and_test_command_combines_both() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("go.mod"), "module x").expect("write");
        assert_eq!(
            detect_language_and_test_command(td.path()),
            Some((Language::Go, "go test ./..."))
        );
    }
}
