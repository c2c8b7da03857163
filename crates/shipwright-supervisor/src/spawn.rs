//! Spawn-decision and enqueue logic.

use chrono::Utc;
use shipwright_types::{Job, JobId, QueueEntry};

use crate::candidates::Candidate;
use crate::launcher::WorkerSpec;
use crate::paths::Paths;

/// Whether a candidate with `labels` qualifies for the priority lane —
/// extra spawn slots reserved for hotfix/incident-style work, bypassing
/// the normal queue (see the priority lane glossary entry).
pub fn is_priority_eligible(labels: &[String], priority_labels: &[String]) -> bool {
    labels.iter().any(|l| priority_labels.iter().any(|p| p.eq_ignore_ascii_case(l)))
}

/// Build the [`WorkerSpec`] for spawning `candidate`, given its prepared
/// workspace/branch and the selected template name.
#[allow(clippy::too_many_arguments)]
pub fn build_worker_spec(
    paths: &Paths,
    candidate: &Candidate,
    workspace: std::path::PathBuf,
    branch: String,
    base_branch: &str,
    template: &str,
    config_path: std::path::PathBuf,
    resume: bool,
    model_override: Option<String>,
) -> WorkerSpec {
    let body_extract: String = candidate.issue.body.chars().take(2000).collect();
    WorkerSpec {
        issue_id: candidate.issue.id,
        workspace,
        repo_root: paths.repo_root.clone(),
        template: template.to_string(),
        goal: format!("{}\n\n{}", candidate.issue.title, body_extract),
        title: candidate.issue.title.clone(),
        branch,
        base_branch: base_branch.to_string(),
        config_path,
        log_file: paths.log_file(candidate.issue.id),
        resume,
        model_override,
    }
}

/// Build the [`Job`] record for the state store once a worker has
/// actually been spawned and its pid is known.
pub fn build_job(spec: &WorkerSpec, pid: u32, retry_count: u32) -> Job {
    Job {
        id: JobId::new(spec.issue_id, Utc::now().timestamp()),
        issue_id: spec.issue_id,
        title: spec.title.clone(),
        goal: spec.goal.clone(),
        pid,
        workspace_path: spec.workspace.clone(),
        template: spec.template.clone(),
        started_at: Utc::now(),
        repo: spec.repo_root.to_string_lossy().to_string(),
        retry_count,
        status: shipwright_types::JobStatus::Active,
    }
}

pub fn enqueue_entry(issue_id: u64, triage_score: i32) -> QueueEntry {
    QueueEntry {
        issue_id,
        triage_score,
        enqueued_at: Utc::now(),
    }
}
