//! Baselines, failure-pattern memory, and predictive risk.
//!
//! Two JSON documents, each locked read-modify-write the same way as
//! the daemon state store: `baselines/default.json`
//! ([`BaselineStore`], keyed `"<stage>:<metric_name>"`) and
//! `memory/patterns.json` ([`MemoryStore`], a capped list of
//! [`MemoryEntry`]). [`assess_risk`] is the pre-spawn predictive check
//! the supervisor runs before committing a worker to an issue.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use shipwright_lock::LockFile;
use shipwright_types::{AnomalySeverity, Baseline, MemoryEntry};

pub const BASELINES_FILE: &str = "baselines/default.json";
pub const PATTERNS_FILE: &str = "memory/patterns.json";
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_PATTERN_ENTRIES: usize = 500;

pub fn baselines_path(state_dir: &Path) -> PathBuf {
    state_dir.join(BASELINES_FILE)
}

pub fn patterns_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PATTERNS_FILE)
}

fn key(stage: &str, metric_name: &str) -> String {
    format!("{stage}:{metric_name}")
}

fn write_atomic_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync tmp file")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} into place", path.display()))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir_file) = File::open(parent) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

/// Document written to `baselines/default.json`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BaselineDocument {
    pub schema_version: u32,
    pub baselines: HashMap<String, Baseline>,
}

pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        baselines_path(&self.dir)
    }

    pub fn load(&self) -> Result<BaselineDocument> {
        let path = self.path();
        if !path.exists() {
            return Ok(BaselineDocument { schema_version: 1, ..Default::default() });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read baselines file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse baselines JSON from {}", path.display()))
    }

    /// Locked read-modify-write over the full document.
    pub fn mutate<F>(&self, f: F) -> Result<BaselineDocument>
    where
        F: FnOnce(&mut BaselineDocument) -> Result<()>,
    {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("baselines"))
            .context("failed to acquire baselines lock")?;
        let mut doc = self.load()?;
        f(&mut doc)?;
        write_atomic_json(&self.path(), &doc)?;
        Ok(doc)
    }

    /// Fold `current` into the baseline for `(stage, metric_name)`,
    /// creating it at `current` on first observation, and return the
    /// anomaly severity of `current` against the baseline as it stood
    /// *before* this observation (an anomaly is judged against history,
    /// not against itself).
    pub fn observe(&self, stage: &str, metric_name: &str, current: f64) -> Result<AnomalySeverity> {
        let k = key(stage, metric_name);
        let mut severity = AnomalySeverity::Normal;
        self.mutate(|doc| {
            match doc.baselines.get_mut(&k) {
                Some(baseline) => {
                    severity = baseline.anomaly_severity(current);
                    baseline.observe(current);
                }
                None => {
                    doc.baselines
                        .insert(k.clone(), Baseline::new(stage, metric_name, current));
                }
            }
            Ok(())
        })?;
        Ok(severity)
    }
}

/// Document written to `memory/patterns.json`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PatternDocument {
    pub schema_version: u32,
    pub entries: Vec<MemoryEntry>,
}

pub struct MemoryStore {
    dir: PathBuf,
}

impl MemoryStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        patterns_path(&self.dir)
    }

    pub fn load(&self) -> Result<PatternDocument> {
        let path = self.path();
        if !path.exists() {
            return Ok(PatternDocument { schema_version: 1, ..Default::default() });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read patterns file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse patterns JSON from {}", path.display()))
    }

    pub fn mutate<F>(&self, f: F) -> Result<PatternDocument>
    where
        F: FnOnce(&mut PatternDocument) -> Result<()>,
    {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("memory-patterns"))
            .context("failed to acquire memory patterns lock")?;
        let mut doc = self.load()?;
        f(&mut doc)?;
        if doc.entries.len() > MAX_PATTERN_ENTRIES {
            let excess = doc.entries.len() - MAX_PATTERN_ENTRIES;
            doc.entries.drain(0..excess);
        }
        write_atomic_json(&self.path(), &doc)?;
        Ok(doc)
    }

    /// Record a failure signature, bumping `seen_count` if it already
    /// exists for this stage, or inserting a fresh entry otherwise.
    pub fn record_failure(
        &self,
        signature: &str,
        stage: &str,
        root_cause: Option<String>,
    ) -> Result<()> {
        self.mutate(|doc| {
            if let Some(existing) = doc
                .entries
                .iter_mut()
                .find(|e| e.signature == signature && e.stage == stage)
            {
                existing.seen_count += 1;
                existing.last_seen = Utc::now();
                if root_cause.is_some() {
                    existing.root_cause = root_cause;
                }
            } else {
                doc.entries.push(MemoryEntry {
                    signature: signature.to_string(),
                    stage: stage.to_string(),
                    seen_count: 1,
                    last_seen: Utc::now(),
                    root_cause,
                });
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Entries matching `signature` for any stage, most recently seen first.
    pub fn lookup(&self, signature: &str) -> Result<Vec<MemoryEntry>> {
        let mut entries: Vec<MemoryEntry> = self
            .load()?
            .entries
            .into_iter()
            .filter(|e| e.signature == signature)
            .collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(entries)
    }
}

/// Inputs to the pre-spawn predictive-risk check. Each signal is
/// independently optional; an absent signal contributes no risk rather
/// than being treated as maximally risky, so a sparse memory store
/// never forces every job to the expensive model.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskInputs {
    /// How many times a matching failure signature has recurred for
    /// this kind of change (from [`MemoryStore::lookup`]).
    pub recurring_failure_count: u32,
    /// Current change-failure-rate (0.0-1.0) from recent DORA signals.
    pub change_failure_rate: f64,
    /// Triage-scored complexity signal inverted to a 0-100 risk range
    /// by the caller (higher = riskier).
    pub complexity_risk: u8,
    /// Anomaly severity of the most relevant baseline metric, if any.
    pub anomaly: Option<AnomalySeverity>,
}

/// Overall predictive risk 0-100, combining recurring failures, DORA
/// change-failure-rate, complexity, and anomaly severity. A caller
/// upgrades to the most capable model when this exceeds 80.
pub fn assess_risk(inputs: RiskInputs) -> u8 {
    let mut risk: f64 = 0.0;
    risk += (inputs.recurring_failure_count.min(5) as f64) * 8.0;
    risk += inputs.change_failure_rate * 30.0;
    risk += inputs.complexity_risk as f64 * 0.3;
    risk += match inputs.anomaly {
        Some(AnomalySeverity::Critical) => 20.0,
        Some(AnomalySeverity::Warning) => 10.0,
        Some(AnomalySeverity::Normal) | None => 0.0,
    };
    risk.round().clamp(0.0, 100.0) as u8
}
