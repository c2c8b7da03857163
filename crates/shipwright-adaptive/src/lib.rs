//! Adaptive threshold learning, gated by `intelligence.adaptive_enabled`.
//!
//! Each learned threshold is a pure function here
//! (`poll_interval`, `heartbeat_timeout`, `stale_timeout`,
//! `worker_memory_gb`, `scale_up_allowed`, `patrol_max_issues`); the
//! supervisor samples its own counters and calls these each tick. The
//! four persisted JSON documents under `optimization/` are modeled as
//! separate stores so `daemon-tuning.json`, `pipeline-durations.json`,
//! `stage-durations.json`, and `template-weights.json` can each be
//! mutated independently without contending on one giant lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_lock::LockFile;

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_SAMPLES_PER_KEY: usize = 200;

fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
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

fn load_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

// ---- pure threshold functions ----

/// Shrinks to 30s once the queue has work, expands to 120s after 5
/// consecutive empty cycles, otherwise holds at 60s.
pub fn poll_interval(queue_depth: usize, consecutive_empty_cycles: u32) -> Duration {
    if queue_depth > 0 {
        Duration::from_secs(30)
    } else if consecutive_empty_cycles >= 5 {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(60)
    }
}

pub fn rolling_mean_last_n(samples: &[f64], n: usize) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let tail = &samples[samples.len().saturating_sub(n)..];
    tail.iter().sum::<f64>() / tail.len() as f64
}

/// Linear-interpolated percentile over `sorted` values (ascending),
/// `p` in `0.0..=1.0`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

/// `1.5 x p90`, floored at 60s.
pub fn heartbeat_timeout(p90_s: f64) -> Duration {
    Duration::from_secs_f64((1.5 * p90_s).max(60.0))
}

/// `1.5 x p95`, clamped to `600s..=7200s`.
pub fn stale_timeout(p95_s: f64) -> Duration {
    Duration::from_secs_f64((1.5 * p95_s).clamp(600.0, 7200.0))
}

/// `1.25 x mean RSS`, clamped to `1..=16` GiB.
pub fn worker_memory_gb(mean_rss_gb: f64) -> f64 {
    (1.25 * mean_rss_gb).clamp(1.0, 16.0)
}

/// Scale-up by one is only allowed when the historical success rate at
/// the target parallelism level is at least 50%.
pub fn scale_up_allowed(success_rate_at_target: f64) -> bool {
    success_rate_at_target >= 0.50
}

/// `+2` if the cap was saturated by the last run's findings, `-1`
/// (floored at 3) if it found nothing, else unchanged.
pub fn patrol_max_issues(current: u32, last_run_findings: u32) -> u32 {
    if last_run_findings >= current {
        current + 2
    } else if last_run_findings == 0 {
        current.saturating_sub(1).max(3)
    } else {
        current
    }
}

// ---- persisted documents ----

pub const TUNING_FILE: &str = "optimization/daemon-tuning.json";
pub const PIPELINE_DURATIONS_FILE: &str = "optimization/pipeline-durations.json";
pub const STAGE_DURATIONS_FILE: &str = "optimization/stage-durations.json";
pub const TEMPLATE_WEIGHTS_FILE: &str = "optimization/template-weights.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningDocument {
    pub schema_version: u32,
    pub poll_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    pub stale_timeout_s: u64,
    pub worker_memory_gb: f64,
    pub max_parallel: u32,
    pub patrol_max_issues: u32,
    pub cost_per_job_by_template: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationSample {
    pub value_s: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationsDocument {
    pub schema_version: u32,
    pub by_key: HashMap<String, Vec<DurationSample>>,
}

impl DurationsDocument {
    pub fn record(&mut self, key: &str, value_s: f64) {
        let samples = self.by_key.entry(key.to_string()).or_default();
        samples.push(DurationSample { value_s, ts: Utc::now() });
        if samples.len() > MAX_SAMPLES_PER_KEY {
            let excess = samples.len() - MAX_SAMPLES_PER_KEY;
            samples.drain(0..excess);
        }
    }

    pub fn percentile_for(&self, key: &str, p: f64) -> f64 {
        let Some(samples) = self.by_key.get(key) else {
            return 0.0;
        };
        let mut values: Vec<f64> = samples.iter().map(|s| s.value_s).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        percentile(&values, p)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TemplateWeight {
    pub successes: u32,
    pub total: u32,
}

impl TemplateWeight {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateWeightsDocument {
    pub schema_version: u32,
    pub weights: HashMap<String, TemplateWeight>,
}

/// Generic locked read-modify-write store over one of the four
/// documents above, parameterized by its relative file path.
pub struct AdaptiveStore {
    dir: PathBuf,
}

impl AdaptiveStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    pub fn load_tuning(&self) -> Result<TuningDocument> {
        load_or_default(&self.path(TUNING_FILE))
    }

    pub fn mutate_tuning<F>(&self, f: F) -> Result<TuningDocument>
    where
        F: FnOnce(&mut TuningDocument) -> Result<()>,
    {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("daemon-tuning"))
            .context("failed to acquire tuning lock")?;
        let mut doc = self.load_tuning()?;
        f(&mut doc)?;
        write_atomic_json(&self.path(TUNING_FILE), &doc)?;
        Ok(doc)
    }

    pub fn load_pipeline_durations(&self) -> Result<DurationsDocument> {
        load_or_default(&self.path(PIPELINE_DURATIONS_FILE))
    }

    pub fn record_pipeline_duration(&self, template: &str, value_s: f64) -> Result<()> {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("pipeline-durations"))
            .context("failed to acquire pipeline-durations lock")?;
        let mut doc = self.load_pipeline_durations()?;
        doc.record(template, value_s);
        write_atomic_json(&self.path(PIPELINE_DURATIONS_FILE), &doc)
    }

    pub fn load_stage_durations(&self) -> Result<DurationsDocument> {
        load_or_default(&self.path(STAGE_DURATIONS_FILE))
    }

    pub fn record_stage_duration(&self, stage: &str, value_s: f64) -> Result<()> {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("stage-durations"))
            .context("failed to acquire stage-durations lock")?;
        let mut doc = self.load_stage_durations()?;
        doc.record(stage, value_s);
        write_atomic_json(&self.path(STAGE_DURATIONS_FILE), &doc)
    }

    pub fn load_template_weights(&self) -> Result<TemplateWeightsDocument> {
        load_or_default(&self.path(TEMPLATE_WEIGHTS_FILE))
    }

    pub fn record_template_outcome(&self, template: &str, success: bool) -> Result<()> {
        let _lock = LockFile::acquire_bounded(&self.dir, LOCK_TIMEOUT, Some("template-weights"))
            .context("failed to acquire template-weights lock")?;
        let mut doc = self.load_template_weights()?;
        let weight = doc.weights.entry(template.to_string()).or_default();
        weight.total += 1;
        if success {
            weight.successes += 1;
        }
        write_atomic_json(&self.path(TEMPLATE_WEIGHTS_FILE), &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn poll_interval_prefers_nonempty_queue() {
        assert_eq!(poll_interval(3, 10), Duration::from_secs(30));
    }

    #[test]
    fn poll_interval_expands_after_five_empty_cycles() {
        assert_eq!(poll_interval(0, 5), Duration::from_secs(120));
        assert_eq!(poll_interval(0, 4), Duration::from_secs(60));
    }

    #[test]
    fn percentile_matches_known_values() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
    }

    #[test]
    fn heartbeat_timeout_floors_at_sixty_seconds() {
        assert_eq!(heartbeat_timeout(10.0), Duration::from_secs(60));
        assert_eq!(heartbeat_timeout(100.0), Duration::from_secs_f64(150.0));
    }

    #[test]
    fn stale_timeout_clamps_both_ends() {
        assert_eq!(stale_timeout(10.0), Duration::from_secs(600));
        assert_eq!(stale_timeout(100_000.0), Duration::from_secs(7200));
    }

    #[test]
    fn worker_memory_clamps_between_one_and_sixteen_gib() {
        assert_eq!(worker_memory_gb(0.1), 1.0);
        assert_eq!(worker_memory_gb(100.0), 16.0);
        assert_eq!(worker_memory_gb(2.0), 2.5);
    }

    #[test]
    fn scale_up_requires_majority_success_rate() {
        assert!(scale_up_allowed(0.5));
        assert!(!scale_up_allowed(0.49));
    }

    #[test]
    fn patrol_max_issues_grows_when_saturated_shrinks_when_empty() {
        assert_eq!(patrol_max_issues(5, 5), 7);
        assert_eq!(patrol_max_issues(5, 0), 4);
        assert_eq!(patrol_max_issues(3, 0), 3);
        assert_eq!(patrol_max_issues(5, 2), 5);
    }

    #[test]
    fn durations_document_caps_samples_per_key() {
        let mut doc = DurationsDocument::default();
        for i in 0..(MAX_SAMPLES_PER_KEY + 20) {
            doc.record("build", i as f64);
        }
        assert_eq!(doc.by_key.get("build").unwrap().len(), MAX_SAMPLES_PER_KEY);
    }

    #[test]
    fn template_weight_success_rate() {
        let weight = TemplateWeight { successes: 3, total: 4 };
        assert_eq!(weight.success_rate(), 0.75);
    }

    #[test]
    fn adaptive_store_round_trips_tuning_document() {
        let td = tempdir().expect("tempdir");
        let store = AdaptiveStore::new(td.path());
        store
            .mutate_tuning(|doc| {
                doc.schema_version = 1;
                doc.max_parallel = 5;
                Ok(())
            })
            .expect("mutate");
        let loaded = store.load_tuning().expect("load");
        assert_eq!(loaded.max_parallel, 5);
    }

    #[test]
    fn adaptive_store_records_pipeline_durations() {
        let td = tempdir().expect("tempdir");
        let store = AdaptiveStore::new(td.path());
        store.record_pipeline_duration("standard", 600.0).expect("record");
        store.record_pipeline_duration("standard", 1200.0).expect("record");
        let doc = store.load_pipeline_durations().expect("load");
        assert_eq!(doc.percentile_for("standard", 1.0), 1200.0);
    }

    #[test]
    fn adaptive_store_tracks_template_success_rate() {
        let td = tempdir().expect("tempdir");
        let store = AdaptiveStore::new(td.path());
        store.record_template_outcome("fast", true).expect("record");
        store.record_template_outcome("fast", true).expect("record");
        store.record_template_outcome("fast", false).expect("record");
        let doc = store.load_template_weights().expect("load");
        let weight = doc.weights.get("fast").unwrap();
        assert_eq!(weight.total, 3);
        assert_eq!(weight.successes, 2);
    }
}
