//! Parallelism auto-scaling for the Shipwright supervisor.
//!
//! [`compute_caps`] turns a snapshot of system/fleet signals into five
//! independent component caps (CPU, memory, budget, queue, vitals); the
//! target parallelism is their minimum, further clamped to
//! `min_workers..=max_workers` and an optional externally imposed fleet
//! ceiling. [`step_toward_target`] is the one-step-per-tick limiter: the
//! supervisor never jumps straight to the target, and a scale-up additionally
//! requires the caller to have already checked the adaptive engine's
//! historical-success-rate gate (`shipwright_adaptive::scale_up_allowed`) —
//! this crate takes that verdict as a plain `bool` rather than depending on
//! `shipwright-adaptive` itself, so the two concerns (what the target should
//! be, and whether it's safe to move toward it) stay decoupled.

use sysinfo::System;

/// Everything [`compute_caps`] needs, gathered by the supervisor once per
/// auto-scale tick.
#[derive(Debug, Clone, Copy)]
pub struct ScalingInputs {
    pub cores: usize,
    /// One-minute load average (as sysinfo reports it: cores-equivalent,
    /// not a percentage).
    pub load_average_one: f64,
    pub available_memory_gib: f64,
    pub worker_memory_gib: f64,
    pub remaining_budget_usd: f64,
    pub cost_per_job_usd: f64,
    pub queued: u32,
    pub active: u32,
    /// Mean job health 0-100, when the progress sensor has one to report.
    pub avg_health_pct: Option<f64>,
    /// An externally imposed fleet-wide ceiling (e.g. a shared quota),
    /// if the operator has configured one.
    pub fleet_ceiling: Option<u32>,
    pub max_workers: u32,
    pub min_workers: u32,
}

/// The five independent component caps plus the resulting target, all
/// carried through to the `daemon.scale` event so an operator can see
/// which constraint is binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleCaps {
    pub cpu_cap: u32,
    pub memory_cap: u32,
    pub budget_cap: u32,
    pub queue_cap: u32,
    pub vitals_cap: u32,
    /// `min(cpu_cap, memory_cap, budget_cap, queue_cap, vitals_cap,
    /// fleet_ceiling, max_workers)`, clamped to `min_workers`.
    pub target: u32,
}

/// CPU cap: `0.75 × cores`, tightened by load-average brackets. At or
/// above 95% load (relative to `cores`) the cap collapses to
/// `min_workers`; at or above 85% it's `0.5 × cores`; below that the
/// base `0.75 × cores` cap applies unreduced.
fn cpu_cap(cores: usize, load_average_one: f64, min_workers: u32) -> u32 {
    let cores_f = (cores.max(1)) as f64;
    let load_pct = (load_average_one / cores_f) * 100.0;
    if load_pct >= 95.0 {
        return min_workers;
    }
    let factor = if load_pct >= 85.0 { 0.5 } else { 0.75 };
    (cores_f * factor).floor().max(0.0) as u32
}

fn memory_cap(available_memory_gib: f64, worker_memory_gib: f64) -> u32 {
    if worker_memory_gib <= 0.0 {
        return u32::MAX;
    }
    (available_memory_gib / worker_memory_gib).floor().max(0.0) as u32
}

fn budget_cap(remaining_budget_usd: f64, cost_per_job_usd: f64) -> u32 {
    if cost_per_job_usd <= 0.0 {
        return u32::MAX;
    }
    (remaining_budget_usd / cost_per_job_usd).floor().max(0.0) as u32
}

fn queue_cap(queued: u32, active: u32) -> u32 {
    queued.saturating_add(active)
}

/// No sense provisioning beyond a fleet that's mostly unhealthy: below
/// 50% average health the vitals cap scales `max_workers` down linearly;
/// at or above 50% it imposes no additional restriction.
fn vitals_cap(max_workers: u32, avg_health_pct: Option<f64>) -> u32 {
    match avg_health_pct {
        Some(health) if health < 50.0 => {
            ((max_workers as f64) * (health / 100.0)).floor().max(0.0) as u32
        }
        _ => u32::MAX,
    }
}

/// Compute this tick's component caps and resulting target.
pub fn compute_caps(inputs: &ScalingInputs) -> ScaleCaps {
    let cpu_cap = cpu_cap(inputs.cores, inputs.load_average_one, inputs.min_workers);
    let memory_cap = memory_cap(inputs.available_memory_gib, inputs.worker_memory_gib);
    let budget_cap = budget_cap(inputs.remaining_budget_usd, inputs.cost_per_job_usd);
    let queue_cap = queue_cap(inputs.queued, inputs.active);
    let vitals_cap = vitals_cap(inputs.max_workers, inputs.avg_health_pct);

    let mut target = [
        cpu_cap,
        memory_cap,
        budget_cap,
        queue_cap,
        vitals_cap,
        inputs.fleet_ceiling.unwrap_or(u32::MAX),
        inputs.max_workers,
    ]
    .into_iter()
    .min()
    .unwrap_or(inputs.min_workers);

    target = target.max(inputs.min_workers);

    ScaleCaps {
        cpu_cap,
        memory_cap,
        budget_cap,
        queue_cap,
        vitals_cap,
        target,
    }
}

/// Move `current` at most one step toward `target`. A step up additionally
/// requires `scale_up_allowed` (the caller's adaptive-engine historical
/// success-rate check); a step down is never blocked, since backing off
/// is always safe. The result stays within `min_workers..=max_workers`.
pub fn step_toward_target(
    current: u32,
    target: u32,
    scale_up_allowed: bool,
    min_workers: u32,
    max_workers: u32,
) -> u32 {
    let next = match target.cmp(&current) {
        std::cmp::Ordering::Greater if scale_up_allowed => current + 1,
        std::cmp::Ordering::Greater => current,
        std::cmp::Ordering::Less => current.saturating_sub(1),
        std::cmp::Ordering::Equal => current,
    };
    next.clamp(min_workers, max_workers)
}

/// Live one-minute load average for the current host, for callers that
/// don't already have one from a shared `sysinfo::System`.
pub fn current_load_average_one() -> f64 {
    System::load_average().one
}
