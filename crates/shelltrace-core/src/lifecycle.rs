//! Lifecycle monitor: polling-based exit detection with a one-cycle grace
//! period.
//!
//! Traced processes are unrelated to the agent, so there is no SIGCHLD to
//! wait on. Each refresh walks the registry, reclaims instances that were
//! already marked Exited on a previous pass, then probes the remaining
//! instances. An instance whose process has vanished is marked Exited but
//! kept enumerable until the next reconcile, so the collector observes its
//! final counters exactly once.
//!
//! The pass is split into phases so the engine can release its state lock
//! while probes read procfs: [`LifecycleMonitor::reclaim_expired`] and
//! [`LifecycleMonitor::apply`] only touch the registry, while
//! [`LifecycleMonitor::observe`] only does probe I/O. `apply` re-checks
//! each instance before transitioning it, so registrations and discards
//! that happened while probes ran are never clobbered by stale readings.
//!
//! Pid reuse is detected by comparing the kernel start time recorded at
//! registration against the probe's current reading; a mismatch means the
//! pid now names a different process and the instance is treated as exited.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::liveness::{Liveness, LivenessProbe};
use crate::record::InstanceId;
use crate::registry::{InstanceRegistry, InstanceState};

/// What one reconcile pass did.
#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    /// Instances probed this pass.
    pub polled: usize,
    /// Instances transitioned to Exited this pass.
    pub newly_exited: Vec<InstanceId>,
    /// Instances reclaimed (grace period over) this pass.
    pub reclaimed: Vec<InstanceId>,
    /// Pids where reuse by an unrelated process was detected.
    pub pid_reused: Vec<u32>,
}

impl RefreshReport {
    /// Whether the pass changed any lifecycle state.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.newly_exited.is_empty() && self.reclaimed.is_empty()
    }
}

/// One instance to probe, captured from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTarget {
    /// Instance to transition if the reading warrants it.
    pub id: InstanceId,
    /// Pid the instance referred to when the target was captured.
    pub pid: u32,
}

/// A liveness reading for one target.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// The target the reading belongs to.
    pub target: PollTarget,
    /// What the probe saw.
    pub liveness: Liveness,
}

/// Drives instance lifecycle transitions from liveness probes.
pub struct LifecycleMonitor {
    probe: Arc<dyn LivenessProbe>,
}

impl LifecycleMonitor {
    /// Create a monitor over the given probe.
    #[must_use]
    pub fn new(probe: Arc<dyn LivenessProbe>) -> Self {
        Self { probe }
    }

    /// Reclaim every instance whose grace period ended on a previous pass.
    /// Registry-only; no I/O.
    pub fn reclaim_expired(registry: &mut InstanceRegistry) -> Vec<InstanceId> {
        let mut reclaimed = Vec::new();
        for id in registry.exited_ids() {
            if let Ok(instance) = registry.reclaim(id) {
                info!(
                    instance = id,
                    pid = instance.pid,
                    "grace period over, reclaiming instance"
                );
                reclaimed.push(id);
            }
        }
        reclaimed
    }

    /// Instances that need a liveness reading this pass (Pending or
    /// Active). Registry-only; no I/O.
    #[must_use]
    pub fn poll_targets(registry: &InstanceRegistry) -> Vec<PollTarget> {
        registry
            .pollable_ids()
            .into_iter()
            .filter_map(|id| {
                registry
                    .get(id)
                    .map(|instance| PollTarget { id, pid: instance.pid })
            })
            .collect()
    }

    /// Probe each target. Never touches the registry, so callers can run
    /// this with the engine state unlocked.
    #[must_use]
    pub fn observe(&self, targets: &[PollTarget]) -> Vec<Observation> {
        targets
            .iter()
            .map(|&target| Observation {
                target,
                liveness: self.probe.probe(target.pid),
            })
            .collect()
    }

    /// Apply the readings to the registry. Registry-only; no I/O.
    ///
    /// Each observation is validated against the current registry entry:
    /// an instance that was discarded, reclaimed, or whose id now names a
    /// different pid is skipped, as is one no longer Pending/Active.
    pub fn apply(
        registry: &mut InstanceRegistry,
        observations: &[Observation],
        now_ms: u64,
        report: &mut RefreshReport,
    ) {
        for observation in observations {
            let id = observation.target.id;
            let Some(instance) = registry.get_mut(id) else {
                continue;
            };
            if instance.pid != observation.target.pid
                || !matches!(instance.state, InstanceState::Pending | InstanceState::Active)
            {
                debug!(instance = id, "stale observation skipped");
                continue;
            }
            report.polled += 1;
            instance.last_liveness_check_ms = Some(now_ms);

            match observation.liveness {
                Liveness::Gone => {
                    info!(instance = id, pid = instance.pid, "traced process exited");
                    instance.state = InstanceState::Exited;
                    report.newly_exited.push(id);
                }
                Liveness::Alive { start_time } => match instance.start_time {
                    Some(recorded) if recorded != start_time => {
                        warn!(
                            instance = id,
                            pid = instance.pid,
                            recorded,
                            observed = start_time,
                            "pid reused by an unrelated process"
                        );
                        instance.state = InstanceState::Exited;
                        report.newly_exited.push(id);
                        report.pid_reused.push(instance.pid);
                    }
                    Some(_) => {}
                    None => {
                        debug!(
                            instance = id,
                            pid = instance.pid,
                            start_time,
                            "recording start time for reuse detection"
                        );
                        instance.start_time = Some(start_time);
                    }
                },
            }
        }
    }

    /// One full reconcile pass: reclaim, probe, apply, in that order.
    /// Reclaim-first is what gives an Exited instance exactly one
    /// enumerable grace refresh.
    pub fn reconcile(&self, registry: &mut InstanceRegistry, now_ms: u64) -> RefreshReport {
        let mut report = RefreshReport {
            reclaimed: Self::reclaim_expired(registry),
            ..RefreshReport::default()
        };
        let targets = Self::poll_targets(registry);
        let observations = self.observe(&targets);
        Self::apply(registry, &observations, now_ms, &mut report);
        report
    }
}
