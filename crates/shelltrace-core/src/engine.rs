//! The trace engine: registry, stores, budget, and lifecycle under one
//! lock, with per-instance ingestion tasks feeding in from the side.
//!
//! Locking model: a single `std::sync::Mutex` guards all engine state.
//! Every operation takes the lock, mutates, and releases without awaiting,
//! so ingestion tasks and the collector never deadlock and a reader never
//! observes a half-applied eviction. Refresh passes additionally serialize
//! behind an async gate so at most one reconcile is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::budget::{Admission, BudgetSummary, MemoryBudgetManager};
use crate::config::EngineConfig;
use crate::decoder::DecodedLine;
use crate::error::{Error, Result};
use crate::gate::{AccessGate, StoreOrigin};
use crate::lifecycle::{LifecycleMonitor, RefreshReport};
use crate::liveness::{Liveness, LivenessProbe};
use crate::record::{InstanceId, RecordFlags, TraceRecord};
use crate::registry::{InstanceRegistry, InstanceState};
use crate::store::EventStore;
use crate::version::Handshake;

/// Which per-instance value to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Pid,
    ParentPid,
    Script,
    Basename,
    Version,
    RecordCount,
    RetainedBytes,
    DroppedRecords,
    ParseErrors,
    LatestTimestamp,
    LatestLine,
    LatestFunction,
    LatestCommand,
}

/// A fetched per-instance value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    U32(u32),
    U64(u64),
    Text(String),
    /// The metric exists but has no value yet (no handshake, empty store).
    None,
}

struct EngineState {
    registry: InstanceRegistry,
    stores: HashMap<InstanceId, EventStore>,
    budget: MemoryBudgetManager,
    stops: HashMap<InstanceId, Arc<AtomicBool>>,
}

/// Agent-side collection engine for instrumented shell processes.
pub struct TraceEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    refresh_gate: tokio::sync::Mutex<()>,
    probe: Arc<dyn LivenessProbe>,
    monitor: LifecycleMonitor,
    next_seq: AtomicU64,
}

impl TraceEngine {
    /// Create an engine over the given liveness probe.
    #[must_use]
    pub fn new(config: EngineConfig, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                registry: InstanceRegistry::new(),
                stores: HashMap::new(),
                budget: MemoryBudgetManager::new(config.max_memory_bytes),
                stops: HashMap::new(),
            }),
            config,
            refresh_gate: tokio::sync::Mutex::new(()),
            probe: probe.clone(),
            monitor: LifecycleMonitor::new(probe),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Engine configuration as constructed.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Attachment and ingestion plumbing
    // =========================================================================

    /// Register a traced process and spawn its ingestion task over
    /// `channel`. The instance stays Pending until the handshake line
    /// arrives and validates.
    pub fn attach<R>(
        self: &Arc<Self>,
        pid: u32,
        parent_pid: u32,
        restricted: bool,
        channel: R,
    ) -> Result<InstanceId>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let start_time = match self.probe.probe(pid) {
            Liveness::Alive { start_time } => Some(start_time),
            Liveness::Gone => None,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let id = {
            let mut state = self.lock_state();
            let id = state
                .registry
                .register(pid, parent_pid, restricted, start_time)?;
            state.stores.insert(id, EventStore::new());
            state.stops.insert(id, stop.clone());
            id
        };

        info!(instance = id, pid, parent_pid, restricted, "instance attached");
        tokio::spawn(crate::ingest::run(self.clone(), id, channel, stop));
        Ok(id)
    }

    /// Complete the handshake for a Pending instance.
    pub(crate) fn activate(&self, id: InstanceId, handshake: &Handshake) -> Result<()> {
        let mut state = self.lock_state();
        state
            .registry
            .activate(id, handshake.version, handshake.script.as_deref())?;
        info!(
            instance = id,
            version = handshake.version,
            script = handshake.script.as_deref().unwrap_or(""),
            "handshake accepted"
        );
        Ok(())
    }

    /// Remove a half-attached instance after a failed handshake. No entry
    /// persists for it.
    pub(crate) fn discard(&self, id: InstanceId) {
        let mut state = self.lock_state();
        if let Some(instance) = state.registry.discard(id) {
            debug!(instance = id, pid = instance.pid, "instance discarded");
        }
        if let Some(store) = state.stores.remove(&id) {
            state.budget.release(store.retained_bytes());
        }
        state.stops.remove(&id);
    }

    /// Called by the ingestion task when its channel ends. Exit detection
    /// stays with the lifecycle monitor so the grace period is driven from
    /// one place.
    pub(crate) fn channel_closed(&self, id: InstanceId) {
        debug!(instance = id, "ingestion task finished");
    }

    /// Count one malformed line against an instance.
    pub(crate) fn note_parse_error(&self, id: InstanceId) {
        let mut state = self.lock_state();
        if let Some(store) = state.stores.get_mut(&id) {
            store.note_parse_error();
        }
    }

    // =========================================================================
    // Record admission
    // =========================================================================

    /// Commit a decoded record from an instance's own ingestion path.
    pub(crate) fn commit_record(
        &self,
        id: InstanceId,
        decoded: &DecodedLine,
        flags: RecordFlags,
    ) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = TraceRecord {
            owner: id,
            seq,
            flags,
            timestamp_ms: decoded.timestamp_ms,
            source_line: decoded.source_line,
            function: decoded.function.clone(),
            command: decoded.command.clone(),
        };

        let mut state = self.lock_state();
        let Some(instance) = state.registry.get(id) else {
            debug!(instance = id, "record for unknown instance dropped");
            return Ok(());
        };
        if instance.state != InstanceState::Active {
            debug!(instance = id, "record for inactive instance dropped");
            return Ok(());
        }
        AccessGate::check_store(id, instance.restricted, StoreOrigin::Ingestion)?;
        Self::admit(&mut state, id, record)
    }

    /// Store a record into an instance's event queue from outside the
    /// ingestion path. Subject to the restricted-store gate.
    pub fn store_admin(&self, id: InstanceId, decoded: &DecodedLine) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = TraceRecord {
            owner: id,
            seq,
            flags: RecordFlags::NONE,
            timestamp_ms: decoded.timestamp_ms,
            source_line: decoded.source_line,
            function: decoded.function.clone(),
            command: decoded.command.clone(),
        };

        let mut state = self.lock_state();
        let instance = state.registry.get(id).ok_or(Error::NoSuchInstance(id))?;
        AccessGate::check_store(id, instance.restricted, StoreOrigin::Administrative)?;
        Self::admit(&mut state, id, record)
    }

    /// Budget-checked append. Evicts globally-oldest records when needed;
    /// never blocks, never signals the producer.
    fn admit(state: &mut EngineState, id: InstanceId, record: TraceRecord) -> Result<()> {
        let cost = record.cost();
        match state.budget.assess(cost) {
            Admission::Oversized => {
                state.budget.note_dropped();
                if let Some(store) = state.stores.get_mut(&id) {
                    store.note_dropped();
                }
                return Err(Error::BudgetExceeded {
                    cost,
                    ceiling: state.budget.ceiling(),
                });
            }
            Admission::NeedsEviction => {
                Self::evict_until_fits(state, cost);
            }
            Admission::Fits => {}
        }

        state.budget.charge(cost);
        if let Some(store) = state.stores.get_mut(&id) {
            store.append(record);
        }
        Ok(())
    }

    /// Pop the record with the globally smallest arrival sequence until
    /// `cost` more bytes fit under the ceiling.
    fn evict_until_fits(state: &mut EngineState, cost: usize) {
        while state.budget.retained() + cost > state.budget.ceiling() {
            let victim = state
                .stores
                .iter()
                .filter_map(|(&id, store)| store.oldest_seq().map(|seq| (seq, id)))
                .min();
            let Some((_, victim_id)) = victim else {
                break;
            };
            if let Some(store) = state.stores.get_mut(&victim_id) {
                if let Some(evicted) = store.evict_oldest() {
                    state.budget.release(evicted.cost());
                    state.budget.note_evicted();
                    debug!(
                        instance = victim_id,
                        seq = evicted.seq,
                        freed = evicted.cost(),
                        "evicted oldest record for budget"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Refresh and fetch
    // =========================================================================

    /// One refresh pass: reclaim instances whose grace period is over, then
    /// probe the rest for exits and pid reuse. At most one pass runs at a
    /// time; concurrent callers queue behind the gate.
    ///
    /// Probing reads procfs, so it runs with the state lock released.
    /// Ingestion keeps committing records throughout; the monitor's apply
    /// step re-validates each observation against the registry so state
    /// changed while probes ran is never clobbered.
    pub async fn refresh(&self) -> RefreshReport {
        let _gate = self.refresh_gate.lock().await;
        let now = now_ms();

        let (mut report, targets) = {
            let mut state = self.lock_state();
            let reclaimed = LifecycleMonitor::reclaim_expired(&mut state.registry);
            for &id in &reclaimed {
                if let Some(store) = state.stores.remove(&id) {
                    state.budget.release(store.retained_bytes());
                    debug!(
                        instance = id,
                        freed = store.retained_bytes(),
                        records = store.len(),
                        "released reclaimed instance's store"
                    );
                }
                state.stops.remove(&id);
            }
            let targets = LifecycleMonitor::poll_targets(&state.registry);
            (
                RefreshReport {
                    reclaimed,
                    ..RefreshReport::default()
                },
                targets,
            )
        };

        // Lock dropped: probe I/O happens here.
        let observations = self.monitor.observe(&targets);

        let mut state = self.lock_state();
        LifecycleMonitor::apply(&mut state.registry, &observations, now, &mut report);
        for &id in &report.newly_exited {
            if let Some(stop) = state.stops.get(&id) {
                stop.store(true, Ordering::Relaxed);
            }
        }
        drop(state);

        if !report.is_quiet() {
            info!(
                polled = report.polled,
                exited = report.newly_exited.len(),
                reclaimed = report.reclaimed.len(),
                "refresh pass complete"
            );
        }
        report
    }

    /// Current instance-domain view: `(id, basename)` pairs in registration
    /// order, Exited grace instances included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(InstanceId, String)> {
        self.lock_state().registry.snapshot()
    }

    /// Snapshot of an instance's retained records, oldest first.
    pub fn fetch_records(&self, id: InstanceId) -> Result<Vec<TraceRecord>> {
        let state = self.lock_state();
        state.registry.get(id).ok_or(Error::NoSuchInstance(id))?;
        Ok(state.stores.get(&id).map(EventStore::fetch).unwrap_or_default())
    }

    /// Fetch one per-instance value.
    pub fn fetch_value(&self, id: InstanceId, kind: MetricKind) -> Result<MetricValue> {
        let state = self.lock_state();
        let instance = state.registry.get(id).ok_or(Error::NoSuchInstance(id))?;
        let store = state.stores.get(&id);

        let value = match kind {
            MetricKind::Pid => MetricValue::U32(instance.pid),
            MetricKind::ParentPid => MetricValue::U32(instance.parent_pid),
            MetricKind::Script => {
                if instance.script_path.is_empty() {
                    MetricValue::None
                } else {
                    MetricValue::Text(instance.script_path.clone())
                }
            }
            MetricKind::Basename => MetricValue::Text(instance.basename.clone()),
            MetricKind::Version => instance
                .version
                .map_or(MetricValue::None, MetricValue::U64),
            MetricKind::RecordCount => {
                MetricValue::U64(store.map_or(0, |s| s.len() as u64))
            }
            MetricKind::RetainedBytes => {
                MetricValue::U64(store.map_or(0, |s| s.retained_bytes() as u64))
            }
            MetricKind::DroppedRecords => MetricValue::U64(store.map_or(0, EventStore::dropped)),
            MetricKind::ParseErrors => MetricValue::U64(store.map_or(0, EventStore::parse_errors)),
            MetricKind::LatestTimestamp => latest(store)
                .map_or(MetricValue::None, |r| MetricValue::U64(r.timestamp_ms)),
            MetricKind::LatestLine => latest(store)
                .map_or(MetricValue::None, |r| MetricValue::U64(u64::from(r.source_line))),
            MetricKind::LatestFunction => latest(store)
                .map_or(MetricValue::None, |r| MetricValue::Text(r.function.clone())),
            MetricKind::LatestCommand => latest(store)
                .map_or(MetricValue::None, |r| MetricValue::Text(r.command.clone())),
        };
        Ok(value)
    }

    /// Aggregate budget counters.
    #[must_use]
    pub fn budget_summary(&self) -> BudgetSummary {
        self.lock_state().budget.summary()
    }

    /// Number of currently tracked (non-reclaimed) instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.lock_state().registry.len()
    }

    /// Whether a pid currently maps to a tracked instance. Discovery uses
    /// this to skip channels that are already being ingested.
    #[must_use]
    pub fn is_attached(&self, pid: u32) -> bool {
        self.lock_state().registry.lookup(pid).is_some()
    }

    /// Instance details by id, if still tracked.
    #[must_use]
    pub fn instance_state(&self, id: InstanceId) -> Option<InstanceState> {
        self.lock_state().registry.get(id).map(|i| i.state)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn latest<'a>(store: Option<&'a EventStore>) -> Option<&'a TraceRecord> {
    store.and_then(EventStore::latest)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl std::fmt::Debug for TraceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::FakeLiveness;

    fn engine_with_budget(max_memory_bytes: usize) -> (Arc<TraceEngine>, Arc<FakeLiveness>) {
        let probe = Arc::new(FakeLiveness::new());
        let config = EngineConfig {
            max_memory_bytes,
            restricted_default: false,
        };
        (Arc::new(TraceEngine::new(config, probe.clone())), probe)
    }

    fn decoded(function: &str, command: &str) -> DecodedLine {
        DecodedLine {
            timestamp_ms: 1_000,
            source_line: 10,
            function: function.to_string(),
            command: command.to_string(),
            truncated: false,
        }
    }

    /// Attach without a real channel: register directly through the same
    /// state transitions the ingestion task drives.
    fn attach_active(engine: &Arc<TraceEngine>, probe: &FakeLiveness, pid: u32) -> InstanceId {
        probe.set_running(pid, u64::from(pid));
        let id = {
            let mut state = engine.lock_state();
            let id = state
                .registry
                .register(pid, 1, false, Some(u64::from(pid)))
                .unwrap();
            state.stores.insert(id, EventStore::new());
            state.stops.insert(id, Arc::new(AtomicBool::new(false)));
            id
        };
        engine
            .activate(
                id,
                &Handshake {
                    version: 1,
                    script: Some("/opt/job.sh".to_string()),
                },
            )
            .unwrap();
        id
    }

    // ---- admission and eviction ----

    #[test]
    fn committed_records_are_fetchable() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);

        engine
            .commit_record(id, &decoded("main", "echo hi"), RecordFlags::NONE)
            .unwrap();
        let records = engine.fetch_records(id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, "echo hi");
        assert_eq!(records[0].owner, id);
    }

    #[test]
    fn oversized_record_is_dropped_and_counted() {
        let (engine, probe) = engine_with_budget(64);
        let id = attach_active(&engine, &probe, 100);

        let err = engine
            .commit_record(id, &decoded("f", "way too big"), RecordFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
        assert!(engine.fetch_records(id).unwrap().is_empty());
        assert_eq!(
            engine.fetch_value(id, MetricKind::DroppedRecords).unwrap(),
            MetricValue::U64(1)
        );
        assert_eq!(engine.budget_summary().dropped_records, 1);
    }

    #[test]
    fn eviction_removes_globally_oldest_first() {
        let (engine, probe) = engine_with_budget(2_000);
        let a = attach_active(&engine, &probe, 100);
        let b = attach_active(&engine, &probe, 200);

        // Fill from instance a, then push from b until a's oldest goes.
        for i in 0..4 {
            engine
                .commit_record(a, &decoded("fa", &format!("a{i}")), RecordFlags::NONE)
                .unwrap();
        }
        let before = engine.fetch_records(a).unwrap().len();
        loop {
            engine
                .commit_record(b, &decoded("fb", "bbbb"), RecordFlags::NONE)
                .unwrap();
            if engine.fetch_records(a).unwrap().len() < before {
                break;
            }
        }

        // The evicted record was a's first (smallest global seq).
        let remaining = engine.fetch_records(a).unwrap();
        assert!(remaining.iter().all(|r| r.command != "a0"));
        assert!(engine.budget_summary().evicted_records >= 1);
        assert!(engine.budget_summary().retained_bytes <= 2_000);
    }

    #[test]
    fn zero_ceiling_drops_every_record() {
        let (engine, probe) = engine_with_budget(0);
        let id = attach_active(&engine, &probe, 100);

        for _ in 0..3 {
            let err = engine
                .commit_record(id, &decoded("f", "x"), RecordFlags::NONE)
                .unwrap_err();
            assert!(matches!(err, Error::BudgetExceeded { .. }));
        }
        assert_eq!(engine.budget_summary().retained_bytes, 0);
        assert_eq!(engine.budget_summary().dropped_records, 3);
        assert!(engine.fetch_records(id).unwrap().is_empty());
    }

    #[test]
    fn records_for_inactive_instances_are_silently_dropped() {
        let (engine, probe) = engine_with_budget(1 << 20);
        probe.set_running(100, 100);
        let id = {
            let mut state = engine.lock_state();
            let id = state.registry.register(100, 1, false, Some(100)).unwrap();
            state.stores.insert(id, EventStore::new());
            id
        };

        // Still Pending: no handshake yet.
        engine
            .commit_record(id, &decoded("f", "x"), RecordFlags::NONE)
            .unwrap();
        assert!(engine.fetch_records(id).unwrap().is_empty());
    }

    // ---- access gate ----

    #[test]
    fn restricted_instance_refuses_admin_store() {
        let (engine, probe) = engine_with_budget(1 << 20);
        probe.set_running(100, 100);
        let id = {
            let mut state = engine.lock_state();
            let id = state.registry.register(100, 1, true, Some(100)).unwrap();
            state.stores.insert(id, EventStore::new());
            id
        };
        engine
            .activate(id, &Handshake { version: 1, script: None })
            .unwrap();

        let err = engine.store_admin(id, &decoded("f", "x")).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        // The instance's own path is unaffected.
        engine
            .commit_record(id, &decoded("f", "x"), RecordFlags::NONE)
            .unwrap();
        assert_eq!(engine.fetch_records(id).unwrap().len(), 1);
    }

    #[test]
    fn unrestricted_instance_accepts_admin_store() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);
        engine.store_admin(id, &decoded("f", "x")).unwrap();
        assert_eq!(engine.fetch_records(id).unwrap().len(), 1);
    }

    // ---- fetch_value ----

    #[test]
    fn fetch_value_covers_identity_and_flow() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 4321);
        engine
            .commit_record(id, &decoded("work", "sleep 1"), RecordFlags::NONE)
            .unwrap();

        assert_eq!(
            engine.fetch_value(id, MetricKind::Pid).unwrap(),
            MetricValue::U32(4321)
        );
        assert_eq!(
            engine.fetch_value(id, MetricKind::Version).unwrap(),
            MetricValue::U64(1)
        );
        assert_eq!(
            engine.fetch_value(id, MetricKind::Script).unwrap(),
            MetricValue::Text("/opt/job.sh".to_string())
        );
        assert_eq!(
            engine.fetch_value(id, MetricKind::RecordCount).unwrap(),
            MetricValue::U64(1)
        );
        assert_eq!(
            engine.fetch_value(id, MetricKind::LatestFunction).unwrap(),
            MetricValue::Text("work".to_string())
        );
        assert_eq!(
            engine.fetch_value(id, MetricKind::LatestCommand).unwrap(),
            MetricValue::Text("sleep 1".to_string())
        );
    }

    #[test]
    fn fetch_value_unknown_instance_errors() {
        let (engine, _probe) = engine_with_budget(1 << 20);
        assert!(matches!(
            engine.fetch_value(99, MetricKind::Pid),
            Err(Error::NoSuchInstance(99))
        ));
    }

    #[test]
    fn empty_store_yields_none_for_latest_metrics() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);
        assert_eq!(
            engine.fetch_value(id, MetricKind::LatestCommand).unwrap(),
            MetricValue::None
        );
    }

    // ---- refresh lifecycle ----

    #[tokio::test]
    async fn refresh_reclaims_after_one_grace_pass() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);
        engine
            .commit_record(id, &decoded("f", "x"), RecordFlags::NONE)
            .unwrap();
        let retained = engine.budget_summary().retained_bytes;
        assert!(retained > 0);

        probe.kill(100);

        let first = engine.refresh().await;
        assert_eq!(first.newly_exited, vec![id]);
        assert_eq!(engine.instance_state(id), Some(InstanceState::Exited));
        // Grace period: still enumerable, records still fetchable.
        assert_eq!(engine.snapshot().len(), 1);
        assert_eq!(engine.fetch_records(id).unwrap().len(), 1);

        let second = engine.refresh().await;
        assert_eq!(second.reclaimed, vec![id]);
        assert!(engine.snapshot().is_empty());
        assert_eq!(engine.budget_summary().retained_bytes, 0);
        assert!(matches!(
            engine.fetch_records(id),
            Err(Error::NoSuchInstance(_))
        ));
    }

    #[tokio::test]
    async fn refresh_detects_pid_reuse() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);

        probe.set_running(100, 999_999); // unrelated newcomer on the same pid
        let report = engine.refresh().await;
        assert_eq!(report.pid_reused, vec![100]);
        assert_eq!(engine.instance_state(id), Some(InstanceState::Exited));
    }

    #[tokio::test]
    async fn reused_pid_becomes_a_fresh_instance_not_a_merge() {
        let (engine, probe) = engine_with_budget(1 << 20);
        let id = attach_active(&engine, &probe, 100);
        engine
            .commit_record(id, &decoded("old", "old work"), RecordFlags::NONE)
            .unwrap();

        probe.set_running(100, 999_999);
        engine.refresh().await; // marks Exited
        engine.refresh().await; // reclaims

        // Same pid, different process: a brand-new instance with nothing
        // carried over from the old one.
        let fresh = {
            let mut state = engine.lock_state();
            let fresh = state.registry.register(100, 1, false, Some(999_999)).unwrap();
            state.stores.insert(fresh, EventStore::new());
            fresh
        };
        assert!(engine.fetch_records(fresh).unwrap().is_empty());
        assert_eq!(
            engine.fetch_value(fresh, MetricKind::Version).unwrap(),
            MetricValue::None
        );
    }

    #[tokio::test]
    async fn quiet_refresh_changes_nothing() {
        let (engine, probe) = engine_with_budget(1 << 20);
        attach_active(&engine, &probe, 100);
        let report = engine.refresh().await;
        assert!(report.is_quiet());
        assert_eq!(engine.snapshot().len(), 1);
    }

    #[test]
    fn is_attached_follows_the_pid_map() {
        let (engine, probe) = engine_with_budget(1 << 20);
        assert!(!engine.is_attached(100));
        let id = attach_active(&engine, &probe, 100);
        assert!(engine.is_attached(100));
        engine.discard(id);
        assert!(!engine.is_attached(100));
    }

    /// Liveness checks stalled on a slow pid while records keep arriving.
    struct SlowProbe {
        entered: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
    }

    impl LivenessProbe for SlowProbe {
        fn probe(&self, _pid: u32) -> Liveness {
            self.entered.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Liveness::Alive { start_time: 100 }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingestion_commits_while_liveness_checks_run() {
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let probe = Arc::new(SlowProbe {
            entered: entered.clone(),
            release: release.clone(),
        });
        let config = EngineConfig {
            max_memory_bytes: 1 << 20,
            restricted_default: false,
        };
        let engine = Arc::new(TraceEngine::new(config, probe));

        let id = {
            let mut state = engine.lock_state();
            let id = state.registry.register(100, 1, false, Some(100)).unwrap();
            state.stores.insert(id, EventStore::new());
            state.stops.insert(id, Arc::new(AtomicBool::new(false)));
            id
        };
        engine
            .activate(id, &Handshake { version: 1, script: None })
            .unwrap();

        let refresh_engine = engine.clone();
        let refresh = tokio::spawn(async move { refresh_engine.refresh().await });
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // The pass is stalled inside the probe; a commit must not queue
        // behind it.
        let commit_engine = engine.clone();
        let committed = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            tokio::task::spawn_blocking(move || {
                commit_engine.commit_record(id, &decoded("f", "x"), RecordFlags::NONE)
            }),
        )
        .await
        .expect("commit stalled behind a liveness check")
        .unwrap();
        committed.unwrap();

        release.store(true, Ordering::SeqCst);
        let report = refresh.await.unwrap();
        assert!(report.is_quiet());
        assert_eq!(engine.fetch_records(id).unwrap().len(), 1);
    }
}
