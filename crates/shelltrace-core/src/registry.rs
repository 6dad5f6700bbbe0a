//! Instance registry: the pid↔instance table and the enumeration exposed
//! to the collector.
//!
//! Ids are small dense integers, unique among non-reclaimed instances and
//! reused after reclamation (smallest free id first). All mutation goes
//! through the engine's single state lock; the registry itself is a plain
//! data structure.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{BASENAME_MAX, InstanceId, SCRIPT_MAX};

/// Lifecycle state of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Registered; version handshake not yet completed.
    Pending,
    /// Handshake succeeded; ingestion running.
    Active,
    /// Underlying process observed gone; enumerable for one more refresh.
    Exited,
    /// Removed from the registry; the id is free for reuse.
    Reclaimed,
}

/// One tracked traced process.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Dense id, reused after reclamation.
    pub id: InstanceId,
    /// Process id supplied at registration.
    pub pid: u32,
    /// Parent process id supplied at registration.
    pub parent_pid: u32,
    /// Stable ordering key for domain enumeration.
    pub queue_position: u64,
    /// Negotiated protocol version. Only ever set after validation.
    pub version: Option<u64>,
    /// Capability flag fixed at registration; governs the access gate.
    pub restricted: bool,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Kernel start time recorded for pid-reuse detection.
    pub start_time: Option<u64>,
    /// When liveness was last polled, unix milliseconds.
    pub last_liveness_check_ms: Option<u64>,
    /// Short label derived from the pid, bounded length.
    pub basename: String,
    /// Producer-declared script path, bounded length.
    pub script_path: String,
}

/// Owns the pid↔instance mapping and id allocation.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: BTreeMap<InstanceId, Instance>,
    by_pid: HashMap<u32, InstanceId>,
    next_queue_position: u64,
}

impl InstanceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly attached process as a Pending instance.
    ///
    /// Fails with [`Error::DuplicatePid`] if the pid already maps to a
    /// non-reclaimed instance. Assigns the smallest free id.
    pub fn register(
        &mut self,
        pid: u32,
        parent_pid: u32,
        restricted: bool,
        start_time: Option<u64>,
    ) -> Result<InstanceId> {
        if self.by_pid.contains_key(&pid) {
            return Err(Error::DuplicatePid(pid));
        }

        let id = self.smallest_free_id();
        let queue_position = self.next_queue_position;
        self.next_queue_position += 1;

        let mut basename = pid.to_string();
        basename.truncate(BASENAME_MAX);

        self.instances.insert(
            id,
            Instance {
                id,
                pid,
                parent_pid,
                queue_position,
                version: None,
                restricted,
                state: InstanceState::Pending,
                start_time,
                last_liveness_check_ms: None,
                basename,
                script_path: String::new(),
            },
        );
        self.by_pid.insert(pid, id);
        Ok(id)
    }

    /// Look up an instance by pid.
    #[must_use]
    pub fn lookup(&self, pid: u32) -> Option<&Instance> {
        self.by_pid.get(&pid).and_then(|id| self.instances.get(id))
    }

    /// Get an instance by id.
    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    /// Get a mutable instance by id.
    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    /// Complete the handshake: record the validated version (and script)
    /// and move the instance from Pending to Active.
    ///
    /// Only Pending instances are eligible. A late handshake for an
    /// instance the lifecycle monitor already marked Exited must not
    /// resurrect it mid-grace.
    pub fn activate(&mut self, id: InstanceId, version: u64, script: Option<&str>) -> Result<()> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(Error::NoSuchInstance(id))?;
        if instance.state != InstanceState::Pending {
            return Err(Error::NotPending(id));
        }
        instance.version = Some(version);
        instance.state = InstanceState::Active;
        if let Some(path) = script {
            instance.script_path = path.chars().take(SCRIPT_MAX).collect();
        }
        Ok(())
    }

    /// Drop an instance entirely (failed handshake: no entry persists).
    pub fn discard(&mut self, id: InstanceId) -> Option<Instance> {
        let instance = self.instances.remove(&id)?;
        self.by_pid.remove(&instance.pid);
        Some(instance)
    }

    /// Reclaim an Exited instance, freeing its id and pid slot.
    pub fn reclaim(&mut self, id: InstanceId) -> Result<Instance> {
        let exited = self
            .instances
            .get(&id)
            .is_some_and(|i| i.state == InstanceState::Exited);
        if !exited {
            return Err(Error::NoSuchInstance(id));
        }
        let mut instance = self
            .instances
            .remove(&id)
            .ok_or(Error::NoSuchInstance(id))?;
        self.by_pid.remove(&instance.pid);
        instance.state = InstanceState::Reclaimed;
        Ok(instance)
    }

    /// The instance-domain view handed to the collector: all non-reclaimed
    /// instances as `(id, basename)`, ordered by queue position.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(InstanceId, String)> {
        let mut entries: Vec<&Instance> = self.instances.values().collect();
        entries.sort_by_key(|i| i.queue_position);
        entries
            .into_iter()
            .map(|i| (i.id, i.basename.clone()))
            .collect()
    }

    /// Ids of instances whose liveness must be polled (Pending or Active).
    #[must_use]
    pub fn pollable_ids(&self) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| matches!(i.state, InstanceState::Pending | InstanceState::Active))
            .map(|i| i.id)
            .collect()
    }

    /// Ids of instances currently in the Exited grace period.
    #[must_use]
    pub fn exited_ids(&self) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.state == InstanceState::Exited)
            .map(|i| i.id)
            .collect()
    }

    /// Number of non-reclaimed instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instances are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn smallest_free_id(&self) -> InstanceId {
        let mut candidate: InstanceId = 0;
        for &id in self.instances.keys() {
            if id == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        candidate
    }
}
