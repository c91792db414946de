use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use domain::common::error::DomainError;
use ebpf_common::policy::{MAX_POLICY_ENTRIES, PolicyEntryWire, PolicyKeyWire};

use crate::secondary::metrics_port::PolicyMetrics;
use crate::secondary::policy_map_port::PolicyMapPort;
use crate::secondary::proxy_port::ProxyPort;

/// No-op implementation of the metrics port for use in tests.
pub struct NoopMetrics;

impl PolicyMetrics for NoopMetrics {}

/// One kernel map operation, recorded in call order so tests can assert
/// ordering guarantees (writes before deletes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp {
    Upsert(PolicyKeyWire),
    Delete(PolicyKeyWire),
}

/// In-memory stand-in for the kernel policy map.
#[derive(Default)]
pub struct FakePolicyMap {
    pub entries: HashMap<PolicyKeyWire, PolicyEntryWire>,
    /// All operations in call order.
    pub ops: Vec<MapOp>,
    /// Fail this many upcoming dumps before succeeding again.
    pub fail_dumps: usize,
    /// Fail every write/delete when set.
    pub fail_writes: bool,
    /// Number of `reopen` calls observed.
    pub reopened: usize,
}

impl FakePolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all recorded upserts, in order.
    pub fn upserts(&self) -> Vec<PolicyKeyWire> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MapOp::Upsert(k) => Some(*k),
                MapOp::Delete(_) => None,
            })
            .collect()
    }

    /// Index of the first delete operation, if any.
    pub fn first_delete_index(&self) -> Option<usize> {
        self.ops
            .iter()
            .position(|op| matches!(op, MapOp::Delete(_)))
    }

    /// Index of the last upsert operation, if any.
    pub fn last_upsert_index(&self) -> Option<usize> {
        self.ops
            .iter()
            .rposition(|op| matches!(op, MapOp::Upsert(_)))
    }
}

impl PolicyMapPort for FakePolicyMap {
    fn upsert(&mut self, key: &PolicyKeyWire, entry: &PolicyEntryWire) -> Result<(), DomainError> {
        if self.fail_writes {
            return Err(DomainError::MapError("injected write failure".into()));
        }
        self.entries.insert(*key, *entry);
        self.ops.push(MapOp::Upsert(*key));
        Ok(())
    }

    fn delete(&mut self, key: &PolicyKeyWire) -> Result<(), DomainError> {
        if self.fail_writes {
            return Err(DomainError::MapError("injected delete failure".into()));
        }
        // Absent keys are tolerated, mirroring the real map's ENOENT
        // handling.
        self.entries.remove(key);
        self.ops.push(MapOp::Delete(*key));
        Ok(())
    }

    fn dump(
        &mut self,
        cb: &mut dyn FnMut(PolicyKeyWire, PolicyEntryWire),
    ) -> Result<(), DomainError> {
        if self.fail_dumps > 0 {
            self.fail_dumps -= 1;
            return Err(DomainError::MapError("injected dump failure".into()));
        }
        for (k, v) in &self.entries {
            cb(*k, *v);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), DomainError> {
        self.reopened += 1;
        Ok(())
    }

    fn max_entries(&self) -> u32 {
        MAX_POLICY_ENTRIES
    }
}

/// Clonable handle around a [`FakePolicyMap`] so a test can keep inspecting
/// the map after boxing it into a service.
#[derive(Clone, Default)]
pub struct SharedPolicyMap(Arc<Mutex<FakePolicyMap>>);

impl SharedPolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakePolicyMap> {
        self.0.lock().expect("fake policy map lock poisoned")
    }
}

impl PolicyMapPort for SharedPolicyMap {
    fn upsert(&mut self, key: &PolicyKeyWire, entry: &PolicyEntryWire) -> Result<(), DomainError> {
        self.lock().upsert(key, entry)
    }

    fn delete(&mut self, key: &PolicyKeyWire) -> Result<(), DomainError> {
        self.lock().delete(key)
    }

    fn dump(
        &mut self,
        cb: &mut dyn FnMut(PolicyKeyWire, PolicyEntryWire),
    ) -> Result<(), DomainError> {
        self.lock().dump(cb)
    }

    fn reopen(&mut self) -> Result<(), DomainError> {
        self.lock().reopen()
    }

    fn max_entries(&self) -> u32 {
        self.lock().max_entries()
    }
}

/// In-memory stand-in for the proxy controller. Ports are handed out
/// sequentially from the bottom of the standard range; listeners listed in
/// `pending` stay unallocated (allocate returns 0).
pub struct FakeProxy {
    next_port: u16,
    pub allocated: HashMap<String, u16>,
    pub pending: HashSet<String>,
    pub acked: Vec<String>,
    pub released: Vec<String>,
}

impl Default for FakeProxy {
    fn default() -> Self {
        Self {
            next_port: 10000,
            allocated: HashMap::new(),
            pending: HashSet::new(),
            acked: Vec::new(),
            released: Vec::new(),
        }
    }
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProxyPort for FakeProxy {
    fn allocate(&mut self, listener: &str, _ingress: bool) -> Result<u16, DomainError> {
        if self.pending.contains(listener) {
            return Ok(0);
        }
        if let Some(&port) = self.allocated.get(listener) {
            return Ok(port);
        }
        let port = self.next_port;
        self.next_port += 1;
        self.allocated.insert(listener.to_string(), port);
        Ok(port)
    }

    fn ack(&mut self, listener: &str) -> Result<(), DomainError> {
        self.acked.push(listener.to_string());
        Ok(())
    }

    fn release(&mut self, listener: &str) -> Result<(), DomainError> {
        self.released.push(listener.to_string());
        self.allocated.remove(listener);
        Ok(())
    }
}
