use domain::common::error::DomainError;
use ebpf_common::policy::{PolicyEntryWire, PolicyKeyWire};

/// Secondary port for the kernel endpoint policy map (a BPF LPM trie map).
///
/// The reconciler owns the map handle exclusively; all mutation of the
/// realized policy goes through this port.
///
/// Implemented by `PolicyMapManager` in the adapter layer.
pub trait PolicyMapPort: Send + Sync {
    /// Insert or overwrite one policy entry.
    fn upsert(&mut self, key: &PolicyKeyWire, entry: &PolicyEntryWire) -> Result<(), DomainError>;

    /// Delete one policy entry.
    ///
    /// An absent key is not an error: incremental deletes race with full
    /// policy computations, and entries may have been removed externally.
    fn delete(&mut self, key: &PolicyKeyWire) -> Result<(), DomainError>;

    /// Dump every entry through `cb`.
    fn dump(
        &mut self,
        cb: &mut dyn FnMut(PolicyKeyWire, PolicyEntryWire),
    ) -> Result<(), DomainError>;

    /// Close the map handle and open it again, e.g. after a failed dump.
    fn reopen(&mut self) -> Result<(), DomainError>;

    /// Capacity of the kernel map, for pressure reporting.
    fn max_entries(&self) -> u32;
}
