use std::io::ErrorKind;
use std::path::PathBuf;

use aya::Ebpf;
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Map, MapData, MapError};
use domain::common::error::DomainError;
use ebpf_common::policy::{MAX_POLICY_ENTRIES, PolicyEntryWire, PolicyKeyWire};
use ports::secondary::policy_map_port::PolicyMapPort;
use tracing::info;

/// Bits of the LPM key occupied by the identity, which the datapath matches
/// exactly (it always carries a full prefix).
const IDENTITY_BITS: u32 = 32;

/// Manages one endpoint's kernel policy map.
///
/// The map is a BPF LPM trie keyed by
/// `identity || direction || protocol || dest_port`, the identity occupying
/// the static (always fully matched) front of the prefix. The handle is
/// owned exclusively by the reconciler; `reopen` recovers it from the pin
/// path after a failed dump.
pub struct PolicyMapManager {
    map: LpmTrie<MapData, [u8; 8], PolicyEntryWire>,
    pin_path: PathBuf,
}

impl PolicyMapManager {
    /// Take ownership of the `ENDPOINT_POLICY` map from the loaded eBPF
    /// program. `pin_path` is where the loader pinned the map.
    pub fn new(ebpf: &mut Ebpf, pin_path: PathBuf) -> Result<Self, anyhow::Error> {
        let map = LpmTrie::try_from(
            ebpf.take_map("ENDPOINT_POLICY")
                .ok_or_else(|| anyhow::anyhow!("map 'ENDPOINT_POLICY' not found"))?,
        )?;
        info!(pin = %pin_path.display(), "endpoint policy map acquired");
        Ok(Self { map, pin_path })
    }

    /// Open the map from its pin path, without a loaded program.
    pub fn from_pin(pin_path: PathBuf) -> Result<Self, anyhow::Error> {
        let data = MapData::from_pin(&pin_path)?;
        let map = LpmTrie::try_from(Map::LpmTrie(data))?;
        Ok(Self { map, pin_path })
    }

    fn lpm_key(wire: &PolicyKeyWire) -> Key<[u8; 8]> {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&wire.identity.to_be_bytes());
        data[4] = wire.direction;
        data[5] = wire.protocol;
        // Already network byte order.
        data[6..8].copy_from_slice(&wire.dest_port.to_ne_bytes());
        Key::new(IDENTITY_BITS + wire.prefix_len, data)
    }

    fn wire_key(key: &Key<[u8; 8]>) -> PolicyKeyWire {
        let data = key.data();
        PolicyKeyWire {
            prefix_len: key.prefix_len().saturating_sub(IDENTITY_BITS),
            identity: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            dest_port: u16::from_ne_bytes([data[6], data[7]]),
            protocol: data[5],
            direction: data[4],
        }
    }
}

impl PolicyMapPort for PolicyMapManager {
    fn upsert(&mut self, key: &PolicyKeyWire, entry: &PolicyEntryWire) -> Result<(), DomainError> {
        self.map
            .insert(&Self::lpm_key(key), entry, 0)
            .map_err(|e| DomainError::MapError(format!("policy map insert failed: {e}")))
    }

    fn delete(&mut self, key: &PolicyKeyWire) -> Result<(), DomainError> {
        // Absent keys are tolerated: incremental deletes race with full
        // policy computations, and the entry may have been removed
        // externally.
        match self.map.remove(&Self::lpm_key(key)) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(MapError::SyscallError(err)) if err.io_error.kind() == ErrorKind::NotFound => {
                Ok(())
            }
            Err(e) => Err(DomainError::MapError(format!(
                "policy map delete failed: {e}"
            ))),
        }
    }

    fn dump(
        &mut self,
        cb: &mut dyn FnMut(PolicyKeyWire, PolicyEntryWire),
    ) -> Result<(), DomainError> {
        for item in self.map.iter() {
            let (key, value) =
                item.map_err(|e| DomainError::MapError(format!("policy map dump failed: {e}")))?;
            cb(Self::wire_key(&key), value);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), DomainError> {
        let data = MapData::from_pin(&self.pin_path)
            .map_err(|e| DomainError::MapError(format!("reopening pinned policy map: {e}")))?;
        self.map = LpmTrie::try_from(Map::LpmTrie(data))
            .map_err(|e| DomainError::MapError(format!("pinned map is not an LPM trie: {e}")))?;
        info!(pin = %self.pin_path.display(), "endpoint policy map reopened");
        Ok(())
    }

    fn max_entries(&self) -> u32 {
        MAX_POLICY_ENTRIES
    }
}
