#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::common::entity::{Identity, OwnerId, Protocol, TrafficDirection};
use domain::policy::changes::ChangeState;
use domain::policy::engine::PolicyFeatures;
use domain::policy::entry::{AuthType, HasAuthType, InternalEntry, MapStateEntry};
use domain::policy::key::Key;
use domain::policy::mapstate::MapState;

// Fuzz the precedence engine with random insert/delete sequences.
//
// Layout: consumed in 6-byte chunks, one operation each:
//   [0] = operation selector
//   [1] = direction + identity
//   [2] = protocol selector
//   [3..5] = destination port
//   [5] = port prefix length
//
// After every operation the trie/map consistency, redirect normalization,
// owner, and deny-shadowing invariants must hold. At the end the whole
// batch is reverted, which must restore the initial empty state.
fuzz_target!(|data: &[u8]| {
    let mut ms = MapState::new();
    let mut changes = ChangeState::new();

    for chunk in data.chunks_exact(6) {
        let direction = if chunk[1] & 0x80 != 0 {
            TrafficDirection::Egress
        } else {
            TrafficDirection::Ingress
        };
        let identity = Identity(u32::from(chunk[1] & 0x07));
        let protocol = match chunk[2] % 3 {
            0 => Protocol::Any,
            1 => Protocol::Tcp,
            _ => Protocol::Udp,
        };
        let port = u16::from_be_bytes([chunk[3], chunk[4]]);
        let prefix = chunk[5] % 17;
        let key = Key::for_direction(direction)
            .with_identity(identity)
            .with_port_prefix(protocol, port, prefix);

        match chunk[0] % 6 {
            0 => {
                let entry =
                    InternalEntry::new(Some(OwnerId(1)), vec![], MapStateEntry::allow(), 0);
                ms.insert_with_changes(key, entry, PolicyFeatures::ALL, &mut changes);
            }
            1 => {
                let entry =
                    InternalEntry::new(Some(OwnerId(2)), vec![], MapStateEntry::deny(), 0);
                ms.insert_with_changes(key, entry, PolicyFeatures::ALL, &mut changes);
            }
            2 => {
                let entry = InternalEntry::new(
                    Some(OwnerId(3)),
                    vec![],
                    MapStateEntry::allow().with_redirect(8080, "listener"),
                    u16::from(chunk[2]),
                );
                ms.insert_with_changes(key, entry, PolicyFeatures::ALL, &mut changes);
            }
            3 => {
                let entry = InternalEntry::new(
                    Some(OwnerId(4)),
                    vec![],
                    MapStateEntry::allow().with_auth(HasAuthType::Explicit, AuthType::Spire),
                    0,
                );
                ms.insert_with_changes(key, entry, PolicyFeatures::ALL, &mut changes);
            }
            4 => {
                let owner = Some(OwnerId(u64::from(chunk[2] % 5)));
                ms.delete_key_with_changes(&key, owner, &mut changes);
            }
            _ => {
                ms.delete_key_with_changes(&key, None, &mut changes);
            }
        }

        if let Err(violation) = ms.check_invariants() {
            panic!("invariant violated after operation: {violation}");
        }
    }

    // The batch started from an empty state; undoing it must end there.
    ms.revert_changes(&changes);
    if let Err(violation) = ms.check_invariants() {
        panic!("invariant violated after revert: {violation}");
    }
    assert!(ms.is_empty(), "revert did not restore the empty state");
});
