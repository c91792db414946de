use ebpf_common::policy::{
    FULL_PREFIX_LEN, PORT_PREFIX_BITS, PROTOCOL_PREFIX_BITS, PolicyKeyWire, STATIC_PREFIX_BITS,
};
use serde::{Deserialize, Serialize};

use crate::common::entity::{Identity, Protocol, TrafficDirection};
use crate::common::error::DomainError;

/// Policy map key: traffic direction, peer identity, protocol, and a
/// destination-port prefix.
///
/// The direction octet is always significant. Protocol and port take part in
/// longest-prefix matching: a key with wildcard protocol (0) carries no
/// protocol or port bits and therefore covers every protocol; a key with a
/// protocol but wildcard port (0) covers every port of that protocol; a port
/// prefix shorter than 16 bits expresses a power-of-two aligned port range.
///
/// The identity is matched exactly and is not part of the LPM prefix;
/// identity 0 is the wildcard matching any peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Key {
    direction: TrafficDirection,
    identity: Identity,
    protocol: u8,
    dest_port: u16,
    port_prefix_len: u8,
}

impl Key {
    /// All-traffic ingress key: wildcard identity, protocol, and port.
    pub fn ingress() -> Self {
        Self::for_direction(TrafficDirection::Ingress)
    }

    /// All-traffic egress key: wildcard identity, protocol, and port.
    pub fn egress() -> Self {
        Self::for_direction(TrafficDirection::Egress)
    }

    pub fn for_direction(direction: TrafficDirection) -> Self {
        Self {
            direction,
            identity: Identity::ANY,
            protocol: 0,
            dest_port: 0,
            port_prefix_len: 0,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Set protocol and an exact destination port. A zero port wildcards the
    /// port (no port bits in the prefix).
    pub fn with_port_proto(self, protocol: Protocol, dest_port: u16) -> Self {
        let prefix = if dest_port == 0 {
            0
        } else {
            PORT_PREFIX_BITS as u8
        };
        self.with_port_prefix(protocol, dest_port, prefix)
    }

    /// Set protocol and a destination-port prefix of `port_prefix_len`
    /// significant bits. The port is masked to the prefix. The resulting key
    /// is not validated here; `validate` rejects inconsistent combinations
    /// before they reach the map.
    pub fn with_port_prefix(mut self, protocol: Protocol, dest_port: u16, port_prefix_len: u8) -> Self {
        self.protocol = protocol.to_u8();
        self.port_prefix_len = port_prefix_len.min(PORT_PREFIX_BITS as u8);
        self.dest_port = dest_port & port_mask(self.port_prefix_len);
        self
    }

    pub fn direction(&self) -> TrafficDirection {
        self.direction
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Raw IANA protocol number; 0 is the wildcard.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Destination port in host byte order, masked to the port prefix.
    pub fn dest_port(&self) -> u16 {
        self.dest_port
    }

    /// Number of significant destination-port bits (0..=16).
    pub fn port_prefix_len(&self) -> u8 {
        self.port_prefix_len
    }

    /// Total prefix length for LPM ordering: the direction octet plus, for
    /// keys with a specific protocol, the protocol octet and the significant
    /// port bits. Wildcard-protocol keys carry only the direction bits so
    /// that they cover every protocol and port.
    pub fn prefix_length(&self) -> u32 {
        let mut len = STATIC_PREFIX_BITS;
        if self.protocol != 0 {
            len += PROTOCOL_PREFIX_BITS + u32::from(self.port_prefix_len);
        }
        len
    }

    /// The key's `direction || protocol || dest_port` bits as one word,
    /// masked to `prefix_length` significant bits, most significant first.
    pub fn lpm_bits(&self) -> u32 {
        let bits = (u32::from(self.direction.to_u8()) << 24)
            | (u32::from(self.protocol) << 16)
            | u32::from(self.dest_port);
        bits & word_mask(self.prefix_length())
    }

    /// `true` if both keys select the same protocol and port prefix
    /// (identity and direction are not compared).
    pub fn port_proto_is_equal(&self, other: &Key) -> bool {
        self.protocol == other.protocol
            && self.dest_port == other.dest_port
            && self.port_prefix_len == other.port_prefix_len
    }

    /// Check the structural invariants: a wildcard port carries no prefix
    /// bits, and a specific port requires a specific protocol.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.dest_port == 0 && self.port_prefix_len > 0 {
            return Err(DomainError::InvalidKey(format!(
                "wildcard port with non-zero prefix length {}",
                self.port_prefix_len
            )));
        }
        if self.dest_port != 0 && self.protocol == 0 {
            return Err(DomainError::InvalidKey(format!(
                "port {} with wildcard protocol",
                self.dest_port
            )));
        }
        Ok(())
    }

    /// Reconstruct a key (with wildcard identity) from trie coordinates:
    /// a prefix length and the masked `direction || protocol || dest_port`
    /// word.
    pub(crate) fn from_lpm_coords(prefix_len: u32, bits: u32) -> Self {
        let direction = TrafficDirection::from_u8((bits >> 24) as u8);
        let mut key = Self::for_direction(direction);
        if prefix_len > STATIC_PREFIX_BITS {
            key.protocol = (bits >> 16) as u8;
            key.port_prefix_len = (prefix_len - STATIC_PREFIX_BITS - PROTOCOL_PREFIX_BITS) as u8;
            key.dest_port = bits as u16;
        }
        key
    }

    /// Convert to the kernel map representation.
    pub fn to_wire(&self) -> PolicyKeyWire {
        PolicyKeyWire {
            prefix_len: self.prefix_length(),
            identity: self.identity.0,
            dest_port: self.dest_port.to_be(),
            protocol: self.protocol,
            direction: self.direction.to_u8(),
        }
    }

    /// Convert from the kernel map representation.
    pub fn from_wire(wire: &PolicyKeyWire) -> Self {
        Self {
            direction: TrafficDirection::from_u8(wire.direction),
            identity: Identity(wire.identity),
            protocol: wire.protocol,
            dest_port: wire.dest_port_host(),
            port_prefix_len: wire.port_prefix_len(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}:{}/{}",
            self.direction,
            self.identity,
            Protocol::from_u8(self.protocol),
            self.dest_port,
            self.port_prefix_len
        )
    }
}

/// Host-order mask selecting the `prefix_len` most significant port bits.
fn port_mask(prefix_len: u8) -> u16 {
    if prefix_len == 0 {
        0
    } else if u32::from(prefix_len) >= PORT_PREFIX_BITS {
        u16::MAX
    } else {
        u16::MAX << (PORT_PREFIX_BITS as u8 - prefix_len)
    }
}

/// Mask selecting the `prefix_len` most significant bits of the LPM word.
fn word_mask(prefix_len: u32) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= FULL_PREFIX_LEN {
        u32::MAX
    } else {
        u32::MAX << (FULL_PREFIX_LEN - prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_traffic_key_has_direction_bits_only() {
        let key = Key::ingress();
        assert_eq!(key.prefix_length(), STATIC_PREFIX_BITS);
        assert_eq!(key.lpm_bits(), 0);

        let key = Key::egress();
        assert_eq!(key.prefix_length(), STATIC_PREFIX_BITS);
        assert_eq!(key.lpm_bits(), 1 << 24);
    }

    #[test]
    fn l3_only_key_has_protocol_bits() {
        // Protocol set, port wildcarded: direction + protocol octets.
        let key = Key::ingress().with_port_proto(Protocol::Tcp, 0);
        assert_eq!(key.prefix_length(), STATIC_PREFIX_BITS + PROTOCOL_PREFIX_BITS);
        assert_eq!(key.lpm_bits(), 6 << 16);
    }

    #[test]
    fn l4_key_has_full_prefix() {
        let key = Key::ingress()
            .with_identity(Identity(10))
            .with_port_proto(Protocol::Tcp, 80);
        assert_eq!(key.prefix_length(), FULL_PREFIX_LEN);
        assert_eq!(key.dest_port(), 80);
        assert_eq!(key.lpm_bits(), (6 << 16) | 80);
    }

    #[test]
    fn port_range_key_masks_the_port() {
        // 14 significant bits: ports 1024..=1027 share the masked base.
        let key = Key::egress().with_port_prefix(Protocol::Udp, 1026, 14);
        assert_eq!(key.dest_port(), 1024);
        assert_eq!(key.port_prefix_len(), 14);
        assert_eq!(
            key.prefix_length(),
            STATIC_PREFIX_BITS + PROTOCOL_PREFIX_BITS + 14
        );
    }

    #[test]
    fn wildcard_protocol_covers_specific_protocol() {
        let broad = Key::ingress();
        let narrow = Key::ingress().with_port_proto(Protocol::Tcp, 80);
        let broad_len = broad.prefix_length();
        assert!(broad_len < narrow.prefix_length());
        // The narrow key's bits agree with the broad key's on its prefix.
        assert_eq!(narrow.lpm_bits() & word_mask(broad_len), broad.lpm_bits());
    }

    #[test]
    fn validate_rejects_wildcard_port_with_prefix() {
        let key = Key::ingress().with_port_prefix(Protocol::Tcp, 0, 8);
        assert!(key.validate().is_err());
    }

    #[test]
    fn validate_rejects_port_without_protocol() {
        let key = Key::ingress().with_port_proto(Protocol::Any, 443);
        assert!(key.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_keys() {
        assert!(Key::ingress().validate().is_ok());
        assert!(
            Key::egress()
                .with_port_proto(Protocol::Tcp, 443)
                .validate()
                .is_ok()
        );
        assert!(
            Key::ingress()
                .with_port_proto(Protocol::Udp, 0)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn port_proto_equality_ignores_identity_and_direction() {
        let a = Key::ingress()
            .with_identity(Identity(10))
            .with_port_proto(Protocol::Tcp, 80);
        let b = Key::egress()
            .with_identity(Identity(20))
            .with_port_proto(Protocol::Tcp, 80);
        assert!(a.port_proto_is_equal(&b));

        let c = Key::ingress().with_port_proto(Protocol::Tcp, 81);
        assert!(!a.port_proto_is_equal(&c));
    }

    #[test]
    fn wire_roundtrip() {
        let key = Key::egress()
            .with_identity(Identity(4321))
            .with_port_prefix(Protocol::Udp, 8192, 12);
        let wire = key.to_wire();
        assert_eq!(wire.identity, 4321);
        assert_eq!(wire.direction, 1);
        assert_eq!(wire.dest_port_host(), 8192);
        assert_eq!(Key::from_wire(&wire), key);
    }

    #[test]
    fn display_is_compact() {
        let key = Key::ingress()
            .with_identity(Identity(10))
            .with_port_proto(Protocol::Tcp, 80);
        assert_eq!(key.to_string(), "ingress:10/TCP:80/16");
    }
}
