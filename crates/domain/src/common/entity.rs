use serde::{Deserialize, Serialize};

/// Numeric security identity assigned to a peer by the identity allocator.
///
/// Identity 0 is the wildcard sentinel: it matches any specific identity and
/// is broader than every specific identity at the same key prefix. It is a
/// concept used by the policy engine, never a real allocated identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Identity(pub u32);

impl Identity {
    /// The wildcard identity, matching any peer.
    pub const ANY: Identity = Identity(0);
    /// Reserved identity of the local host.
    pub const HOST: Identity = Identity(1);

    /// Returns `true` for the wildcard sentinel.
    pub fn is_any(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of traffic relative to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrafficDirection {
    Ingress,
    Egress,
}

impl TrafficDirection {
    /// Convert to the u8 value used in kernel map keys.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ingress => 0,
            Self::Egress => 1,
        }
    }

    /// Create from a raw direction octet. Unknown values map to ingress.
    pub fn from_u8(n: u8) -> Self {
        match n {
            1 => Self::Egress,
            _ => Self::Ingress,
        }
    }

    pub fn is_ingress(self) -> bool {
        self == Self::Ingress
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
    Other(u8),
}

impl Protocol {
    /// Convert to the u8 IP protocol number used in kernel map keys.
    /// Returns 0 for Any (wildcard).
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Any => 0,
            Self::Other(n) => n,
        }
    }

    /// Create from a raw protocol number.
    pub fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::Any,
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }

    /// Protocol name as used in proxy ID strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Any => "ANY",
            Self::Other(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric endpoint identifier, unique per node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EndpointId(pub u16);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Label identifying the policy rule an entry was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    /// Validate that the rule ID is non-empty and contains only
    /// alphanumeric characters, dashes, and underscores.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.0.is_empty() {
            return Err("rule ID must not be empty");
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err("rule ID must contain only alphanumeric, dashes, underscores");
        }
        Ok(())
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a rule selector that owns map entries.
///
/// The selector cache hands these out; the engine only compares them. An
/// entry created with no owner is sticky and survives incremental deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    // ── Identity tests ────────────────────────────────────────────

    #[test]
    fn identity_wildcard() {
        assert!(Identity::ANY.is_any());
        assert!(!Identity(42).is_any());
        assert!(!Identity::HOST.is_any());
    }

    #[test]
    fn identity_display() {
        assert_eq!(format!("{}", Identity(1234)), "1234");
    }

    // ── TrafficDirection tests ────────────────────────────────────

    #[test]
    fn direction_roundtrip() {
        assert_eq!(
            TrafficDirection::from_u8(TrafficDirection::Ingress.to_u8()),
            TrafficDirection::Ingress
        );
        assert_eq!(
            TrafficDirection::from_u8(TrafficDirection::Egress.to_u8()),
            TrafficDirection::Egress
        );
    }

    #[test]
    fn direction_as_str() {
        assert_eq!(TrafficDirection::Ingress.as_str(), "ingress");
        assert_eq!(TrafficDirection::Egress.as_str(), "egress");
    }

    // ── Protocol tests ────────────────────────────────────────────

    #[test]
    fn protocol_roundtrip() {
        assert_eq!(Protocol::from_u8(Protocol::Tcp.to_u8()), Protocol::Tcp);
        assert_eq!(Protocol::from_u8(Protocol::Udp.to_u8()), Protocol::Udp);
        assert_eq!(Protocol::from_u8(Protocol::Icmp.to_u8()), Protocol::Icmp);
        assert_eq!(Protocol::from_u8(Protocol::Any.to_u8()), Protocol::Any);
    }

    #[test]
    fn protocol_known_values() {
        assert_eq!(Protocol::Tcp.to_u8(), 6);
        assert_eq!(Protocol::Udp.to_u8(), 17);
        assert_eq!(Protocol::Icmp.to_u8(), 1);
        assert_eq!(Protocol::Any.to_u8(), 0);
    }

    #[test]
    fn protocol_other_roundtrip() {
        let proto = Protocol::Other(47); // GRE
        assert_eq!(proto.to_u8(), 47);
        assert_eq!(Protocol::from_u8(47), Protocol::Other(47));
    }

    // ── RuleId tests ──────────────────────────────────────────────

    #[test]
    fn rule_id_valid() {
        assert!(RuleId("allow-http".to_string()).validate().is_ok());
        assert!(RuleId("deny_all".to_string()).validate().is_ok());
    }

    #[test]
    fn rule_id_empty() {
        assert!(RuleId(String::new()).validate().is_err());
    }

    #[test]
    fn rule_id_special_chars() {
        assert!(RuleId("rule 1".to_string()).validate().is_err());
        assert!(RuleId("rule/1".to_string()).validate().is_err());
    }
}
