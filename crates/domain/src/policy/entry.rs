use std::collections::BTreeSet;

use ebpf_common::policy::{FLAG_DENY, FLAG_EXPLICIT_AUTH, PolicyEntryWire};
use serde::{Deserialize, Serialize};

use crate::common::entity::{OwnerId, RuleId};

/// Placeholder proxy port for a redirect whose listener exists but whose
/// proxy port has not been allocated yet. The largest port value is used
/// because it has the lowest priority in listener tie-breaking.
pub const UNREALIZED_REDIRECT_PORT: u16 = u16::MAX;

/// Authentication type required for allowed traffic. The numeric order is
/// the tie-break order: when two explicit auth types meet, the higher one
/// wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum AuthType {
    #[default]
    Disabled,
    Spire,
    AlwaysFail,
}

impl AuthType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Spire => 1,
            Self::AlwaysFail => 2,
        }
    }

    pub fn from_u8(n: u8) -> Self {
        match n {
            1 => Self::Spire,
            2 => Self::AlwaysFail,
            _ => Self::Disabled,
        }
    }
}

/// Whether the auth type was set explicitly by a rule or is derived from
/// more generic entries covering this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HasAuthType {
    #[default]
    Default,
    Explicit,
}

/// Datapath-visible policy entry associated with a [`super::key::Key`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapStateEntry {
    /// Listener name for proxy redirection, if any. Empty iff `proxy_port`
    /// is 0.
    pub listener: String,

    /// The proxy port, in host byte order. 0 means no proxy redirection;
    /// any other value redirects matching traffic to that local port.
    pub proxy_port: u16,

    /// True when matching traffic is denied.
    pub is_deny: bool,

    /// `Default` when no rule set the auth type explicitly; the value of
    /// `auth_type` is then derived from covering entries.
    pub has_auth_type: HasAuthType,

    /// Authentication required for the traffic to be allowed.
    pub auth_type: AuthType,
}

impl MapStateEntry {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn deny() -> Self {
        Self {
            is_deny: true,
            ..Self::default()
        }
    }

    pub fn with_redirect(mut self, proxy_port: u16, listener: &str) -> Self {
        self.proxy_port = proxy_port;
        self.listener = listener.to_string();
        self
    }

    pub fn with_auth(mut self, has: HasAuthType, auth: AuthType) -> Self {
        self.has_auth_type = has;
        self.auth_type = auth;
        self
    }

    /// True if the entry redirects to a proxy port.
    pub fn is_redirect(&self) -> bool {
        self.proxy_port != 0
    }

    /// Equality from the datapath's point of view: deny flag, proxy port,
    /// and auth type. Listener and auth provenance are agent-side detail.
    pub fn datapath_equal(&self, other: &MapStateEntry) -> bool {
        self.is_deny == other.is_deny
            && self.proxy_port == other.proxy_port
            && self.auth_type == other.auth_type
    }

    /// Convert to the kernel map representation.
    pub fn to_wire(&self) -> PolicyEntryWire {
        let mut flags = 0u8;
        if self.is_deny {
            flags |= FLAG_DENY;
        }
        if self.has_auth_type == HasAuthType::Explicit {
            flags |= FLAG_EXPLICIT_AUTH;
        }
        PolicyEntryWire {
            proxy_port: self.proxy_port.to_be(),
            flags,
            auth_type: self.auth_type.to_u8(),
            _padding: [0; 4],
        }
    }

    /// Convert from the kernel map representation. The listener name is not
    /// stored in the kernel and comes back empty.
    pub fn from_wire(wire: &PolicyEntryWire) -> Self {
        Self {
            listener: String::new(),
            proxy_port: wire.proxy_port_host(),
            is_deny: wire.is_deny(),
            has_auth_type: if wire.has_explicit_auth() {
                HasAuthType::Explicit
            } else {
                HasAuthType::Default
            },
            auth_type: AuthType::from_u8(wire.auth_type),
        }
    }
}

impl std::fmt::Display for MapStateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProxyPort={},Listener={},IsDeny={},AuthType={:?}",
            self.proxy_port, self.listener, self.is_deny, self.auth_type
        )
    }
}

/// Set of owner handles that require an entry to be present.
///
/// An entry created with no owner is sticky: it cannot be removed by
/// owner-driven incremental deletes, only overwritten or superseded by a
/// deny entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owners {
    ids: BTreeSet<OwnerId>,
    sticky: bool,
}

impl Owners {
    pub fn from_owner(owner: Option<OwnerId>) -> Self {
        match owner {
            Some(id) => Self {
                ids: BTreeSet::from([id]),
                sticky: false,
            },
            None => Self {
                ids: BTreeSet::new(),
                sticky: true,
            },
        }
    }

    pub fn contains(&self, owner: OwnerId) -> bool {
        self.ids.contains(&owner)
    }

    /// Remove an owner's contribution; returns `true` if it was present.
    pub fn remove(&mut self, owner: OwnerId) -> bool {
        self.ids.remove(&owner)
    }

    /// True when no owner requires this entry and it is not sticky.
    pub fn is_orphaned(&self) -> bool {
        self.ids.is_empty() && !self.sticky
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// The sole owner, if the set holds exactly one non-sticky owner.
    pub fn sole_owner(&self) -> Option<OwnerId> {
        if self.ids.len() == 1 {
            self.ids.iter().next().copied()
        } else {
            None
        }
    }

    pub fn merge(&mut self, other: &Owners) {
        self.ids.extend(other.ids.iter().copied());
        self.sticky |= other.sticky;
    }
}

/// Entry as kept in the map state, with the bookkeeping needed to merge
/// overlapping rules and to undo contributions of retired selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEntry {
    pub entry: MapStateEntry,

    /// Listener selection priority; lower wins. 0 when there is no
    /// redirect. Defaults to the proxy port so that numerically smaller
    /// proxy ports win ties.
    pub priority: u16,

    /// Rules this entry derives from, sorted.
    pub derived_from_rules: Vec<RuleId>,

    /// Owners that require this entry to be present.
    pub owners: Owners,
}

impl InternalEntry {
    /// Build an internal entry, normalizing the redirect fields: entries
    /// without a redirect carry no listener and no priority, and redirect
    /// entries without an explicit priority use the proxy port for
    /// tie-breaking.
    pub fn new(
        owner: Option<OwnerId>,
        mut derived_from_rules: Vec<RuleId>,
        mut entry: MapStateEntry,
        mut priority: u16,
    ) -> Self {
        if entry.proxy_port == 0 {
            entry.listener = String::new();
            priority = 0;
        } else if priority == 0 {
            priority = entry.proxy_port;
        }
        derived_from_rules.sort();
        derived_from_rules.dedup();
        Self {
            entry,
            priority,
            derived_from_rules,
            owners: Owners::from_owner(owner),
        }
    }

    pub fn is_deny(&self) -> bool {
        self.entry.is_deny
    }

    pub fn is_redirect(&self) -> bool {
        self.entry.is_redirect()
    }

    /// Merge `other` into `self`. Both entries must have the same deny
    /// polarity; merging an allow with a deny is a programmer error and is
    /// refused.
    ///
    /// A redirect beats no redirect; between redirects the lower priority
    /// wins, with the lower proxy port as tie-break. An explicit auth type
    /// beats a defaulted one; between two explicit types the numerically
    /// higher wins; a defaulted entry adopts the incoming value.
    pub fn merge(&mut self, other: &InternalEntry) {
        if self.entry.is_deny != other.entry.is_deny {
            tracing::error!(
                existing = %self.entry,
                incoming = %other.entry,
                "entry merge requires equal deny polarity"
            );
            return;
        }

        // Only allow entries carry redirects or auth requirements.
        if !self.entry.is_deny {
            if other.is_redirect()
                && (!self.is_redirect()
                    || other.priority < self.priority
                    || (other.priority == self.priority
                        && other.entry.proxy_port < self.entry.proxy_port))
            {
                self.entry.proxy_port = other.entry.proxy_port;
                self.entry.listener = other.entry.listener.clone();
                self.priority = other.priority;
            }

            if other.entry.has_auth_type == HasAuthType::Explicit {
                if self.entry.has_auth_type == HasAuthType::Explicit {
                    if other.entry.auth_type > self.entry.auth_type {
                        self.entry.auth_type = other.entry.auth_type;
                    }
                } else {
                    self.entry.has_auth_type = HasAuthType::Explicit;
                    self.entry.auth_type = other.entry.auth_type;
                }
            } else if self.entry.has_auth_type == HasAuthType::Default {
                // New default takes precedence.
                self.entry.auth_type = other.entry.auth_type;
            }
        }

        self.owners.merge(&other.owners);

        if !other.derived_from_rules.is_empty() {
            self.derived_from_rules
                .extend(other.derived_from_rules.iter().cloned());
            self.derived_from_rules.sort();
            self.derived_from_rules.dedup();
        }
    }
}

impl std::fmt::Display for InternalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},priority={},derivedFromRules={:?}",
            self.entry, self.priority, self.derived_from_rules
        )
    }
}
