//! Access control: portal-group x initiator-group visibility and netmask
//! matching (SPEC_FULL §4.3).
//!
//! Modeled on the config grammar's `PortalGroup`/`InitiatorGroup`/
//! `LogicalUnit Mapping` sections: a login is allowed onto a target iff the
//! accepting portal's group tag and the initiator's name+source address
//! match some `(PG_tag, IG_tag)` pair in the target's mapping list.

use std::net::IpAddr;

/// A single netmask entry from an `InitiatorGroup` section's `Netmask` item.
#[derive(Debug, Clone)]
pub enum NetMask {
    /// `ALL` - matches any source address.
    All,
    /// Single IPv4/IPv6 address, no prefix.
    Host(IpAddr),
    /// address/prefix-length.
    Prefix(IpAddr, u8),
}

impl NetMask {
    /// Parse a netmask spec: `ALL`, a bare address, or `addr/prefix`.
    /// `addr/255.255.255.0`-style dotted masks are also accepted for IPv4.
    pub fn parse(spec: &str) -> Option<NetMask> {
        if spec.eq_ignore_ascii_case("ALL") {
            return Some(NetMask::All);
        }
        if let Some((addr, mask)) = spec.split_once('/') {
            let addr: IpAddr = addr.trim().parse().ok()?;
            if let Ok(prefix) = mask.trim().parse::<u8>() {
                return Some(NetMask::Prefix(addr, prefix));
            }
            // Dotted-decimal mask, e.g. 255.255.255.0.
            let mask_addr: IpAddr = mask.trim().parse().ok()?;
            if let (IpAddr::V4(m), IpAddr::V4(_)) = (mask_addr, addr) {
                let bits = u32::from(m).count_ones() as u8;
                return Some(NetMask::Prefix(addr, bits));
            }
            return None;
        }
        let addr: IpAddr = spec.trim().parse().ok()?;
        Some(NetMask::Host(addr))
    }

    pub fn matches(&self, source: IpAddr) -> bool {
        match self {
            NetMask::All => true,
            NetMask::Host(addr) => *addr == source,
            NetMask::Prefix(addr, prefix) => match (addr, source) {
                (IpAddr::V4(a), IpAddr::V4(s)) => {
                    let prefix = (*prefix).min(32);
                    let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
                    (u32::from(*a) & mask) == (u32::from(s) & mask)
                }
                (IpAddr::V6(a), IpAddr::V6(s)) => {
                    let prefix = (*prefix).min(128);
                    let mask = if prefix == 0 { 0u128 } else { !0u128 << (128 - prefix) };
                    (u128::from(*a) & mask) == (u128::from(s) & mask)
                }
                _ => false,
            },
        }
    }
}

/// One `InitiatorName` pattern from an `InitiatorGroup` section. `ALL`
/// matches any initiator name; a leading `!` negates the match and
/// negations take precedence over positive matches in the same group.
#[derive(Debug, Clone)]
pub struct InitiatorPattern {
    pattern: String,
    negate: bool,
}

impl InitiatorPattern {
    pub fn parse(spec: &str) -> InitiatorPattern {
        if let Some(rest) = spec.strip_prefix('!') {
            InitiatorPattern { pattern: rest.to_string(), negate: true }
        } else {
            InitiatorPattern { pattern: spec.to_string(), negate: false }
        }
    }

    fn matches_name(&self, initiator_name: &str) -> bool {
        self.pattern.eq_ignore_ascii_case("ALL") || self.pattern == initiator_name
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitiatorGroup {
    pub tag: String,
    pub patterns: Vec<InitiatorPattern>,
    pub netmasks: Vec<NetMask>,
}

impl InitiatorGroup {
    /// An initiator is visible through this group iff its name matches (with
    /// negations taking precedence over positive matches) and its source
    /// address matches at least one netmask.
    fn allows(&self, initiator_name: &str, source: IpAddr) -> bool {
        let mut allowed = false;
        for p in &self.patterns {
            if p.matches_name(initiator_name) {
                if p.negate {
                    return false;
                }
                allowed = true;
            }
        }
        if !allowed {
            return false;
        }
        self.netmasks.iter().any(|n| n.matches(source))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortalGroup {
    pub tag: String,
}

/// A target's full access policy: its portal groups, initiator groups, and
/// the `(PG_tag, IG_tag)` mapping pairs from its `LogicalUnit` section.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub initiator_groups: Vec<InitiatorGroup>,
    /// (portal_group_tag, initiator_group_tag) pairs this target maps.
    pub mappings: Vec<(String, String)>,
}

impl AccessPolicy {
    /// Returns true iff some mapping's initiator group both contains
    /// `initiator_name` and allows `source` through its netmasks, for the
    /// given accepting portal group tag.
    pub fn check(&self, portal_group_tag: &str, initiator_name: &str, source: IpAddr) -> bool {
        for (pg, ig) in &self.mappings {
            if pg != portal_group_tag {
                continue;
            }
            if let Some(group) = self.initiator_groups.iter().find(|g| &g.tag == ig) {
                if group.allows(initiator_name, source) {
                    return true;
                }
            }
        }
        false
    }

    /// An empty policy (no mappings configured) allows everything, matching
    /// the teacher's permissive default when no ACL is configured.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
