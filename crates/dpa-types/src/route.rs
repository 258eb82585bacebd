//! Route values handed to a route table syncer.

use crate::ip::{IpAddress, IpPrefix};
use crate::mac::MacAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface key for routes that have no output interface, such as
/// unreachable routes or multi-path routes whose hops carry their own link.
pub const INTERFACE_NONE: &str = "*NoOIF*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Encapsulated via a VXLAN device; programmed on-link.
    Vxlan,
    Unreachable,
    Blackhole,
    /// Plain unicast route without encapsulation.
    NoEncap,
}

impl TargetType {
    /// True for route types the kernel stores without an output interface.
    pub const fn is_interfaceless(&self) -> bool {
        matches!(self, TargetType::Unreachable | TargetType::Blackhole)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Vxlan => "vxlan",
            TargetType::Unreachable => "unreachable",
            TargetType::Blackhole => "blackhole",
            TargetType::NoEncap => "noencap",
        };
        f.write_str(s)
    }
}

/// One hop of a multi-path route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHop {
    pub gw: IpAddress,
    /// Output link; `None` until the device's index is known.
    pub link_index: Option<u32>,
}

/// A desired route within one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub target_type: TargetType,
    pub cidr: IpPrefix,
    pub gw: Option<IpAddress>,
    /// Empty unless this is an ECMP route. Kept sorted.
    pub multipath: Vec<NextHop>,
}

impl Target {
    pub fn unreachable(cidr: IpPrefix) -> Self {
        Target {
            target_type: TargetType::Unreachable,
            cidr,
            gw: None,
            multipath: Vec::new(),
        }
    }

    pub fn vxlan_single(cidr: IpPrefix, gw: IpAddress) -> Self {
        Target {
            target_type: TargetType::Vxlan,
            cidr,
            gw: Some(gw),
            multipath: Vec::new(),
        }
    }

    /// Builds an ECMP route. Hops are sorted and deduplicated so that equal
    /// member sets always produce equal targets.
    pub fn vxlan_multipath(cidr: IpPrefix, hops: impl IntoIterator<Item = NextHop>) -> Self {
        let mut multipath: Vec<NextHop> = hops.into_iter().collect();
        multipath.sort();
        multipath.dedup();
        Target {
            target_type: TargetType::Vxlan,
            cidr,
            gw: None,
            multipath,
        }
    }

    pub fn is_multipath(&self) -> bool {
        !self.multipath.is_empty()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.target_type, self.cidr)?;
        if let Some(gw) = &self.gw {
            write!(f, " via {}", gw)?;
        }
        for hop in &self.multipath {
            write!(f, " nexthop {}", hop.gw)?;
        }
        Ok(())
    }
}

/// A static neighbour/FDB entry for a remote VTEP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L2Target {
    pub vtep_mac: MacAddress,
    /// Underlay address of the remote VTEP.
    pub gw: IpAddress,
    /// Overlay address answered by `vtep_mac`.
    pub ip: IpAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hop(s: &str) -> NextHop {
        NextHop {
            gw: s.parse().unwrap(),
            link_index: Some(7),
        }
    }

    #[test]
    fn test_multipath_is_sorted_and_deduplicated() {
        let t = Target::vxlan_multipath(
            IpPrefix::default_v4(),
            vec![hop("10.0.0.2"), hop("10.0.0.1"), hop("10.0.0.2")],
        );
        assert_eq!(t.multipath, vec![hop("10.0.0.1"), hop("10.0.0.2")]);
        assert!(t.is_multipath());
        assert_eq!(t.gw, None);
    }

    #[test]
    fn test_equal_member_sets_give_equal_targets() {
        let a = Target::vxlan_multipath(IpPrefix::default_v4(), vec![hop("10.0.0.1"), hop("10.0.0.2")]);
        let b = Target::vxlan_multipath(IpPrefix::default_v4(), vec![hop("10.0.0.2"), hop("10.0.0.1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let t = Target::vxlan_single(IpPrefix::default_v4(), "10.0.0.1".parse().unwrap());
        assert_eq!(t.to_string(), "vxlan 0.0.0.0/0 via 10.0.0.1");
        assert_eq!(Target::unreachable(IpPrefix::default_v4()).to_string(), "unreachable 0.0.0.0/0");
        assert!(TargetType::Unreachable.is_interfaceless());
        assert!(!TargetType::Vxlan.is_interfaceless());
    }
}
