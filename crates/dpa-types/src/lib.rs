//! Value types shared by the dataplane agent crates.
//!
//! - [`IpAddress`], [`IpPrefix`]: addresses and CIDR prefixes
//! - [`MacAddress`]: Ethernet addresses, including derived VTEP MACs
//! - [`Target`], [`L2Target`]: what a route table syncer is asked to program
//! - [`Rule`], [`RuleKey`]: policy routing rules and their identity

mod ip;
mod mac;
mod route;
mod rule;

pub use ip::{IpAddress, IpPrefix, Ipv4Address, Ipv6Address};
pub use mac::MacAddress;
pub use route::{L2Target, NextHop, Target, TargetType, INTERFACE_NONE};
pub use rule::{Rule, RuleKey};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
