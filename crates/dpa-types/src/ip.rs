//! IP addresses and CIDR prefixes.
//!
//! All types here are totally ordered so that the dataplane can key
//! `BTreeMap`/`BTreeSet` on them and emit kernel operations in a stable order.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Ipv4Address(Ipv4Addr::UNSPECIFIED);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    pub const fn to_bits(&self) -> u32 {
        u32::from_be_bytes(self.0.octets())
    }

    pub const fn from_bits(bits: u32) -> Self {
        let o = bits.to_be_bytes();
        Ipv4Address::new(o[0], o[1], o[2], o[3])
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv6Address(Ipv6Addr);

impl Ipv6Address {
    pub const UNSPECIFIED: Self = Ipv6Address(Ipv6Addr::UNSPECIFIED);

    pub const fn inner(&self) -> Ipv6Addr {
        self.0
    }

    pub const fn to_bits(&self) -> u128 {
        u128::from_be_bytes(self.0.octets())
    }

    pub const fn from_bits(bits: u128) -> Self {
        Ipv6Address(Ipv6Addr::from_bits(bits))
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv6Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Ipv6Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv6Addr> for Ipv6Address {
    fn from(addr: Ipv6Addr) -> Self {
        Ipv6Address(addr)
    }
}

/// An IPv4 or IPv6 address. IPv4 sorts before IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    pub const fn as_ipv4(&self) -> Option<Ipv4Address> {
        match self {
            IpAddress::V4(addr) => Some(*addr),
            IpAddress::V6(_) => None,
        }
    }

    const fn max_prefix_len(&self) -> u8 {
        match self {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Address>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Address>().map(IpAddress::V4)
        }
    }
}

impl From<Ipv4Address> for IpAddress {
    fn from(addr: Ipv4Address) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Address> for IpAddress {
    fn from(addr: Ipv6Address) -> Self {
        IpAddress::V6(addr)
    }
}

/// A CIDR prefix such as `10.0.0.0/24`.
///
/// The host bits are cleared on construction, so `10.0.0.7/24` and
/// `10.0.0.0/24` compare equal. Serialized as its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a prefix, masking off host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds the address width.
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.max_prefix_len();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        Ok(IpPrefix {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// The single-address prefix for `address` (/32 or /128).
    pub const fn host(address: IpAddress) -> Self {
        IpPrefix {
            address,
            prefix_len: address.max_prefix_len(),
        }
    }

    /// `0.0.0.0/0`
    pub const fn default_v4() -> Self {
        IpPrefix {
            address: IpAddress::V4(Ipv4Address::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == self.address.max_prefix_len()
    }

    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        addr.is_ipv4() == self.address.is_ipv4() && mask(*addr, self.prefix_len) == self.address
    }
}

fn mask(address: IpAddress, prefix_len: u8) -> IpAddress {
    match address {
        IpAddress::V4(a) => {
            let m = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
            IpAddress::V4(Ipv4Address::from_bits(a.to_bits() & m))
        }
        IpAddress::V6(a) => {
            let m = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
            IpAddress::V6(Ipv6Address::from_bits(a.to_bits() & m))
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    /// Accepts `addr/len` or a bare address, which becomes a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, len_str)) = s.rsplit_once('/') else {
            return Ok(IpPrefix::host(s.parse()?));
        };

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}
