//! MAC addresses, including the synthetic VTEP MACs used for VXLAN L2 routes.

use crate::ip::Ipv4Address;
use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of every VTEP MAC derived from a gateway address.
///
/// `0xa2` has the locally-administered bit set and the multicast bit clear.
const VTEP_MAC_PREFIX: [u8; 2] = [0xa2, 0x2a];

/// A 48-bit Ethernet MAC address.
///
/// ```
/// use dpa_types::MacAddress;
///
/// let mac: MacAddress = "a2:2a:0a:00:00:01".parse().unwrap();
/// assert!(mac.is_local());
/// assert_eq!(mac.to_string(), "a2:2a:0a:00:00:01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Derives the remote VTEP MAC for a gateway reached over VXLAN.
    ///
    /// The gateway's IPv4 octets fill the low four bytes, so every gateway
    /// gets a stable, distinct, locally-administered MAC without any lookup.
    pub const fn vtep_for(gateway: Ipv4Address) -> Self {
        let o = gateway.octets();
        MacAddress([VTEP_MAC_PREFIX[0], VTEP_MAC_PREFIX[1], o[0], o[1], o[2], o[3]])
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Multicast bit: least significant bit of the first octet.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Locally-administered bit: second least significant bit of the first octet.
    pub const fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub const fn is_zero(&self) -> bool {
        let b = &self.0;
        b[0] | b[1] | b[2] | b[3] | b[4] | b[5] == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };

        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(separator) {
            if count == 6 || part.len() != 2 {
                return Err(ParseError::InvalidMacAddress(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMacAddress(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(ParseError::InvalidMacAddress(s.to_string()));
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_vtep_mac_from_gateway() {
        let mac = MacAddress::vtep_for(Ipv4Address::new(10, 0, 0, 1));
        assert_eq!(mac.as_bytes(), &[0xa2, 0x2a, 10, 0, 0, 1]);
        assert!(mac.is_local());
        assert!(!mac.is_multicast());
    }

    #[test]
    fn test_vtep_macs_are_distinct() {
        let a = MacAddress::vtep_for(Ipv4Address::new(10, 0, 0, 1));
        let b = MacAddress::vtep_for(Ipv4Address::new(10, 0, 0, 2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddress = "aa-bb-cc-dd-ee-ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!(!MacAddress::ZERO.is_local());
        assert!(MacAddress::ZERO.is_zero());
    }

    #[test]
    fn test_invalid_format() {
        assert!("invalid".parse::<MacAddress>().is_err());
        assert!("00:11:22:33:44".parse::<MacAddress>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<MacAddress>().is_err());
        assert!("gg:11:22:33:44:55".parse::<MacAddress>().is_err());
    }
}
