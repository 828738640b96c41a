//! Identifiers shared by the ledger, the gateway and the rate controller.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};

use crate::Error;

/// A rate in kilobits per second.
pub type Kbps = u64;
/// Switch-local port number.
pub type PortNo = u32;
/// Switch-local meter identifier. Meter ids start at 1.
pub type MeterId = u32;
/// Identifier of a packet held in a switch buffer.
pub type BufferId = u32;

/// Datapath identifier of a switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwitchId(pub u64);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A 48-bit link-layer address.
///
/// Ordering is bytewise, which is the order the rate controller walks
/// sources in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for b in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error(format!("mac address too short: {:?}", s)))?;
            if part.len() != 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error(format!("bad mac address octet {:?} in {:?}", part, s)));
            }
            *b = u8::from_str_radix(part, 16)
                .map_err(|_| Error(format!("bad mac address octet {:?} in {:?}", part, s)))?;
        }

        if parts.next().is_some() {
            return Err(Error(format!("mac address too long: {:?}", s)));
        }

        Ok(MacAddr(bytes))
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: Error| de::Error::custom(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{MacAddr, SwitchId};

    #[test]
    fn parse_mac() {
        let m: MacAddr = "00:1b:21:3a:ff:0c".parse().unwrap();
        assert_eq!(m, MacAddr([0x00, 0x1b, 0x21, 0x3a, 0xff, 0x0c]));
        assert_eq!(m.to_string(), "00:1b:21:3a:ff:0c");

        let dashed: MacAddr = "00-1B-21-3A-FF-0C".parse().unwrap();
        assert_eq!(dashed, m);
    }

    #[test]
    fn reject_bad_mac() {
        assert!("00:1b:21:3a:ff".parse::<MacAddr>().is_err());
        assert!("00:1b:21:3a:ff:0c:01".parse::<MacAddr>().is_err());
        assert!("00:1b:21:3a:ff:zz".parse::<MacAddr>().is_err());
        assert!("001b:21:3a:ff:0c".parse::<MacAddr>().is_err());
        assert!("00:00:00:00:00:+f".parse::<MacAddr>().is_err());
    }

    #[test]
    fn switch_id_display() {
        assert_eq!(SwitchId(0x2a).to_string(), "000000000000002a");
    }
}
