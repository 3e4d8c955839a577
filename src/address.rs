//! Bluetooth device address, used as the session's stable identifier.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::error::{Error, ErrorKind, InternalErrorKind};

/// A Bluetooth device address (`AA:BB:CC:DD:EE:FF`).
///
/// This is the key under which sessions are registered in the process-wide
/// device table and the suffix of every exported object path
///.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new address from its six octets.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Formats the address for use as a D-Bus object path component
    /// (colons are not legal in object paths).
    pub fn path_component(&self) -> String {
        format!(
            "dev_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }

    /// Extracts the address from a BlueZ device object path, e.g.
    /// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`, as handed to us by
    /// `Profile1.NewConnection`.
    pub fn from_device_path(path: &str) -> Option<Self> {
        let component = path.rsplit('/').next()?;
        let octets = component.strip_prefix("dev_")?;
        let mut out = [0u8; 6];
        let mut parts = octets.split('_');
        for slot in &mut out {
            *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(out))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::new(ErrorKind::Internal(InternalErrorKind::InvalidAddress(s.to_string())))
        };
        let fields: Vec<u8> =
            s.split(':').map(|f| u8::from_str_radix(f, 16).map_err(|_| invalid())).collect::<Result<_, _>>()?;
        let octets: [u8; 6] = fields.try_into().map_err(|_| invalid())?;
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("AA:BB:CC".parse::<Address>().is_err());
    }

    #[test]
    fn path_component_has_no_colons() {
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.path_component(), "dev_AA_BB_CC_DD_EE_FF");
    }

    #[test]
    fn parses_bluez_device_path() {
        let addr = Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_non_device_path() {
        assert!(Address::from_device_path("/org/bluez/hci0").is_none());
        assert!(Address::from_device_path("/org/bluez/hci0/dev_AA_BB").is_none());
    }
}
