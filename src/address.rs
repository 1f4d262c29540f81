use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Bluetooth address '{0}', expected the form AA:BB:CC:DD:EE:FF")]
pub struct InvalidAddress(pub String);

/// The BLE MAC address of a ring, normalised to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns `true` for addresses of the form `AA:BB:CC:DD:EE:FF` (any case).
pub fn is_valid_mac_address(value: &str) -> bool {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("static regex"))
        .is_match(value)
}

impl FromStr for DeviceAddress {
    type Err = InvalidAddress;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !is_valid_mac_address(trimmed) {
            return Err(InvalidAddress(value.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[test]
fn test_parse_normalises_case() {
    let address: DeviceAddress = " aa:bb:cc:00:11:2f ".parse().unwrap();
    assert_eq!(address.as_str(), "AA:BB:CC:00:11:2F");
}

#[test]
fn test_parse_rejects_malformed() {
    for bad in ["", "AA:BB:CC:DD:EE", "AA-BB-CC-DD-EE-FF", "AA:BB:CC:DD:EE:FG", "AABBCCDDEEFF"] {
        assert!(bad.parse::<DeviceAddress>().is_err(), "{bad} should be rejected");
    }
}
