use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SdrError};

/// Physical radio identifier. The scheme selects the backend family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Vendor USB device by serial number
    Serial(String),
    /// Attribute I/O context URI, e.g. `ip:192.168.2.1` or `usb:1.4.5`
    Uri(String),
    /// In-memory radio
    Simulated(String),
}

/// Bare context URI prefixes understood without a `uri=` tag.
const URI_SCHEMES: [&str; 4] = ["ip:", "usb:", "local:", "serial:"];

impl DeviceId {
    /// Parse an identifier string.
    ///
    /// Accepts `uri=<uri>`, `serial=<serial>`, `sim:<name>`, bare context
    /// URIs (`ip:`, `usb:`, `local:`, `serial:`) and bare serial numbers.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| SdrError::InvalidSetting {
            key: "identifier",
            reason: format!("'{}': {}", s, reason),
        };

        if let Some(uri) = s.strip_prefix("uri=") {
            if uri.is_empty() {
                return Err(invalid("empty uri"));
            }
            return Ok(DeviceId::Uri(uri.to_string()));
        }
        if let Some(serial) = s.strip_prefix("serial=") {
            if serial.is_empty() {
                return Err(invalid("empty serial"));
            }
            return Ok(DeviceId::Serial(serial.to_string()));
        }
        if let Some(name) = s.strip_prefix("sim:") {
            return Ok(DeviceId::Simulated(name.to_string()));
        }
        if URI_SCHEMES.iter().any(|p| s.starts_with(p)) {
            return Ok(DeviceId::Uri(s.to_string()));
        }
        if s.is_empty() {
            return Err(invalid("empty identifier"));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("serial numbers are alphanumeric"));
        }
        Ok(DeviceId::Serial(s.to_string()))
    }

    pub fn value(&self) -> &str {
        match self {
            DeviceId::Serial(v) | DeviceId::Uri(v) | DeviceId::Simulated(v) => v,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Serial(v) => write!(f, "serial={}", v),
            DeviceId::Uri(v) => write!(f, "uri={}", v),
            DeviceId::Simulated(v) => write!(f, "sim:{}", v),
        }
    }
}

impl FromStr for DeviceId {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceId::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes() {
        assert_eq!(
            DeviceId::parse("uri=ip:192.168.2.1").unwrap(),
            DeviceId::Uri("ip:192.168.2.1".into())
        );
        assert_eq!(DeviceId::parse("usb:1.4.5").unwrap(), DeviceId::Uri("usb:1.4.5".into()));
        assert_eq!(
            DeviceId::parse("serial=0009060B00471B1F").unwrap(),
            DeviceId::Serial("0009060B00471B1F".into())
        );
        assert_eq!(
            DeviceId::parse("  1D3AB5C1E6C5E4  ").unwrap(),
            DeviceId::Serial("1D3AB5C1E6C5E4".into())
        );
        assert_eq!(DeviceId::parse("sim:bench").unwrap(), DeviceId::Simulated("bench".into()));
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["uri=ip:pluto.local", "serial=ABC123", "sim:demo"] {
            let id: DeviceId = s.parse().unwrap();
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("uri=").is_err());
        assert!(DeviceId::parse("not a serial").is_err());
    }
}
