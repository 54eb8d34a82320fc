/**
 * Input Validation
 *
 * Validation for values typed in by the user at the command line before
 * they reach the services (bridge address, sensitivity, device name).
 */
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Value too long: max {max}, got {actual}")]
    ValueTooLong { max: usize, actual: usize },
}

/// Longest DNS name plus room for a `:port` suffix
const MAX_ADDRESS_LEN: usize = 253 + 6;

/// Validate a bridge address: a host name or IP, optionally with `:port`.
///
/// Schemes and paths are rejected since the client builds `http://<addr>/api/...`
/// itself. Returns the trimmed address.
pub fn validate_bridge_address(address: &str) -> Result<String, ValidationError> {
    let address = address.trim();

    if address.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "Bridge address cannot be empty".to_string(),
        ));
    }

    if address.len() > MAX_ADDRESS_LEN {
        return Err(ValidationError::ValueTooLong {
            max: MAX_ADDRESS_LEN,
            actual: address.len(),
        });
    }

    if address.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ValidationError::InvalidFormat(
            "Bridge address contains whitespace or control characters".to_string(),
        ));
    }

    if address.contains("://") || address.contains(['/', '?', '#', '@']) {
        return Err(ValidationError::InvalidFormat(format!(
            "Expected a host or host:port, got '{}'",
            address
        )));
    }

    let parsed = url::Url::parse(&format!("http://{}/", address))
        .map_err(|e| ValidationError::InvalidFormat(format!("'{}': {}", address, e)))?;

    if parsed.host_str().is_none() {
        return Err(ValidationError::InvalidFormat(format!(
            "'{}' has no host",
            address
        )));
    }

    Ok(address.to_string())
}

/// Validate clap sensitivity in percent (0 to 100)
pub fn validate_sensitivity_percent(percent: u32) -> Result<u32, ValidationError> {
    if percent > 100 {
        return Err(ValidationError::InvalidRange(format!(
            "Sensitivity must be between 0 and 100, got {}",
            percent
        )));
    }
    Ok(percent)
}

/// Validate device name (max 256 chars, no control characters)
pub fn validate_device_name(name: &str) -> Result<String, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "Device name cannot be empty".to_string(),
        ));
    }

    if name.len() > 256 {
        return Err(ValidationError::ValueTooLong {
            max: 256,
            actual: name.len(),
        });
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidFormat(
            "Device name contains invalid control characters".to_string(),
        ));
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_address_valid() {
        assert_eq!(
            validate_bridge_address("192.168.1.20").unwrap(),
            "192.168.1.20"
        );
        assert_eq!(
            validate_bridge_address("  10.0.0.2:8080 ").unwrap(),
            "10.0.0.2:8080"
        );
        assert!(validate_bridge_address("hue-bridge.local").is_ok());
        assert!(validate_bridge_address("[fe80::1]").is_ok());
    }

    #[test]
    fn test_bridge_address_invalid() {
        assert!(validate_bridge_address("").is_err());
        assert!(validate_bridge_address("   ").is_err());
        assert!(validate_bridge_address("http://192.168.1.20").is_err());
        assert!(validate_bridge_address("192.168.1.20/api").is_err());
        assert!(validate_bridge_address("user@192.168.1.20").is_err());
        assert!(validate_bridge_address("bridge\nlocal").is_err());
        assert!(validate_bridge_address("10.0.0.2:notaport").is_err());
        assert!(matches!(
            validate_bridge_address(&"a".repeat(300)),
            Err(ValidationError::ValueTooLong { .. })
        ));
    }

    #[test]
    fn test_sensitivity_percent() {
        assert!(validate_sensitivity_percent(0).is_ok());
        assert!(validate_sensitivity_percent(15).is_ok());
        assert!(validate_sensitivity_percent(100).is_ok());
        assert!(validate_sensitivity_percent(101).is_err());
    }

    #[test]
    fn test_device_name() {
        assert!(validate_device_name("USB Mic").is_ok());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("test\x00name").is_err());
        assert!(validate_device_name(&"x".repeat(257)).is_err());
    }
}
