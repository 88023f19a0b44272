//! Contact binding entity

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime given to contacts provisioned by configuration (about a century)
pub const STATIC_CONTACT_SECS: i64 = 100 * 365 * 24 * 3600;

/// Remaining lifetime beyond which a binding is considered static
const STATIC_THRESHOLD_SECS: i64 = 50 * 365 * 24 * 3600;

/// One reachable address of a user, with its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBinding {
    pub uri: String,
    pub expires_at: DateTime<Utc>,
}

impl ContactBinding {
    pub fn new(uri: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            uri: uri.into(),
            expires_at,
        }
    }

    pub fn with_lifetime(uri: impl Into<String>, seconds: u32) -> Self {
        Self::new(uri, Utc::now() + Duration::seconds(seconds as i64))
    }

    pub fn static_binding(uri: impl Into<String>) -> Self {
        Self::new(uri, Utc::now() + Duration::seconds(STATIC_CONTACT_SECS))
    }

    pub fn is_static(&self) -> bool {
        self.expires_at - Utc::now() > Duration::seconds(STATIC_THRESHOLD_SECS)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Seconds left before expiry, saturating at zero
    pub fn remaining_secs(&self) -> u32 {
        let left = (self.expires_at - Utc::now()).num_seconds();
        left.clamp(0, u32::MAX as i64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_binding() {
        let binding = ContactBinding::static_binding("sip:alice@10.0.0.1");
        assert!(binding.is_static());
        assert!(!binding.is_expired());
    }

    #[test]
    fn test_finite_binding() {
        let binding = ContactBinding::with_lifetime("sip:alice@10.0.0.1", 3600);
        assert!(!binding.is_static());
        assert!(!binding.is_expired());
        assert!(binding.remaining_secs() <= 3600);
        assert!(binding.remaining_secs() > 3500);
    }

    #[test]
    fn test_expired_binding() {
        let binding = ContactBinding::new("sip:alice@10.0.0.1", Utc::now() - Duration::seconds(1));
        assert!(binding.is_expired());
        assert_eq!(binding.remaining_secs(), 0);
    }
}
