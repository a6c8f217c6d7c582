//! Identity types for fleet entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Tenant (namespace) identifier. Always a UUID rendered as a string.
pub type TenantId = String;

/// Device identifier, unique per tenant.
pub type DeviceUid = String;

/// Session identifier.
pub type SessionUid = String;

/// Global user identifier.
pub type UserId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new tenant identifier.
pub fn new_tenant_id() -> TenantId {
    Uuid::new_v4().to_string()
}

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Derive a device UID from the attributes that identify a physical device
/// inside a tenant.
///
/// The same device re-registering with the same MAC and hostname always
/// lands on the same UID, so a reconnecting agent never duplicates itself.
pub fn device_uid(tenant_id: &str, mac: &str, hostname: &str) -> DeviceUid {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(mac.to_ascii_lowercase().as_bytes());
    hasher.update(b"\0");
    hasher.update(hostname.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash an API key secret into its stored identifier.
pub fn api_key_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_uid_is_stable() {
        let a = device_uid("tenant", "AA:BB:CC:DD:EE:FF", "web-01");
        let b = device_uid("tenant", "aa:bb:cc:dd:ee:ff", "web-01");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_device_uid_differs_per_tenant() {
        let a = device_uid("tenant-a", "aa:bb:cc:dd:ee:ff", "web-01");
        let b = device_uid("tenant-b", "aa:bb:cc:dd:ee:ff", "web-01");
        assert_ne!(a, b);
    }
}
