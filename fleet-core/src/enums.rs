//! Enum types for fleet entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Entity type discriminator, used for cache keys and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Namespace,
    Member,
    Device,
    Session,
    ActiveSession,
    Tag,
    FirewallRule,
    PublicKey,
    User,
    ApiKey,
    SystemSettings,
}

impl EntityType {
    pub const ALL: [EntityType; 11] = [
        EntityType::Namespace,
        EntityType::Member,
        EntityType::Device,
        EntityType::Session,
        EntityType::ActiveSession,
        EntityType::Tag,
        EntityType::FirewallRule,
        EntityType::PublicKey,
        EntityType::User,
        EntityType::ApiKey,
        EntityType::SystemSettings,
    ];

    /// Stable lowercase name, used as the first component of cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Namespace => "namespace",
            EntityType::Member => "member",
            EntityType::Device => "device",
            EntityType::Session => "session",
            EntityType::ActiveSession => "active_session",
            EntityType::Tag => "tag",
            EntityType::FirewallRule => "firewall_rule",
            EntityType::PublicKey => "public_key",
            EntityType::User => "user",
            EntityType::ApiKey => "api_key",
            EntityType::SystemSettings => "system_settings",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid EntityType: {}", s))
    }
}

// ============================================================================
// DEVICE STATUS
// ============================================================================

/// Admission status of a device inside its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Removed,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 4] = [
        DeviceStatus::Pending,
        DeviceStatus::Accepted,
        DeviceStatus::Rejected,
        DeviceStatus::Removed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Accepted => "accepted",
            DeviceStatus::Rejected => "rejected",
            DeviceStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeviceStatus::Pending),
            "accepted" => Ok(DeviceStatus::Accepted),
            "rejected" => Ok(DeviceStatus::Rejected),
            "removed" => Ok(DeviceStatus::Removed),
            _ => Err(format!("Invalid DeviceStatus: {}", s)),
        }
    }
}

// ============================================================================
// MEMBERSHIP
// ============================================================================

/// Role of a member (or API key) inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Observer,
    Operator,
    Administrator,
    Owner,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberRole::Observer => "observer",
            MemberRole::Operator => "operator",
            MemberRole::Administrator => "administrator",
            MemberRole::Owner => "owner",
        };
        f.write_str(s)
    }
}

/// Invitation status of a namespace member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Pending,
    Accepted,
}

// ============================================================================
// FIREWALL
// ============================================================================

/// What a firewall rule does with a matching connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_roundtrip_str() {
        for status in DeviceStatus::ALL {
            assert_eq!(status.as_str().parse::<DeviceStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn test_device_status_serde_lowercase() {
        let json = serde_json::to_value(DeviceStatus::Accepted).unwrap();
        assert_eq!(json, serde_json::json!("accepted"));
    }

    #[test]
    fn test_entity_type_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            EntityType::ALL.iter().map(|e| e.as_str()).collect();
        assert_eq!(names.len(), EntityType::ALL.len());
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>(), Ok(t));
        }
    }

    #[test]
    fn test_owner_outranks_other_roles() {
        assert!(MemberRole::Owner > MemberRole::Administrator);
        assert!(MemberRole::Administrator > MemberRole::Operator);
        assert!(MemberRole::Operator > MemberRole::Observer);
    }
}
