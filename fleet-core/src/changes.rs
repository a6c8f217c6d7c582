//! Change-set types for updates.
//!
//! Each struct lists only the fields a caller may change. `None` leaves a
//! field untouched, so an explicit `Some(false)` is never confused with
//! "not provided". Nullable fields use `Option<Option<T>>`: `Some(None)`
//! clears the value.

use crate::*;

/// Update payload for namespaces.
#[derive(Debug, Clone, Default)]
pub struct NamespaceChanges {
    pub name: Option<String>,
    pub max_devices: Option<i64>,
    pub session_record: Option<bool>,
}

impl NamespaceChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.max_devices.is_none() && self.session_record.is_none()
    }
}

/// Update payload for a namespace member.
#[derive(Debug, Clone, Default)]
pub struct MemberChanges {
    pub role: Option<MemberRole>,
    pub status: Option<MemberStatus>,
    pub expires_at: Option<Option<Timestamp>>,
}

impl MemberChanges {
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.status.is_none() && self.expires_at.is_none()
    }
}

/// Update payload for devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceChanges {
    pub name: Option<String>,
    pub public_url: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub info: Option<DeviceInfo>,
    pub remote_addr: Option<Option<String>>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.public_url.is_none()
            && self.tags.is_none()
            && self.info.is_none()
            && self.remote_addr.is_none()
    }
}

/// Update payload for firewall rules.
#[derive(Debug, Clone, Default)]
pub struct FirewallRuleChanges {
    pub priority: Option<i32>,
    pub action: Option<RuleAction>,
    pub active: Option<bool>,
    pub source_ip: Option<String>,
    pub username: Option<String>,
    pub filter: Option<TargetFilter>,
}

impl FirewallRuleChanges {
    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
            && self.action.is_none()
            && self.active.is_none()
            && self.source_ip.is_none()
            && self.username.is_none()
            && self.filter.is_none()
    }
}

/// Update payload for public keys.
#[derive(Debug, Clone, Default)]
pub struct PublicKeyChanges {
    pub name: Option<String>,
    pub username: Option<String>,
    pub filter: Option<TargetFilter>,
}

impl PublicKeyChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.username.is_none() && self.filter.is_none()
    }
}

/// Update payload for API keys.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyChanges {
    pub name: Option<String>,
    pub role: Option<MemberRole>,
    pub expires_at: Option<Option<Timestamp>>,
}

impl ApiKeyChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.role.is_none() && self.expires_at.is_none()
    }
}

/// Update payload for users.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_digest: Option<String>,
    pub last_login: Option<Timestamp>,
    pub preferred_namespace: Option<Option<TenantId>>,
    pub max_namespaces: Option<i64>,
}

impl UserChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.username.is_none()
            && self.email.is_none()
            && self.password_digest.is_none()
            && self.last_login.is_none()
            && self.preferred_namespace.is_none()
            && self.max_namespaces.is_none()
    }
}

/// Update payload for system settings.
#[derive(Debug, Clone, Default)]
pub struct SystemSettingsChanges {
    pub setup_done: Option<bool>,
    pub signup_enabled: Option<bool>,
    pub session_record_default: Option<bool>,
}

impl SystemSettingsChanges {
    pub fn is_empty(&self) -> bool {
        self.setup_done.is_none()
            && self.signup_enabled.is_none()
            && self.session_record_default.is_none()
    }
}
