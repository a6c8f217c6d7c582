//! Entity structs persisted by the store

use crate::*;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// NAMESPACE
// ============================================================================

/// A tenant: an isolated customer account owning devices and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub tenant_id: TenantId,
    pub name: String,
    pub owner: UserId,
    pub members: Vec<Member>,
    /// Maximum number of accepted devices. Negative means unlimited.
    pub max_devices: i64,
    pub settings: NamespaceSettings,
    pub created_at: Timestamp,
    #[serde(default)]
    pub devices_accepted_count: i64,
    #[serde(default)]
    pub devices_pending_count: i64,
    #[serde(default)]
    pub devices_rejected_count: i64,
    #[serde(default)]
    pub devices_removed_count: i64,
}

impl Namespace {
    /// Create a namespace whose only member is its owner.
    pub fn new(name: impl Into<String>, owner: UserId, now: Timestamp) -> Self {
        Self {
            tenant_id: new_tenant_id(),
            name: name.into(),
            owner,
            members: vec![Member {
                user_id: owner,
                role: MemberRole::Owner,
                added_at: now,
                expires_at: None,
                status: MemberStatus::Accepted,
            }],
            max_devices: -1,
            settings: NamespaceSettings::default(),
            created_at: now,
            devices_accepted_count: 0,
            devices_pending_count: 0,
            devices_rejected_count: 0,
            devices_removed_count: 0,
        }
    }

    /// Find a member by user id.
    pub fn member(&self, user_id: UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Denormalized device counter for a status.
    pub fn device_count(&self, status: DeviceStatus) -> i64 {
        match status {
            DeviceStatus::Accepted => self.devices_accepted_count,
            DeviceStatus::Pending => self.devices_pending_count,
            DeviceStatus::Rejected => self.devices_rejected_count,
            DeviceStatus::Removed => self.devices_removed_count,
        }
    }

    /// Exactly one owner-role member exists and it is `owner`.
    pub fn has_consistent_owner(&self) -> bool {
        let owners: Vec<&Member> = self
            .members
            .iter()
            .filter(|m| m.role == MemberRole::Owner)
            .collect();
        owners.len() == 1 && owners[0].user_id == self.owner
    }
}

/// A user's membership in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub role: MemberRole,
    pub added_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NamespaceSettings {
    pub session_record: bool,
}

// ============================================================================
// DEVICE
// ============================================================================

/// A managed device.
///
/// `online` and `namespace` are computed by the read pipeline and are never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub uid: DeviceUid,
    pub tenant_id: TenantId,
    pub name: String,
    pub identity: DeviceIdentity,
    pub info: Option<DeviceInfo>,
    pub status: DeviceStatus,
    pub status_updated_at: Timestamp,
    pub created_at: Timestamp,
    pub last_seen: Timestamp,
    pub disconnected_at: Option<Timestamp>,
    pub remote_addr: Option<String>,
    pub public_url: bool,
    pub tags: Vec<String>,
    #[serde(default)]
    pub online: bool,
    /// Name of the owning namespace, empty when it cannot be joined.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub namespace: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Device {
    /// Create a pending device for a tenant, deriving its UID.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        name: impl Into<String>,
        mac: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let name = name.into();
        let mac = mac.into();
        Self {
            uid: device_uid(&tenant_id, &mac, &name),
            tenant_id,
            name,
            identity: DeviceIdentity { mac },
            info: None,
            status: DeviceStatus::Pending,
            status_updated_at: now,
            created_at: now,
            last_seen: now,
            disconnected_at: None,
            remote_addr: None,
            public_url: false,
            tags: Vec::new(),
            online: false,
            namespace: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub pretty_name: String,
    pub version: String,
    pub arch: String,
    pub platform: String,
}

/// Marker row for a device holding a live agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub uid: DeviceUid,
    pub tenant_id: TenantId,
    pub status: DeviceStatus,
    pub last_seen: Timestamp,
}

/// HTTP tunnel exposed through a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub address: String,
    pub tenant_id: TenantId,
    pub device_uid: DeviceUid,
    pub created_at: Timestamp,
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Immutable history record of a remote-access session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub uid: SessionUid,
    pub device_uid: DeviceUid,
    pub tenant_id: TenantId,
    pub username: String,
    pub ip_address: String,
    pub started_at: Timestamp,
    pub last_seen: Timestamp,
    pub closed: bool,
    pub recorded: bool,
    pub authenticated: bool,
    pub events: SessionEvents,
}

impl Session {
    pub fn new(
        uid: impl Into<SessionUid>,
        device: &Device,
        username: impl Into<String>,
        ip_address: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            uid: uid.into(),
            device_uid: device.uid.clone(),
            tenant_id: device.tenant_id.clone(),
            username: username.into(),
            ip_address: ip_address.into(),
            started_at: now,
            last_seen: now,
            closed: false,
            recorded: false,
            authenticated: false,
            events: SessionEvents::default(),
        }
    }
}

/// Distinct event types and seats observed during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionEvents {
    pub types: BTreeSet<String>,
    pub seats: BTreeSet<i32>,
}

/// A single event emitted inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_type: String,
    pub seat: i32,
    pub timestamp: Timestamp,
    pub data: serde_json::Value,
}

/// Materialized-view row that exists iff its session is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub uid: SessionUid,
    pub tenant_id: TenantId,
    pub last_seen: Timestamp,
}

/// Frame of a recorded session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSession {
    pub uid: SessionUid,
    pub tenant_id: TenantId,
    pub message: String,
    pub time: Timestamp,
}

// ============================================================================
// POLICIES AND CREDENTIALS
// ============================================================================

/// Tenant-scoped connection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    /// Evaluation order. Unique within a tenant.
    pub priority: i32,
    pub action: RuleAction,
    pub active: bool,
    pub source_ip: String,
    pub username: String,
    pub filter: TargetFilter,
}

/// Tenant-scoped SSH public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Unique per tenant.
    pub fingerprint: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub data: String,
    pub username: String,
    pub filter: TargetFilter,
    pub created_at: Timestamp,
}

/// Which devices a policy or credential applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetFilter {
    pub hostname: Option<String>,
    pub tags: Vec<String>,
}

/// Namespace-scoped API key. `id` is the digest of the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub role: MemberRole,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl ApiKey {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ============================================================================
// USERS AND SYSTEM
// ============================================================================

/// Global user identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_digest: String,
    pub created_at: Timestamp,
    pub last_login: Option<Timestamp>,
    pub preferred_namespace: Option<TenantId>,
    /// Negative means unlimited.
    pub max_namespaces: i64,
    /// Derived from the namespaces collection, never persisted.
    #[serde(default)]
    pub namespaces_owned: i64,
}

impl User {
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            username: username.into(),
            email: email.into(),
            password_digest: String::new(),
            created_at: now,
            last_login: None,
            preferred_namespace: None,
            max_namespaces: -1,
            namespaces_owned: 0,
        }
    }
}

/// Instance-wide settings. A single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub setup_done: bool,
    pub signup_enabled: bool,
    pub session_record_default: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            setup_done: false,
            signup_enabled: true,
            session_record_default: true,
        }
    }
}
