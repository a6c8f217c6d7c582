//! Fleet Test Utilities
//!
//! Shared test infrastructure for the fleet workspace:
//! - Proptest generators for entity types
//! - Fixtures for a store over the in-memory engine
//! - Custom assertions for fleet error kinds

pub use fleet_core::{
    ApiKey, Device, DeviceStatus, EntityType, FirewallRule, FleetError, FleetResult, ManualClock,
    Member, MemberRole, MemberStatus, Namespace, PublicKey, RuleAction, Session, StorageError,
    TargetFilter, TenantId, Timestamp, User, UserId, ValidationError,
};
pub use fleet_storage::{Collection, InMemoryCacheBackend, InMemoryEngine, Store, StoreConfig};

use chrono::{TimeZone, Utc};
use std::sync::Arc;

/// Install a test subscriber honoring `RUST_LOG`. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Instant every fixture clock starts at.
pub fn epoch() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fleet entity types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_device_status() -> impl Strategy<Value = DeviceStatus> {
        prop_oneof![
            Just(DeviceStatus::Pending),
            Just(DeviceStatus::Accepted),
            Just(DeviceStatus::Rejected),
            Just(DeviceStatus::Removed),
        ]
    }

    /// Roles a non-owner member may hold.
    pub fn arb_member_role() -> impl Strategy<Value = MemberRole> {
        prop_oneof![
            Just(MemberRole::Observer),
            Just(MemberRole::Operator),
            Just(MemberRole::Administrator),
        ]
    }

    pub fn arb_rule_action() -> impl Strategy<Value = RuleAction> {
        prop_oneof![Just(RuleAction::Allow), Just(RuleAction::Deny)]
    }

    /// A non-empty tag.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,11}"
    }

    /// A device hostname, unique enough to avoid collisions in small sets.
    pub fn arb_hostname() -> impl Strategy<Value = String> {
        "[a-z]{3,8}-[0-9]{2}"
    }

    /// A device in `tenant_id` with arbitrary status, tags and last-seen
    /// time.
    pub fn arb_device(tenant_id: TenantId) -> impl Strategy<Value = Device> {
        (
            arb_hostname(),
            arb_device_status(),
            prop::collection::vec(arb_tag(), 0..4),
            arb_timestamp(),
        )
            .prop_map(move |(name, status, tags, last_seen)| {
                let mut device = Device::new(
                    tenant_id.clone(),
                    name.clone(),
                    format!("aa:bb:{}", name),
                    last_seen,
                );
                device.status = status;
                device.tags = tags;
                device
            })
    }

    /// Raw `(page, per_page)` input, including out-of-range values.
    pub fn arb_page_request() -> impl Strategy<Value = (i64, i64)> {
        (-2i64..12, -5i64..150)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! A store over fresh in-memory collaborators, and entity builders.

    use super::*;

    /// A store with handles on everything behind it.
    pub struct TestStore {
        pub store: Store,
        pub engine: InMemoryEngine,
        pub cache: Arc<InMemoryCacheBackend>,
        pub clock: Arc<ManualClock>,
    }

    impl TestStore {
        /// Build with default configuration and ensure indexes.
        pub async fn new() -> Self {
            Self::with_config(StoreConfig::default()).await
        }

        pub async fn with_config(config: StoreConfig) -> Self {
            let engine = InMemoryEngine::new();
            let cache = Arc::new(InMemoryCacheBackend::new());
            let clock = Arc::new(ManualClock::new(epoch()));
            let store = Store::new(
                Arc::new(engine.clone()),
                cache.clone(),
                clock.clone(),
                config,
            );
            if let Err(e) = store.ensure_indexes().await {
                panic!("ensure_indexes failed on a fresh engine: {e}");
            }
            Self {
                store,
                engine,
                cache,
                clock,
            }
        }

        pub fn now(&self) -> Timestamp {
            self.store.now()
        }

        /// Advance the store clock.
        pub fn advance(&self, by: chrono::Duration) {
            self.clock.advance(by);
        }

        /// Insert a user and a namespace they own.
        pub async fn seed_namespace(&self, name: &str) -> (User, Namespace) {
            let owner = user(name, self.now());
            if let Err(e) = self.store.user_create(&owner).await {
                panic!("seeding owner of {name} failed: {e}");
            }
            let ns = Namespace::new(name, owner.id, self.now());
            if let Err(e) = self.store.namespace_create(&ns).await {
                panic!("seeding namespace {name} failed: {e}");
            }
            (owner, ns)
        }

        /// Insert a pending device.
        pub async fn seed_device(&self, tenant_id: &str, name: &str) -> Device {
            let d = device(tenant_id, name, self.now());
            if let Err(e) = self.store.device_create(&d).await {
                panic!("seeding device {name} failed: {e}");
            }
            d
        }

        /// Raw document count of a collection.
        pub fn count(&self, collection: Collection) -> usize {
            self.engine.dump(collection).map(|d| d.len()).unwrap_or(0)
        }
    }

    /// A user whose username and email derive from `handle`.
    pub fn user(handle: &str, now: Timestamp) -> User {
        User::new(handle, handle, format!("{}@example.com", handle), now)
    }

    pub fn device(tenant_id: &str, name: &str, now: Timestamp) -> Device {
        Device::new(tenant_id, name, format!("aa:bb:{}", name), now)
    }

    pub fn member(user_id: UserId, role: MemberRole, now: Timestamp) -> Member {
        Member {
            user_id,
            role,
            added_at: now,
            expires_at: None,
            status: MemberStatus::Accepted,
        }
    }

    pub fn firewall_rule(tenant_id: &str, priority: i32, tags: &[&str]) -> FirewallRule {
        FirewallRule {
            id: uuid::Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            priority,
            action: RuleAction::Allow,
            active: true,
            source_ip: ".*".to_string(),
            username: ".*".to_string(),
            filter: TargetFilter {
                hostname: None,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        }
    }

    pub fn public_key(
        tenant_id: &str,
        fingerprint: &str,
        tags: &[&str],
        now: Timestamp,
    ) -> PublicKey {
        PublicKey {
            fingerprint: fingerprint.to_string(),
            tenant_id: tenant_id.to_string(),
            name: format!("key-{}", fingerprint),
            data: "ssh-ed25519 AAAA".to_string(),
            username: ".*".to_string(),
            filter: TargetFilter {
                hostname: None,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
            created_at: now,
        }
    }

    /// An open session on `device`, started now.
    pub fn session(uid: &str, device: &Device, now: Timestamp) -> Session {
        Session::new(uid, device, "root", "10.0.0.1", now)
    }

    pub fn event(event_type: &str, seat: i32, now: Timestamp) -> fleet_core::SessionEvent {
        fleet_core::SessionEvent {
            event_type: event_type.to_string(),
            seat,
            timestamp: now,
            data: serde_json::json!({}),
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over fleet error kinds.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &FleetResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert `NotFound` for `entity_type`, looking through aborted
    /// transactions.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &FleetResult<T>, entity_type: EntityType) {
        match result.as_ref().map_err(FleetError::root_cause) {
            Err(FleetError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    #[track_caller]
    pub fn assert_duplicate<T: std::fmt::Debug>(result: &FleetResult<T>) {
        match result {
            Err(e) if e.is_duplicate() => {}
            other => panic!("Expected Duplicate error, got: {:?}", other),
        }
    }

    /// Assert a `Conflict` naming exactly `fields`.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &FleetResult<T>, fields: &[&str]) {
        match result.as_ref().map_err(FleetError::root_cause) {
            Err(FleetError::Storage(StorageError::Conflict { fields: got, .. })) => {
                let got: Vec<&str> = got.iter().map(String::as_str).collect();
                assert_eq!(got, fields, "Wrong conflicting fields");
            }
            other => panic!("Expected Conflict error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &FleetResult<T>) {
        match result {
            Err(e) if e.is_validation() => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert a rolled-back cascade that failed at `step`.
    #[track_caller]
    pub fn assert_aborted_at<T: std::fmt::Debug>(result: &FleetResult<T>, step: &str) {
        match result {
            Err(FleetError::Storage(StorageError::TransactionAborted { step: got, .. })) => {
                assert_eq!(got, step, "Cascade aborted at the wrong step");
            }
            other => panic!("Expected TransactionAborted at '{}', got: {:?}", step, other),
        }
    }

    /// Assert the denormalized counters of `namespace` match `expected`,
    /// ordered pending, accepted, rejected, removed.
    #[track_caller]
    pub fn assert_device_counts(namespace: &Namespace, expected: [i64; 4]) {
        let got = DeviceStatus::ALL.map(|s| namespace.device_count(s));
        assert_eq!(got, expected, "Device counters of {} out of sync", namespace.name);
    }
}
