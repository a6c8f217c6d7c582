//! Property-Based Tests for List Pagination
//!
//! **Property: Pages Partition The Result Set**
//!
//! For any set of devices and any page size, walking every page of a list
//! returns each matching device exactly once, and every page reports the
//! same total.

use fleet_storage::{QueryOption, SortOrder};
use fleet_test_utils::fixtures::TestStore;
use fleet_test_utils::generators::arb_page_request;
use proptest::prelude::*;
use std::collections::HashSet;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

async fn seeded(count: usize, other_tenant: usize) -> (TestStore, String) {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let (_, other) = t.seed_namespace("globex").await;
    for i in 0..count {
        t.seed_device(&ns.tenant_id, &format!("dev-{i:02}")).await;
    }
    for i in 0..other_tenant {
        t.seed_device(&other.tenant_id, &format!("dev-{i:02}")).await;
    }
    (t, ns.tenant_id)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every device appears on exactly one page. Devices share `last_seen`,
    /// so this also exercises the unique tiebreak.
    #[test]
    fn prop_pages_are_disjoint_and_complete(
        count in 0usize..23,
        other_tenant in 0usize..4,
        per_page in 1i64..8,
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (t, tenant_id) = seeded(count, other_tenant).await;

            let mut seen = HashSet::new();
            let mut page = 1;
            loop {
                let options = [
                    QueryOption::match_tenant(tenant_id.clone()),
                    QueryOption::paginate(page, per_page),
                ];
                let (devices, total) = t.store.device_list(&options).await.unwrap();
                prop_assert_eq!(total, count as u64);
                prop_assert!(devices.len() as i64 <= per_page);
                if devices.is_empty() {
                    break;
                }
                for device in devices {
                    prop_assert_eq!(device.tenant_id.as_str(), tenant_id.as_str());
                    prop_assert!(seen.insert(device.uid), "device listed on two pages");
                }
                page += 1;
            }
            prop_assert_eq!(seen.len(), count);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Out-of-range page requests are normalized rather than rejected.
    #[test]
    fn prop_any_page_request_is_served((page, per_page) in arb_page_request()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (t, tenant_id) = seeded(5, 0).await;
            let options = [
                QueryOption::match_tenant(tenant_id),
                QueryOption::paginate(page, per_page),
                QueryOption::sort("name", SortOrder::Asc),
            ];
            let (devices, total) = t.store.device_list(&options).await.unwrap();
            prop_assert_eq!(total, 5);
            prop_assert!(devices.len() <= 5);
            let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
            let mut sorted = names.clone();
            sorted.sort_unstable();
            prop_assert_eq!(names, sorted);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn test_unpaginated_list_returns_everything() {
    let (t, tenant_id) = seeded(12, 3).await;
    let (devices, total) = t
        .store
        .device_list(&[QueryOption::match_tenant(tenant_id)])
        .await
        .unwrap();
    assert_eq!(total, 12);
    assert_eq!(devices.len(), 12);

    let (_, all) = t.store.device_list(&[]).await.unwrap();
    assert_eq!(all, 15);
}
