//! Derived presence state.
//!
//! "Online" is never stored. It is recomputed on every read, from
//! `last_seen` and `disconnected_at`, against the store clock. Namespace
//! device counters are the opposite trade-off: stored, adjusted on status
//! transitions, and repaired from the devices collection on demand.

use crate::engine::{Computed, Stage, UpdateSpec};
use fleet_core::{Device, DeviceStatus, Timestamp};

/// Earliest `last_seen` that still counts as online at `now`.
pub fn online_cutoff(now: Timestamp, window: chrono::Duration) -> Timestamp {
    now - window
}

/// A device is online iff it has not disconnected and was seen within
/// `window` of `now`.
pub fn is_online(
    last_seen: Timestamp,
    disconnected_at: Option<Timestamp>,
    now: Timestamp,
    window: chrono::Duration,
) -> bool {
    disconnected_at.is_none() && last_seen >= online_cutoff(now, window)
}

/// Recompute `online` on an already-loaded device.
pub fn refresh_online(device: &mut Device, now: Timestamp, window: chrono::Duration) {
    device.online = is_online(device.last_seen, device.disconnected_at, now, window);
}

/// Pipeline stage computing `online` for device documents.
pub fn online_stage(now: Timestamp, window: chrono::Duration) -> Stage {
    Stage::Set {
        field: "online".to_string(),
        value: Computed::Online {
            last_seen: "last_seen".to_string(),
            disconnected_at: "disconnected_at".to_string(),
            cutoff: online_cutoff(now, window),
        },
    }
}

/// Namespace field holding the device counter for a status.
pub fn counter_field(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::Accepted => "devices_accepted_count",
        DeviceStatus::Pending => "devices_pending_count",
        DeviceStatus::Rejected => "devices_rejected_count",
        DeviceStatus::Removed => "devices_removed_count",
    }
}

/// Counter adjustment for a device moving from `from` to `to`. `None` on
/// either side means the device is being created or deleted. Returns
/// `None` when nothing changes.
pub fn counter_transition(
    from: Option<DeviceStatus>,
    to: Option<DeviceStatus>,
) -> Option<UpdateSpec> {
    if from == to {
        return None;
    }
    let mut update = UpdateSpec::new();
    if let Some(old) = from {
        update = update.inc(counter_field(old), -1);
    }
    if let Some(new) = to {
        update = update.inc(counter_field(new), 1);
    }
    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UpdateOp;
    use chrono::{Duration, Utc};

    fn window() -> Duration {
        Duration::minutes(2)
    }

    #[test]
    fn test_presence_window() {
        let now = Utc::now();
        assert!(is_online(now - Duration::seconds(90), None, now, window()));
        assert!(!is_online(now - Duration::seconds(180), None, now, window()));
        assert!(!is_online(now, Some(now), now, window()));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let now = Utc::now();
        assert!(is_online(now - window(), None, now, window()));
    }

    #[test]
    fn test_refresh_online_overrides_stale_flag() {
        let now = Utc::now();
        let mut device = Device::new("t1", "web", "aa:bb", now - Duration::minutes(10));
        device.online = true;
        refresh_online(&mut device, now, window());
        assert!(!device.online);
    }

    #[test]
    fn test_counter_transition() {
        assert!(
            counter_transition(Some(DeviceStatus::Pending), Some(DeviceStatus::Pending)).is_none()
        );

        let accept =
            counter_transition(Some(DeviceStatus::Pending), Some(DeviceStatus::Accepted)).unwrap();
        assert_eq!(
            accept.ops(),
            &[
                UpdateOp::Inc("devices_pending_count".into(), -1),
                UpdateOp::Inc("devices_accepted_count".into(), 1),
            ]
        );

        let created = counter_transition(None, Some(DeviceStatus::Pending)).unwrap();
        assert_eq!(created.ops().len(), 1);
    }
}
