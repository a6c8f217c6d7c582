//! Instance-wide settings, kept as a single document.

use super::{find_one, Store};
use crate::cache::CacheAside;
use crate::cascade::Cascade;
use crate::document::{from_document, to_document};
use crate::engine::{Collection, Executor, Expr, TxnOptions, UpdateSpec};
use fleet_core::{EntityType, FleetResult, SystemSettings, SystemSettingsChanges};

const SETTINGS_ID: &str = "settings";

impl Store {
    /// Cache-aside read. Defaults are returned until settings are first
    /// written.
    pub async fn system_get(&self) -> FleetResult<SystemSettings> {
        let key = CacheAside::key_for::<SystemSettings>(SETTINGS_ID);
        self.cache
            .get_or_load(&key, self.config.settings_cache_ttl, || {
                load_settings(self.executor())
            })
            .await
    }

    /// Apply changes, creating the settings document if needed. Returns the
    /// settings as stored.
    pub async fn system_update(
        &self,
        changes: &SystemSettingsChanges,
    ) -> FleetResult<SystemSettings> {
        let changes = changes.clone();
        let settings = self
            .cascade("update system settings", TxnOptions::default(), move |c| {
                Box::pin(update_steps(c, changes))
            })
            .await?;

        self.cache
            .invalidate(&CacheAside::key_for::<SystemSettings>(SETTINGS_ID))
            .await;
        tracing::info!(?settings, "System settings updated");
        Ok(settings)
    }
}

async fn load_settings(exec: &dyn Executor) -> FleetResult<SystemSettings> {
    match find_one(exec, Collection::System, Expr::eq("id", SETTINGS_ID)).await? {
        Some(doc) => from_document(EntityType::SystemSettings, doc),
        None => Ok(SystemSettings::default()),
    }
}

async fn update_steps(c: &Cascade, changes: SystemSettingsChanges) -> FleetResult<SystemSettings> {
    c.step("upsert settings", |exec| upsert_settings(exec, &changes))
        .await
}

async fn upsert_settings(
    exec: &dyn Executor,
    changes: &SystemSettingsChanges,
) -> FleetResult<SystemSettings> {
    let mut settings = load_settings(exec).await?;
    if let Some(setup_done) = changes.setup_done {
        settings.setup_done = setup_done;
    }
    if let Some(signup_enabled) = changes.signup_enabled {
        settings.signup_enabled = signup_enabled;
    }
    if let Some(session_record_default) = changes.session_record_default {
        settings.session_record_default = session_record_default;
    }

    let mut doc = to_document(EntityType::SystemSettings, &settings, &[])?;
    let by_id = Expr::eq("id", SETTINGS_ID);
    let update = doc
        .iter()
        .fold(UpdateSpec::new(), |u, (field, value)| u.set(field.as_str(), value.clone()));
    let outcome = exec.update_one(Collection::System, &by_id, &update).await?;
    if outcome.matched == 0 {
        doc.insert("id".to_string(), SETTINGS_ID.into());
        exec.insert_one(Collection::System, doc).await?;
    }
    Ok(settings)
}
