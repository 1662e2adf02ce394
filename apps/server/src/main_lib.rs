//! Application state wiring.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use edgesync_cloud_store::CloudStore;
use edgesync_core::sync::{SyncContext, SyncService, SyncSettings, TableRegistry};
use edgesync_storage_sqlite::{create_pool, init, run_migrations, spawn_writer, SqliteStore};

use crate::config::Config;

/// Shared by every handler and the background scheduler.
pub struct AppState {
    pub local: Arc<SqliteStore>,
    /// `None` when the cloud store is not configured.
    pub sync: Option<Arc<SyncService>>,
    pub admin_token: Option<String>,
}

/// Opens the local database, applies migrations and builds both stores once.
pub fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let db_path = init(&config.database_path).context("Failed to prepare database path")?;
    run_migrations(&db_path).context("Failed to run database migrations")?;
    let pool = create_pool(&db_path).context("Failed to open database pool")?;
    let writer = spawn_writer(pool.as_ref().clone());
    let local = Arc::new(SqliteStore::new(pool, writer));
    info!("Local store ready at {}", db_path);

    let sync = match &config.cloud {
        Some(cloud) => {
            let registry = Arc::new(TableRegistry::default());
            let cloud_store = CloudStore::new(&cloud.url, &cloud.service_key, config.store_timeout)
                .context("Failed to build cloud store client")?
                .with_primary_keys(registry.primary_keys());
            let settings = SyncSettings {
                store_timeout: config.store_timeout,
                ..SyncSettings::default()
            };
            let ctx = SyncContext::new(
                local.clone(),
                Arc::new(cloud_store),
                registry,
                settings,
            );
            info!("Cloud sync enabled against {}", cloud.url);
            Some(Arc::new(SyncService::new(ctx)))
        }
        None => {
            warn!("Cloud store not configured; edge-to-cloud sync is disabled");
            None
        }
    };

    Ok(AppState {
        local,
        sync,
        admin_token: config.admin_token.clone(),
    })
}
