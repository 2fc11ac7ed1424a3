//! Embedded backend entry points.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DbResult;
use crate::sqlite::config::SqliteConfig;
use crate::sqlite::database::SqliteStore;
use crate::traits::{Backend, BackendStore, OpenSpec, PoolOptions, ProvisionSpec, SchemaConfig};

/// Backend for `sqlite://` URIs.
pub struct SqliteBackend;

#[async_trait]
impl Backend for SqliteBackend {
    async fn provision(&self, uri: &str, spec: &ProvisionSpec) -> DbResult<Arc<dyn BackendStore>> {
        debug!(uri, recreate = spec.recreate, release = %spec.release_number, "provisioning sqlite backend");
        let config = SqliteConfig::from_uri(
            uri,
            spec.pass_key.clone(),
            spec.schema_config,
            &spec.pool,
        )?;
        let (pool, profile, release) = config
            .provision(spec.profile.as_deref(), spec.recreate, &spec.release_number)
            .await?;
        let store = SqliteStore::initialize(pool, config, profile, release).await?;
        Ok(Arc::new(store))
    }

    async fn open(&self, uri: &str, spec: &OpenSpec) -> DbResult<Arc<dyn BackendStore>> {
        debug!(uri, target = ?spec.target_release, "opening sqlite backend");
        let config = SqliteConfig::from_uri(
            uri,
            spec.pass_key.clone(),
            SchemaConfig::Generic,
            &spec.pool,
        )?;
        let (pool, profile, release) = config
            .open(spec.profile.as_deref(), spec.target_release.as_deref())
            .await?;
        let store = SqliteStore::initialize(pool, config, profile, release).await?;
        Ok(Arc::new(store))
    }

    async fn remove(&self, uri: &str) -> DbResult<bool> {
        let config = SqliteConfig::from_uri(uri, None, SchemaConfig::Generic, &PoolOptions::default())?;
        config.remove().await
    }

    async fn migrate(&self, uri: &str, target_release: &str) -> DbResult<()> {
        let config = SqliteConfig::from_uri(uri, None, SchemaConfig::Generic, &PoolOptions::default())?;
        config.migrate(target_release).await
    }
}
