//! Server backend entry points.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DbResult;
use crate::postgres::config::PostgresConfig;
use crate::postgres::database::PostgresStore;
use crate::traits::{Backend, BackendStore, OpenSpec, PoolOptions, ProvisionSpec, SchemaConfig};

/// Backend for `postgres://` and `postgresql://` URIs.
pub struct PostgresBackend;

#[async_trait]
impl Backend for PostgresBackend {
    async fn provision(&self, uri: &str, spec: &ProvisionSpec) -> DbResult<Arc<dyn BackendStore>> {
        debug!(recreate = spec.recreate, release = %spec.release_number, "provisioning postgres backend");
        let config = PostgresConfig::from_uri(uri, spec.schema_config, &spec.pool)?;
        let (pool, profile, release) = config
            .provision(spec.profile.as_deref(), spec.recreate, &spec.release_number)
            .await?;
        let store = PostgresStore::initialize(pool, config, profile, release).await?;
        Ok(Arc::new(store))
    }

    async fn open(&self, uri: &str, spec: &OpenSpec) -> DbResult<Arc<dyn BackendStore>> {
        debug!(target = ?spec.target_release, "opening postgres backend");
        let config = PostgresConfig::from_uri(uri, SchemaConfig::Generic, &spec.pool)?;
        let (pool, profile, release) = config
            .open(spec.profile.as_deref(), spec.target_release.as_deref())
            .await?;
        let store = PostgresStore::initialize(pool, config, profile, release).await?;
        Ok(Arc::new(store))
    }

    async fn remove(&self, uri: &str) -> DbResult<bool> {
        let config = PostgresConfig::from_uri(uri, SchemaConfig::Generic, &PoolOptions::default())?;
        config.remove().await
    }

    async fn migrate(&self, uri: &str, target_release: &str) -> DbResult<()> {
        let config = PostgresConfig::from_uri(uri, SchemaConfig::Generic, &PoolOptions::default())?;
        config.migrate(target_release).await
    }
}
