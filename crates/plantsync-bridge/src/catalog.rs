//! Catalog resolver: logical identities to dimension-table keys
//!
//! Dimension rows are created on first reference and never change afterwards,
//! so resolved ids are cached for the lifetime of the resolver.

use async_trait::async_trait;
use plantsync_common::AssetIdentity;
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog lookup failed: {0}")]
    Database(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Get-or-insert access to dimension keys. Implementations are safe to call
/// concurrently and create at most one row per key.
#[async_trait]
pub trait CatalogResolver: Send + Sync {
    async fn get_or_insert_asset(&self, identity: &AssetIdentity) -> CatalogResult<i32>;

    async fn get_or_insert_product_type(
        &self,
        asset_id: i32,
        external_product_id: &str,
        cycle_time_ms: i64,
    ) -> CatalogResult<i32>;

    /// Lookup only. `None` when the asset has not been seen yet.
    async fn find_asset(&self, identity: &AssetIdentity) -> CatalogResult<Option<i32>>;
}

/// PostgreSQL-backed resolver with its own in-memory caches
pub struct PgCatalog {
    pool: PgPool,
    assets: RwLock<HashMap<AssetIdentity, i32>>,
    product_types: RwLock<HashMap<(i32, String), i32>>,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            assets: RwLock::new(HashMap::new()),
            product_types: RwLock::new(HashMap::new()),
        }
    }

    async fn cached_asset(&self, identity: &AssetIdentity) -> Option<i32> {
        self.assets.read().await.get(identity).copied()
    }

    async fn select_asset(&self, identity: &AssetIdentity) -> CatalogResult<Option<i32>> {
        let id = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM assets WHERE customer = $1 AND location = $2 AND equipment = $3",
        )
        .bind(&identity.customer)
        .bind(&identity.location)
        .bind(&identity.equipment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl CatalogResolver for PgCatalog {
    async fn get_or_insert_asset(&self, identity: &AssetIdentity) -> CatalogResult<i32> {
        if let Some(id) = self.cached_asset(identity).await {
            return Ok(id);
        }

        sqlx::query(
            r#"
            INSERT INTO assets (customer, location, equipment)
            VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT asset_identity_uniq DO NOTHING
            "#,
        )
        .bind(&identity.customer)
        .bind(&identity.location)
        .bind(&identity.equipment)
        .execute(&self.pool)
        .await?;

        let id = self
            .select_asset(identity)
            .await?
            .ok_or(CatalogError::Database(sqlx::Error::RowNotFound))?;

        self.assets.write().await.insert(identity.clone(), id);
        tracing::debug!(asset = %identity, asset_id = id, "Asset resolved");
        Ok(id)
    }

    async fn get_or_insert_product_type(
        &self,
        asset_id: i32,
        external_product_id: &str,
        cycle_time_ms: i64,
    ) -> CatalogResult<i32> {
        let key = (asset_id, external_product_id.to_string());
        if let Some(id) = self.product_types.read().await.get(&key).copied() {
            return Ok(id);
        }

        // first writer wins the cycle time; later values are ignored
        let id: i32 = sqlx::query_scalar(
            r#"
            WITH inserted AS (
                INSERT INTO product_types (asset_id, external_product_id, cycle_time_ms)
                VALUES ($1, $2, $3)
                ON CONFLICT ON CONSTRAINT product_type_asset_uniq DO NOTHING
                RETURNING id
            )
            SELECT id FROM inserted
            UNION ALL
            SELECT id FROM product_types WHERE asset_id = $1 AND external_product_id = $2
            LIMIT 1
            "#,
        )
        .bind(asset_id)
        .bind(external_product_id)
        .bind(cycle_time_ms)
        .fetch_one(&self.pool)
        .await?;

        self.product_types.write().await.insert(key, id);
        tracing::debug!(asset_id, external_product_id, product_type_id = id, "Product type resolved");
        Ok(id)
    }

    async fn find_asset(&self, identity: &AssetIdentity) -> CatalogResult<Option<i32>> {
        if let Some(id) = self.cached_asset(identity).await {
            return Ok(Some(id));
        }

        let found = self.select_asset(identity).await?;
        if let Some(id) = found {
            self.assets.write().await.insert(identity.clone(), id);
        }
        Ok(found)
    }
}
