//! PostgreSQL store backed by a sqlx pool

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgTypeInfo};
use sqlx::{Executor, PgPool, Postgres};
use tracing::{debug, info};

use super::{Row, Statement, Store, StoreError, Transaction};
use crate::config::PostgresConfig;

const SELECT_ASSET_ID: &str =
    "SELECT id FROM assetTable WHERE customer = $1 AND location = $2 AND assetID = $3";

const SELECT_PRODUCT_ID: &str =
    "SELECT product_id FROM productTable WHERE product_name = $1 AND asset_id = $2";

fn to_surrogate(id: i32) -> Result<u32, StoreError> {
    u32::try_from(id).map_err(|_| StoreError::IdOutOfRange(id as i64))
}

/// Process-wide connection pool
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect the pool and verify one connection can be acquired
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(ref password) = config.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self { pool })
    }

    /// Wrap an already configured pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn asset_id(
        &self,
        customer_id: &str,
        location: &str,
        asset_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        let id: Option<i32> = sqlx::query_scalar(SELECT_ASSET_ID)
            .bind(customer_id)
            .bind(location)
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?;

        id.map(to_surrogate).transpose()
    }

    async fn product_id(&self, product: &str, asset_id: u32) -> Result<Option<u32>, StoreError> {
        let id: Option<i32> = sqlx::query_scalar(SELECT_PRODUCT_ID)
            .bind(product)
            .bind(i64::from(asset_id))
            .fetch_optional(&self.pool)
            .await?;

        id.map(to_surrogate).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn prepare(&mut self, statement: Statement) -> Result<(), StoreError> {
        // Lands in the connection's statement cache; execute reuses it, so the
        // declared types must be the ones execute binds
        let types: Vec<PgTypeInfo> = statement
            .param_types()
            .iter()
            .map(|&name| PgTypeInfo::with_name(name))
            .collect();
        (&mut *self.tx)
            .prepare_with(statement.sql(), &types)
            .await?;
        Ok(())
    }

    async fn execute(&mut self, row: &Row) -> Result<u64, StoreError> {
        let query = sqlx::query(row.statement().sql());
        let query = match row {
            Row::Count {
                asset_id,
                count,
                scrap,
                timestamp_ms,
            } => query
                .bind(i64::from(*asset_id))
                .bind(i64::from(*count))
                .bind(i64::from(*scrap))
                .bind(*timestamp_ms),
            Row::UniqueProduct {
                asset_id,
                begin_timestamp_ms,
                end_timestamp_ms,
                product_id,
                is_scrap,
                alternative_id,
            } => query
                .bind(i64::from(*asset_id))
                .bind(*begin_timestamp_ms)
                .bind(*end_timestamp_ms)
                .bind(i64::from(*product_id))
                .bind(*is_scrap)
                .bind(alternative_id.as_str()),
            Row::ScrapUniqueProduct {
                asset_id,
                alternative_id,
            } => query.bind(alternative_id.as_str()).bind(i64::from(*asset_id)),
            Row::State {
                asset_id,
                timestamp_ms,
                state,
            } => query
                .bind(*timestamp_ms)
                .bind(i64::from(*asset_id))
                .bind(i64::from(*state)),
        };

        let result = query.execute(&mut *self.tx).await?;
        debug!(
            "{:?} affected {} row(s)",
            row.statement(),
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
