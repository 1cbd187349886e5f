//! Relational Store
//!
//! Lookups of surrogate ids and deadline-friendly transactions. Handlers only
//! see the [`Store`] and [`Transaction`] traits; [`PostgresStore`] backs them
//! in production and [`MemoryStore`] in tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use thiserror::Error;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Store is closed or otherwise unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored id does not fit the surrogate id type
    #[error("id out of range: {0}")]
    IdOutOfRange(i64),
}

/// Parameterized write statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    InsertCount,
    InsertUniqueProduct,
    ScrapUniqueProduct,
    InsertState,
}

impl Statement {
    /// SQL text. Inserts ignore conflicts on natural keys so redelivery is harmless.
    ///
    /// Every parameter carries an explicit cast matching [`Statement::param_types`].
    pub fn sql(&self) -> &'static str {
        match self {
            Statement::InsertCount => {
                "INSERT INTO countTable (timestamp, asset_id, count, scrap) \
                 VALUES (to_timestamp($4::int8 / 1000.0), $1::int8, $2::int8, $3::int8) \
                 ON CONFLICT DO NOTHING"
            }
            Statement::InsertUniqueProduct => {
                "INSERT INTO uniqueProductTable \
                 (asset_id, begin_timestamp_ms, end_timestamp_ms, product_id, is_scrap, uniqueProductAlternativeID) \
                 VALUES ($1::int8, to_timestamp($2::int8 / 1000.0), to_timestamp($3::int8 / 1000.0), \
                 $4::int8, $5::bool, $6::text) \
                 ON CONFLICT DO NOTHING"
            }
            Statement::ScrapUniqueProduct => {
                "UPDATE uniqueProductTable SET is_scrap = true \
                 WHERE uniqueProductAlternativeID = $1::text AND asset_id = $2::int8"
            }
            Statement::InsertState => {
                "INSERT INTO stateTable (timestamp, asset_id, state) \
                 VALUES (to_timestamp($1::int8 / 1000.0), $2::int8, $3::int8) \
                 ON CONFLICT DO NOTHING"
            }
        }
    }

    /// Postgres type names of `$1..$n`, in order. Execution binds exactly these.
    pub fn param_types(&self) -> &'static [&'static str] {
        match self {
            Statement::InsertCount => &["INT8", "INT8", "INT8", "INT8"],
            Statement::InsertUniqueProduct => &["INT8", "INT8", "INT8", "INT8", "BOOL", "TEXT"],
            Statement::ScrapUniqueProduct => &["TEXT", "INT8"],
            Statement::InsertState => &["INT8", "INT8", "INT8"],
        }
    }
}

/// Bound parameters for one statement execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Count {
        asset_id: u32,
        count: u32,
        scrap: u32,
        timestamp_ms: i64,
    },
    UniqueProduct {
        asset_id: u32,
        begin_timestamp_ms: i64,
        /// Still running products have no end
        end_timestamp_ms: Option<i64>,
        product_id: u32,
        is_scrap: bool,
        alternative_id: String,
    },
    ScrapUniqueProduct {
        asset_id: u32,
        alternative_id: String,
    },
    State {
        asset_id: u32,
        timestamp_ms: i64,
        state: u32,
    },
}

impl Row {
    pub fn statement(&self) -> Statement {
        match self {
            Row::Count { .. } => Statement::InsertCount,
            Row::UniqueProduct { .. } => Statement::InsertUniqueProduct,
            Row::ScrapUniqueProduct { .. } => Statement::ScrapUniqueProduct,
            Row::State { .. } => Statement::InsertState,
        }
    }
}

/// Read access and transaction factory
#[async_trait]
pub trait Store: Send + Sync {
    /// Surrogate id of a registered asset, `None` if not registered
    async fn asset_id(
        &self,
        customer_id: &str,
        location: &str,
        asset_id: &str,
    ) -> Result<Option<u32>, StoreError>;

    /// Surrogate id of a product on an asset, `None` if not registered
    async fn product_id(&self, product: &str, asset_id: u32) -> Result<Option<u32>, StoreError>;

    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Release all connections. Further calls fail.
    async fn close(&self);
}

/// An open transaction.
///
/// Dropping it without commit rolls back.
#[async_trait]
pub trait Transaction: Send {
    /// Prepare a statement on the transaction's connection
    async fn prepare(&mut self, statement: Statement) -> Result<(), StoreError>;

    /// Execute the row's statement, returning affected rows
    async fn execute(&mut self, row: &Row) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
