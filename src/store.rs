use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::ast::SearchExpr;
use crate::error::Error;
use crate::plan::{Dialect, SelectPlan, SqlExpr};
use crate::value::Value;

/// One stored entity row: column name → value, in column order.
pub type Row = BTreeMap<String, Value>;

/// Errors surfaced by store implementations. The handler maps them onto the
/// HTTP error kinds.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("row not found")]
    NotFound,

    #[error("request canceled")]
    Canceled,

    #[error("store error: {0}")]
    Backend(String),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Error {
        match e {
            StoreError::Conflict(msg) => Error::conflict(msg),
            StoreError::NotFound => Error::not_found("entity does not exist"),
            StoreError::Canceled => Error::internal("request canceled"),
            StoreError::Backend(msg) => Error::internal(msg),
        }
    }
}

/// The relational storage capability. Implementations interpret the compiled
/// `SelectPlan` (directly, or via `plan::render_sql`); they own connection
/// pooling, SQL dialect details and statement timeouts.
#[async_trait]
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect {
        Dialect::default()
    }

    async fn query(&self, plan: &SelectPlan) -> Result<Vec<Row>, StoreError>;

    async fn count(&self, plan: &SelectPlan) -> Result<u64, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// A store transaction. Mutations run inside one; dropping without commit
/// must roll back.
#[async_trait]
pub trait StoreTx: Send {
    async fn query(&mut self, plan: &SelectPlan) -> Result<Vec<Row>, StoreError>;

    /// Insert and return the stored row including any generated columns.
    async fn insert(&mut self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Returns the number of affected rows.
    async fn update(
        &mut self,
        table: &str,
        predicate: &SqlExpr,
        changes: Row,
    ) -> Result<u64, StoreError>;

    async fn delete(&mut self, table: &str, predicate: &SqlExpr) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Optional full-text-search capability. Returns the matching key rows for
/// the set; absence makes the compiler fall back to bounded in-memory
/// matching.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, set: &str, query: &SearchExpr) -> Result<Vec<Row>, StoreError>;
}

/// Optional geospatial capability: compiles `geo.*` calls into predicate
/// expressions. Without it, geo functions answer 501.
pub trait GeospatialBackend: Send + Sync {
    fn compile(&self, name: &str, args: &[SqlExpr]) -> Result<SqlExpr, Error>;
}

/// Optional key generation for creates where the store does not assign keys.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, set: &str) -> Result<Value, StoreError>;
}

/// Replaces the built-in CRUD persistence for selected sets. Implementations
/// must keep the handler contract: create returns the stored row, update
/// returns the updated row, delete fails with `NotFound` for missing keys.
#[async_trait]
pub trait EntityOverwriteProvider: Send + Sync {
    async fn create(&self, set: &str, row: Row) -> Result<Row, StoreError>;

    async fn update(&self, set: &str, key: Row, changes: Row) -> Result<Row, StoreError>;

    async fn delete(&self, set: &str, key: Row) -> Result<(), StoreError>;
}
