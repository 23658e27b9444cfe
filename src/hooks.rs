use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;

use crate::ast::Expr;
use crate::error::{Error, Result};
use crate::store::{Row, StoreTx};

/// The authenticated caller, as established by the pre-request hook.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
    pub claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Principal {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// The operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadCollection,
    ReadEntity,
    Create,
    Update,
    Delete,
    Invoke,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Decision {
        Decision::Deny {
            reason: reason.into(),
        }
    }

    /// Translate a denial: 401 for anonymous callers, 403 for authenticated
    /// ones. The reason never leaks entity existence beyond the message the
    /// policy chose.
    pub fn into_result(self, principal: Option<&Principal>) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny { reason } => {
                if principal.is_some() {
                    Err(Error::Forbidden { message: reason })
                } else {
                    Err(Error::Unauthenticated { message: reason })
                }
            }
        }
    }
}

/// Authorization policy plus the optional query-filter provider attached to
/// it. Checked before every operation.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        set: &str,
        operation: Operation,
    ) -> Decision;

    /// Extra filter conjoined into every read of the set.
    fn query_filter(&self, _principal: Option<&Principal>, _set: &str) -> Option<Expr> {
        None
    }
}

/// Default policy: everything is allowed.
pub struct AllowAll;

#[async_trait]
impl Policy for AllowAll {
    async fn authorize(
        &self,
        _principal: Option<&Principal>,
        _set: &str,
        _operation: Operation,
    ) -> Decision {
        Decision::Allow
    }
}

/// Service-wide pre-request hook: authenticates the caller and may reject
/// the request outright.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, parts: &Parts) -> Result<Option<Principal>>;
}

/// Context handed to lifecycle hooks. Mutation hooks receive the live
/// transaction so extra queries land in the same commit.
pub struct HookContext<'a> {
    pub set: &'a str,
    pub principal: Option<&'a Principal>,
    pub tx: Option<&'a mut (dyn StoreTx + 'static)>,
}

/// Per-entity-set lifecycle hooks. Before-hooks run inside the operation and
/// may abort with a typed error (its status is honored verbatim) or
/// contribute extra read scopes; after-hooks observe the committed result
/// and cannot abort.
#[async_trait]
pub trait EntityHooks: Send + Sync {
    async fn before_read_collection(
        &self,
        _ctx: &mut HookContext<'_>,
    ) -> Result<Option<Expr>> {
        Ok(None)
    }

    async fn before_read_entity(
        &self,
        _ctx: &mut HookContext<'_>,
        _key: &Row,
    ) -> Result<Option<Expr>> {
        Ok(None)
    }

    async fn before_create(&self, _ctx: &mut HookContext<'_>, _entity: &mut Row) -> Result<()> {
        Ok(())
    }

    async fn before_update(
        &self,
        _ctx: &mut HookContext<'_>,
        _key: &Row,
        _changes: &mut Row,
    ) -> Result<()> {
        Ok(())
    }

    async fn before_delete(&self, _ctx: &mut HookContext<'_>, _key: &Row) -> Result<()> {
        Ok(())
    }

    async fn after_read_collection(&self, _ctx: &mut HookContext<'_>, _rows: &[Row]) {}

    async fn after_read_entity(&self, _ctx: &mut HookContext<'_>, _row: &Row) {}

    async fn after_create(&self, _ctx: &mut HookContext<'_>, _entity: &Row) {}

    async fn after_update(&self, _ctx: &mut HookContext<'_>, _entity: &Row) {}

    async fn after_delete(&self, _ctx: &mut HookContext<'_>, _key: &Row) {}
}

/// Convenience constructor for hook errors whose status must be honored.
pub fn hook_error(status: u16, code: impl Into<String>, message: impl Into<String>) -> Error {
    Error::Hook {
        status,
        code: code.into(),
        message: message.into(),
    }
}
