use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::Response;

use crate::ast::{Expr, QueryOptions};
use crate::changes::{ChangeOperation, change_log_row, decode_delta_token, encode_delta_token};
use crate::compiler::{
    CompileConfig, CompiledQuery, EntityResult, SearchStrategy, compile, encode_skiptoken,
    run_expands, search_match,
};
use crate::error::{Error, Result};
use crate::hooks::{HookContext, Operation};
use crate::metadata::{EntityMetadata, NavigationMetadata, OnDelete, PropertyMetadata};
use crate::plan::{SelectPlan, SqlExpr};
use crate::router::RequestContext;
use crate::serialize::{CollectionOptions, MetadataLevel, Serializer, entity_etag};
use crate::service::ServiceInner;
use crate::store::{Row, StoreTx};
use crate::url::{UrlComponents, canonical_url, parse_path, parse_query_pairs, resolve_key};
use crate::value::{EdmType, Value};

/// Per-entity-set request handler: resolves the URL shape to one operation
/// and drives authorize → hooks → persistence → change log → serialization.
pub(crate) struct EntityHandler<'a> {
    pub svc: &'a ServiceInner,
    pub ctx: &'a RequestContext,
}

/// A mutation's transaction: owned for plain requests, borrowed from the
/// changeset for batch members. Shared scopes never commit or roll back
/// here; the batch executor ends the transaction for the whole group.
enum TxScope {
    Owned(Box<dyn StoreTx>),
    Shared(tokio::sync::OwnedMutexGuard<Box<dyn StoreTx>>),
}

impl TxScope {
    fn tx(&mut self) -> &mut (dyn StoreTx + 'static) {
        match self {
            TxScope::Owned(tx) => tx.as_mut(),
            TxScope::Shared(guard) => guard.as_mut(),
        }
    }

    async fn commit(self) -> Result<()> {
        match self {
            TxScope::Owned(tx) => Ok(tx.commit().await?),
            TxScope::Shared(_) => Ok(()),
        }
    }

    async fn rollback(self) -> Result<()> {
        match self {
            TxScope::Owned(tx) => Ok(tx.rollback().await?),
            TxScope::Shared(_) => Ok(()),
        }
    }
}

impl EntityHandler<'_> {
    pub async fn handle(
        &self,
        method: &Method,
        url: &UrlComponents,
        options: QueryOptions,
        raw_query: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response> {
        let meta = self
            .svc
            .model
            .set(&url.entity_set)
            .ok_or_else(|| Error::not_found(format!("unknown entity set {}", url.entity_set)))?;

        if !meta.method_allowed(method.as_str()) {
            return Err(Error::MethodNotAllowed {
                allowed: allowed_methods(meta),
            });
        }

        let keyed = url.key.is_some() || meta.is_singleton;
        match method.as_str() {
            "GET" if !keyed && url.is_count => {
                self.count(meta, &options, url.type_cast.as_deref()).await
            }
            "GET" if !keyed => {
                if options.delta_token.is_some() {
                    self.delta_feed(meta, &options).await
                } else {
                    self.list(meta, &options, raw_query, None, url.type_cast.as_deref())
                        .await
                }
            }
            "GET" => self.keyed_get(meta, url, &options, raw_query, headers).await,
            "POST" if !keyed => self.create(meta, body).await,
            "POST" if url.is_ref => self.bind_ref(meta, url, body).await,
            "PATCH" | "PUT" if keyed && url.segments.is_empty() => {
                self.update(meta, url, headers, body, *method == Method::PATCH)
                    .await
            }
            "PUT" if keyed && url.is_value && !url.segments.is_empty() => {
                self.write_stream(meta, url, headers, body).await
            }
            "DELETE" if keyed && url.is_ref => self.unbind_ref(meta, url).await,
            "DELETE" if keyed && url.segments.is_empty() => {
                self.delete(meta, url, headers).await
            }
            _ => Err(Error::MethodNotAllowed {
                allowed: allowed_methods(meta),
            }),
        }
    }

    // ───────────────────────── reads ─────────────────────────

    async fn list(
        &self,
        meta: &EntityMetadata,
        options: &QueryOptions,
        raw_query: &str,
        base_predicate: Option<SqlExpr>,
        type_cast: Option<&str>,
    ) -> Result<Response> {
        self.authorize(meta, Operation::ReadCollection).await?;
        let scopes = self.read_scopes(meta, Operation::ReadCollection).await?;

        let started = Instant::now();
        let compiled = self.compile_query(meta, options, base_predicate, &scopes, type_cast)?;
        let compile_ms = started.elapsed().as_secs_f64() * 1000.0;

        let exec_started = Instant::now();
        let (results, truncated, count) = self.execute_list(meta, options, &compiled).await?;
        let exec_ms = exec_started.elapsed().as_secs_f64() * 1000.0;

        if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
            let rows: Vec<Row> = results.iter().map(|r| r.row.clone()).collect();
            let mut hook_ctx = self.hook_ctx(meta, None);
            hooks.after_read_collection(&mut hook_ctx, &rows).await;
        }

        if compiled.is_aggregate {
            let rows: Vec<Row> = results.into_iter().map(|r| r.row).collect();
            let body = self.serializer().aggregate_collection(meta, &rows);
            return self.json_response(StatusCode::OK, &body, &[("Server-Timing", &timing(compile_ms, exec_ms))]);
        }

        let next_link = if truncated {
            results
                .last()
                .and_then(|last| {
                    encode_skiptoken(&self.svc.signer, &compiled.cursor, &last.row)
                })
                .map(|token| self.next_link(meta, raw_query, &token))
        } else {
            None
        };
        let delta_link = if self.ctx.prefer.track_changes && self.svc.tracker.enabled() {
            let token = encode_delta_token(&self.svc.signer, self.svc.tracker.current_sequence());
            Some(format!(
                "{}/{}?$deltatoken={}",
                self.ctx.base,
                meta.set_name,
                urlencoding::encode(&token)
            ))
        } else {
            None
        };

        let body = self.serializer().collection(
            meta,
            &results,
            &CollectionOptions {
                count,
                next_link,
                delta_link,
            },
        )?;
        let timing_value = timing(compile_ms, exec_ms);
        let mut extra: Vec<(&str, &str)> = vec![("Server-Timing", timing_value.as_str())];
        let applied;
        if self.ctx.prefer.max_page_size.is_some() || self.ctx.prefer.track_changes {
            applied = applied_preferences(&self.ctx.prefer);
            extra.push(("Preference-Applied", applied.as_str()));
        }
        self.json_response(StatusCode::OK, &body, &extra)
    }

    async fn keyed_get(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        options: &QueryOptions,
        raw_query: &str,
        headers: &HeaderMap,
    ) -> Result<Response> {
        if let Some(first) = url.segments.first() {
            if let Some(nav) = meta.find_navigation(&first.name).cloned() {
                return self.navigation_get(meta, url, &nav, options, raw_query).await;
            }
            if meta.find_property(&first.name).is_some() {
                return self.property_get(meta, url, &first.name).await;
            }
            return Err(Error::not_found(format!(
                "{} is neither a property nor a navigation of {}",
                first.name, meta.set_name
            )));
        }
        if url.is_ref {
            let row = self.fetch_one(meta, url).await?;
            let body = self.serializer().reference(meta, &row.row)?;
            return self.json_response(StatusCode::OK, &body, &[]);
        }
        self.read(meta, url, options, headers).await
    }

    async fn read(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        options: &QueryOptions,
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.authorize(meta, Operation::ReadEntity).await?;
        let mut scopes = self.read_scopes(meta, Operation::ReadEntity).await?;
        if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
            let key_row = self.key_row(meta, url)?;
            let mut hook_ctx = self.hook_ctx(meta, None);
            if let Some(scope) = hooks.before_read_entity(&mut hook_ctx, &key_row).await? {
                scopes.push(scope);
            }
        }

        let base = self.key_predicate(meta, url)?;
        let compiled =
            self.compile_query(meta, options, Some(base), &scopes, url.type_cast.as_deref())?;
        let rows = self.svc.store.query(&compiled.plan).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("entity does not exist"))?;

        let etag = entity_etag(meta, &row);
        if let (Some(etag), Some(if_none)) = (&etag, headers.get(header::IF_NONE_MATCH)) {
            if if_none.to_str().is_ok_and(|v| v == etag || v == "*") {
                return Ok(Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header("OData-Version", &self.ctx.version)
                    .body(Body::empty())
                    .unwrap_or_default());
            }
        }

        let mut results = run_expands(self.svc.store.as_ref(), &compiled.expands, vec![row]).await?;
        let result = results.remove(0);

        if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
            let mut hook_ctx = self.hook_ctx(meta, None);
            hooks.after_read_entity(&mut hook_ctx, &result.row).await;
        }

        let body = self
            .serializer()
            .entity(meta, &result, url.type_cast.is_some())?;
        let mut extra: Vec<(&str, &str)> = Vec::new();
        if let Some(etag) = &etag {
            extra.push(("ETag", etag.as_str()));
        }
        self.json_response(StatusCode::OK, &body, &extra)
    }

    async fn count(
        &self,
        meta: &EntityMetadata,
        options: &QueryOptions,
        type_cast: Option<&str>,
    ) -> Result<Response> {
        self.authorize(meta, Operation::ReadCollection).await?;
        let scopes = self.read_scopes(meta, Operation::ReadCollection).await?;
        let compiled = self.compile_query(meta, options, None, &scopes, type_cast)?;
        let count = match &compiled.search {
            SearchStrategy::None => {
                let plan = compiled
                    .count_plan
                    .as_ref()
                    .ok_or_else(|| Error::internal("missing count plan"))?;
                self.svc.store.count(plan).await?
            }
            _ => {
                let (results, _, _) = self.execute_list(meta, options, &compiled).await?;
                results.len() as u64
            }
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header("OData-Version", &self.ctx.version)
            .body(Body::from(count.to_string()))
            .unwrap_or_default())
    }

    async fn navigation_get(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        nav: &NavigationMetadata,
        options: &QueryOptions,
        raw_query: &str,
    ) -> Result<Response> {
        let target = self
            .svc
            .model
            .set(&nav.target)
            .ok_or_else(|| Error::internal("dangling navigation target"))?;
        let parent = self.fetch_one(meta, url).await?;

        // Child predicate from the parent's foreign-key values.
        let mut predicate: Option<SqlExpr> = None;
        for (from, to) in &nav.foreign_keys {
            let from_col = column_of(meta, from)?;
            let to_col = column_of(target, to)?;
            let value = parent.row_value(&from_col);
            let pair = SqlExpr::eq(
                SqlExpr::qualified(target.table.clone(), to_col),
                SqlExpr::Literal(value),
            );
            predicate = Some(match predicate {
                Some(acc) => SqlExpr::and(acc, pair),
                None => pair,
            });
        }
        let predicate =
            predicate.ok_or_else(|| Error::validation("navigation declares no foreign keys"))?;

        if url.is_ref {
            let compiled = self.compile_query(target, options, Some(predicate), &[], None)?;
            let rows = self.svc.store.query(&compiled.plan).await?;
            let serializer = self.serializer();
            let body = if nav.collection {
                serializer.reference_collection(target, &rows)?
            } else {
                let row = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found("no related entity"))?;
                serializer.reference(target, &row)?
            };
            return self.json_response(StatusCode::OK, &body, &[]);
        }

        if url.is_count {
            let compiled = self.compile_query(target, options, Some(predicate), &[], None)?;
            let plan = compiled
                .count_plan
                .ok_or_else(|| Error::internal("missing count plan"))?;
            let count = self.svc.store.count(&plan).await?;
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain")
                .header("OData-Version", &self.ctx.version)
                .body(Body::from(count.to_string()))
                .unwrap_or_default());
        }

        if nav.collection {
            // Optional key on the navigation segment addresses one child.
            if let Some(key) = &url.segments[0].key {
                let key_row = resolve_key(target, key)?;
                let nested = UrlComponents {
                    entity_set: target.set_name.clone(),
                    key: Some(
                        key_row
                            .iter()
                            .map(|(col, v)| {
                                let name = target
                                    .properties
                                    .iter()
                                    .find(|p| &p.column == col)
                                    .map(|p| p.name.clone());
                                (name, v.clone())
                            })
                            .collect(),
                    ),
                    ..Default::default()
                };
                return self.read(target, &nested, options, &HeaderMap::new()).await;
            }
            return self
                .list(target, options, raw_query, Some(predicate), None)
                .await;
        }

        self.authorize(target, Operation::ReadEntity).await?;
        let compiled = self.compile_query(target, options, Some(predicate), &[], None)?;
        let rows = self.svc.store.query(&compiled.plan).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("no related entity"))?;
        let results =
            run_expands(self.svc.store.as_ref(), &compiled.expands, vec![row]).await?;
        let body = self.serializer().entity(target, &results[0], false)?;
        self.json_response(StatusCode::OK, &body, &[])
    }

    async fn property_get(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        property: &str,
    ) -> Result<Response> {
        self.authorize(meta, Operation::ReadEntity).await?;
        let prop = meta
            .find_property(property)
            .ok_or_else(|| Error::not_found(format!("unknown property {property}")))?
            .clone();
        let result = self.fetch_one(meta, url).await?;
        let value = result.row_value(&prop.column);

        if url.is_value {
            return raw_value_response(&prop, &value, &self.ctx.version);
        }
        if value.is_null() {
            return Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("OData-Version", &self.ctx.version)
                .body(Body::empty())
                .unwrap_or_default());
        }
        let body = self
            .serializer()
            .property(meta, &result.row, &prop.name, &value)?;
        self.json_response(StatusCode::OK, &body, &[])
    }

    async fn delta_feed(&self, meta: &EntityMetadata, options: &QueryOptions) -> Result<Response> {
        self.authorize(meta, Operation::ReadCollection).await?;
        if !self.svc.tracker.enabled() {
            return Err(Error::not_implemented("change tracking is not enabled"));
        }
        let token = options
            .delta_token
            .as_deref()
            .ok_or_else(|| Error::validation("missing $deltatoken"))?;
        let since = decode_delta_token(&self.svc.signer, token)?;
        let changes = self.svc.tracker.changes_since(&meta.set_name, since);
        let next = encode_delta_token(&self.svc.signer, self.svc.tracker.current_sequence());
        let link = format!(
            "{}/{}?$deltatoken={}",
            self.ctx.base,
            meta.set_name,
            urlencoding::encode(&next)
        );
        let body = self.serializer().delta(meta, &changes, &link)?;
        self.json_response(StatusCode::OK, &body, &[])
    }

    // ───────────────────────── mutations ─────────────────────────

    async fn create(&self, meta: &EntityMetadata, body: &[u8]) -> Result<Response> {
        self.authorize(meta, Operation::Create).await?;
        if meta.is_singleton {
            return Err(Error::MethodNotAllowed {
                allowed: vec!["GET".into(), "PATCH".into(), "PUT".into()],
            });
        }
        let mut row = deserialize_body(meta, body, BodyMode::Create)?;
        apply_defaults(meta, &mut row);

        // Server-side key generation when the store does not assign keys.
        if let Some(keygen) = &self.svc.keygen {
            for key in meta.keys() {
                if key.computed && !row.contains_key(&key.column) {
                    let value = keygen.generate(&meta.set_name).await?;
                    row.insert(key.column.clone(), value);
                }
            }
        }

        let mut tx = self.begin_tx().await?;
        let outcome: Result<Row> = async {
            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks.before_create(&mut hook_ctx, &mut row).await?;
            }
            let stored = match self.svc.overwrite.get(&meta.set_name) {
                Some(provider) => provider.create(&meta.set_name, row.clone()).await?,
                None => tx.tx().insert(&meta.table, row.clone()).await?,
            };
            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks.after_create(&mut hook_ctx, &stored).await;
            }
            self.persist_change(
                tx.tx(),
                meta,
                ChangeOperation::Create,
                &stored,
                Some(&stored),
            )
            .await?;
            Ok(stored)
        }
        .await;

        let stored = match outcome {
            Ok(stored) => {
                tx.commit().await?;
                stored
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };
        self.record_change(meta, ChangeOperation::Create, &stored, Some(&stored));

        let location = canonical_url(&self.ctx.base, meta, &stored)?;
        let etag = entity_etag(meta, &stored);
        let mut extra: Vec<(&str, &str)> = vec![
            ("Location", location.as_str()),
            ("OData-EntityId", location.as_str()),
        ];
        if let Some(etag) = &etag {
            extra.push(("ETag", etag.as_str()));
        }
        if self.ctx.prefer.return_minimal == Some(true) {
            extra.push(("Preference-Applied", "return=minimal"));
            return self.empty_response(StatusCode::NO_CONTENT, &extra);
        }
        let body = self
            .serializer()
            .entity(meta, &EntityResult::bare(stored), false)?;
        self.json_response(StatusCode::CREATED, &body, &extra)
    }

    async fn update(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        headers: &HeaderMap,
        body: &[u8],
        merge: bool,
    ) -> Result<Response> {
        self.authorize(meta, Operation::Update).await?;
        let key_row = self.key_row(meta, url)?;
        let key_predicate = self.key_predicate(meta, url)?;
        let mode = if merge {
            BodyMode::Patch
        } else {
            BodyMode::Replace
        };
        let mut changes = deserialize_body(meta, body, mode)?;
        for key in meta.keys() {
            changes.remove(&key.column);
        }
        if !merge {
            // PUT resets unmentioned writable properties to their declared
            // default, or null without one.
            for prop in &meta.properties {
                if prop.key || prop.computed || prop.immutable || prop.stream {
                    continue;
                }
                changes
                    .entry(prop.column.clone())
                    .or_insert_with(|| prop.default_value.clone().unwrap_or(Value::Null));
            }
        }

        let mut tx = self.begin_tx().await?;
        let outcome: Result<Row> = async {
            let current = fetch_in_tx(tx.tx(), meta, &key_predicate).await?;
            check_preconditions(meta, &current, headers)?;

            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks
                    .before_update(&mut hook_ctx, &key_row, &mut changes)
                    .await?;
            }
            let updated = match self.svc.overwrite.get(&meta.set_name) {
                Some(provider) => {
                    provider
                        .update(&meta.set_name, key_row.clone(), changes.clone())
                        .await?
                }
                None => {
                    let affected = tx
                        .tx()
                        .update(&meta.table, &key_predicate, changes.clone())
                        .await?;
                    if affected == 0 {
                        return Err(Error::not_found("entity does not exist"));
                    }
                    fetch_in_tx(tx.tx(), meta, &key_predicate).await?
                }
            };
            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks.after_update(&mut hook_ctx, &updated).await;
            }
            self.persist_change(
                tx.tx(),
                meta,
                ChangeOperation::Update,
                &updated,
                Some(&updated),
            )
            .await?;
            Ok(updated)
        }
        .await;

        let updated = match outcome {
            Ok(updated) => {
                tx.commit().await?;
                updated
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };
        self.record_change(meta, ChangeOperation::Update, &updated, Some(&updated));

        let etag = entity_etag(meta, &updated);
        let mut extra: Vec<(&str, &str)> = Vec::new();
        if let Some(etag) = &etag {
            extra.push(("ETag", etag.as_str()));
        }
        if self.ctx.prefer.return_minimal == Some(false) {
            extra.push(("Preference-Applied", "return=representation"));
            let body = self
                .serializer()
                .entity(meta, &EntityResult::bare(updated), false)?;
            return self.json_response(StatusCode::OK, &body, &extra);
        }
        self.empty_response(StatusCode::NO_CONTENT, &extra)
    }

    async fn delete(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.authorize(meta, Operation::Delete).await?;
        if meta.is_singleton {
            return Err(Error::MethodNotAllowed {
                allowed: vec!["GET".into(), "PATCH".into(), "PUT".into()],
            });
        }
        let key_row = self.key_row(meta, url)?;
        let key_predicate = self.key_predicate(meta, url)?;

        let mut tx = self.begin_tx().await?;
        let outcome: Result<()> = async {
            let current = fetch_in_tx(tx.tx(), meta, &key_predicate).await?;
            check_preconditions(meta, &current, headers)?;

            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks.before_delete(&mut hook_ctx, &key_row).await?;
            }
            self.apply_on_delete(tx.tx(), meta, &current).await?;
            match self.svc.overwrite.get(&meta.set_name) {
                Some(provider) => provider.delete(&meta.set_name, key_row.clone()).await?,
                None => {
                    let affected = tx.tx().delete(&meta.table, &key_predicate).await?;
                    if affected == 0 {
                        return Err(Error::not_found("entity does not exist"));
                    }
                }
            }
            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, Some(tx.tx()));
                hooks.after_delete(&mut hook_ctx, &key_row).await;
            }
            self.persist_change(tx.tx(), meta, ChangeOperation::Delete, &key_row, None)
                .await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        self.record_change(meta, ChangeOperation::Delete, &key_row, None);
        self.empty_response(StatusCode::NO_CONTENT, &[])
    }

    /// Cascade/SetNull for dependents declared with an OnDelete action.
    async fn apply_on_delete(
        &self,
        tx: &mut (dyn StoreTx + 'static),
        meta: &EntityMetadata,
        current: &Row,
    ) -> Result<()> {
        for nav in &meta.navigations {
            if nav.on_delete == OnDelete::None {
                continue;
            }
            let target = self
                .svc
                .model
                .set(&nav.target)
                .ok_or_else(|| Error::internal("dangling navigation target"))?;
            let mut predicate: Option<SqlExpr> = None;
            let mut null_row = Row::new();
            for (from, to) in &nav.foreign_keys {
                let from_col = column_of(meta, from)?;
                let to_col = column_of(target, to)?;
                let value = current.get(&from_col).cloned().unwrap_or(Value::Null);
                let pair = SqlExpr::eq(
                    SqlExpr::qualified(target.table.clone(), to_col.clone()),
                    SqlExpr::Literal(value),
                );
                predicate = Some(match predicate {
                    Some(acc) => SqlExpr::and(acc, pair),
                    None => pair,
                });
                null_row.insert(to_col, Value::Null);
            }
            let Some(predicate) = predicate else { continue };
            match nav.on_delete {
                OnDelete::Cascade => {
                    tx.delete(&target.table, &predicate).await?;
                }
                OnDelete::SetNull => {
                    tx.update(&target.table, &predicate, null_row).await?;
                }
                OnDelete::None => {}
            }
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response> {
        self.authorize(meta, Operation::Update).await?;
        let prop_name = &url.segments[0].name;
        let prop = meta
            .find_property(prop_name)
            .ok_or_else(|| Error::not_found(format!("unknown property {prop_name}")))?
            .clone();
        if !prop.stream {
            return Err(Error::validation(format!(
                "{prop_name} is not a stream property"
            )));
        }
        let key_predicate = self.key_predicate(meta, url)?;
        let mut tx = self.begin_tx().await?;
        let outcome: Result<()> = async {
            let current = fetch_in_tx(tx.tx(), meta, &key_predicate).await?;
            check_preconditions(meta, &current, headers)?;
            let mut changes = Row::new();
            changes.insert(prop.column.clone(), Value::Binary(body.to_vec()));
            tx.tx().update(&meta.table, &key_predicate, changes).await?;
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        self.empty_response(StatusCode::NO_CONTENT, &[])
    }

    // ───────────────────────── $ref ─────────────────────────

    async fn bind_ref(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
        body: &[u8],
    ) -> Result<Response> {
        self.authorize(meta, Operation::Update).await?;
        let nav = self.ref_navigation(meta, url)?;
        let target = self
            .svc
            .model
            .set(&nav.target)
            .ok_or_else(|| Error::internal("dangling navigation target"))?;

        let parsed: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::validation(format!("malformed $ref body: {e}")))?;
        let id = parsed
            .get("@odata.id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("$ref body requires @odata.id"))?;
        let target_key = self.key_from_reference(target, id)?;
        let target_predicate = row_predicate(&target.table, &target_key);

        let parent = self.fetch_one(meta, url).await?;
        let mut tx = self.begin_tx().await?;
        let outcome: Result<()> = async {
            if nav.collection {
                // Point the child's foreign key at this parent.
                let mut changes = Row::new();
                for (from, to) in &nav.foreign_keys {
                    let from_col = column_of(meta, from)?;
                    let to_col = column_of(target, to)?;
                    changes.insert(to_col, parent.row_value(&from_col));
                }
                let affected = tx.tx().update(&target.table, &target_predicate, changes).await?;
                if affected == 0 {
                    return Err(Error::not_found("referenced entity does not exist"));
                }
            } else {
                // Point this entity's foreign key at the referenced target.
                let referenced = fetch_in_tx(tx.tx(), target, &target_predicate).await?;
                let mut changes = Row::new();
                for (from, to) in &nav.foreign_keys {
                    let from_col = column_of(meta, from)?;
                    let to_col = column_of(target, to)?;
                    changes.insert(
                        from_col,
                        referenced.get(&to_col).cloned().unwrap_or(Value::Null),
                    );
                }
                let parent_predicate = self.key_predicate(meta, url)?;
                tx.tx().update(&meta.table, &parent_predicate, changes).await?;
            }
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        self.empty_response(StatusCode::NO_CONTENT, &[])
    }

    async fn unbind_ref(&self, meta: &EntityMetadata, url: &UrlComponents) -> Result<Response> {
        self.authorize(meta, Operation::Update).await?;
        let nav = self.ref_navigation(meta, url)?;
        let target = self
            .svc
            .model
            .set(&nav.target)
            .ok_or_else(|| Error::internal("dangling navigation target"))?;

        let mut tx = self.begin_tx().await?;
        let outcome: Result<()> = async {
            if nav.collection {
                // Removing a member requires the target key on the segment.
                let key = url.segments[0]
                    .key
                    .as_ref()
                    .ok_or_else(|| {
                        Error::validation(
                            "removing a collection reference requires the target key",
                        )
                    })?;
                let key_row = resolve_key(target, key)?;
                let predicate = row_predicate(&target.table, &key_row);
                let mut changes = Row::new();
                for (_, to) in &nav.foreign_keys {
                    changes.insert(column_of(target, to)?, Value::Null);
                }
                let affected = tx.tx().update(&target.table, &predicate, changes).await?;
                if affected == 0 {
                    return Err(Error::not_found("referenced entity does not exist"));
                }
            } else {
                let parent_predicate = self.key_predicate(meta, url)?;
                let mut changes = Row::new();
                for (from, _) in &nav.foreign_keys {
                    changes.insert(column_of(meta, from)?, Value::Null);
                }
                let affected = tx.tx().update(&meta.table, &parent_predicate, changes).await?;
                if affected == 0 {
                    return Err(Error::not_found("entity does not exist"));
                }
            }
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        self.empty_response(StatusCode::NO_CONTENT, &[])
    }

    fn ref_navigation(
        &self,
        meta: &EntityMetadata,
        url: &UrlComponents,
    ) -> Result<NavigationMetadata> {
        let first = url
            .segments
            .first()
            .ok_or_else(|| Error::validation("$ref requires a navigation segment"))?;
        meta.find_navigation(&first.name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown navigation {}", first.name)))
    }

    /// Parse a canonical URL from a `$ref` body back into a key row.
    fn key_from_reference(&self, target: &EntityMetadata, id: &str) -> Result<Row> {
        let path = id
            .strip_prefix(&self.ctx.base)
            .or_else(|| {
                // Absolute form: find the base path inside the URL.
                id.find(&format!("{}/", self.ctx.base))
                    .map(|idx| &id[idx + self.ctx.base.len()..])
            })
            .unwrap_or(id);
        let components = parse_path(path)?;
        if components.entity_set != target.set_name {
            return Err(Error::validation(format!(
                "@odata.id must reference {}",
                target.set_name
            )));
        }
        let key = components
            .key
            .ok_or_else(|| Error::validation("@odata.id must address a single entity"))?;
        resolve_key(target, &key)
    }

    // ───────────────────────── shared plumbing ─────────────────────────

    async fn authorize(&self, meta: &EntityMetadata, operation: Operation) -> Result<()> {
        let policy = self.svc.policy();
        policy
            .authorize(self.ctx.principal.as_ref(), &meta.set_name, operation)
            .await
            .into_result(self.ctx.principal.as_ref())
    }

    /// Policy-attached query filters, conjoined into every read.
    async fn read_scopes(
        &self,
        meta: &EntityMetadata,
        operation: Operation,
    ) -> Result<Vec<Expr>> {
        let mut scopes = Vec::new();
        if let Some(scope) = self
            .svc
            .policy()
            .query_filter(self.ctx.principal.as_ref(), &meta.set_name)
        {
            scopes.push(scope);
        }
        if operation == Operation::ReadCollection {
            if let Some(hooks) = self.svc.hooks_for(&meta.set_name) {
                let mut hook_ctx = self.hook_ctx(meta, None);
                if let Some(scope) = hooks.before_read_collection(&mut hook_ctx).await? {
                    scopes.push(scope);
                }
            }
        }
        Ok(scopes)
    }

    /// Owned transaction for plain requests; the changeset's transaction
    /// inside a batch atomicity group.
    async fn begin_tx(&self) -> Result<TxScope> {
        match &self.ctx.shared_tx {
            Some(shared) => Ok(TxScope::Shared(shared.clone().lock_owned().await)),
            None => Ok(TxScope::Owned(self.svc.store.begin().await?)),
        }
    }

    fn hook_ctx<'b>(
        &'b self,
        meta: &'b EntityMetadata,
        tx: Option<&'b mut (dyn StoreTx + 'static)>,
    ) -> HookContext<'b> {
        HookContext {
            set: &meta.set_name,
            principal: self.ctx.principal.as_ref(),
            tx,
        }
    }

    fn compile_query(
        &self,
        meta: &EntityMetadata,
        options: &QueryOptions,
        base_predicate: Option<SqlExpr>,
        scopes: &[Expr],
        type_cast: Option<&str>,
    ) -> Result<CompiledQuery> {
        let mut base = base_predicate;
        if let Some(cast) = type_cast {
            base = Some(SqlExpr::merge(base, typecast_predicate(meta, cast)));
        }
        let cfg = CompileConfig {
            max_page_size: self.svc.config.max_page_size,
            max_expand_depth: self.svc.config.max_expand_depth,
            geo: self.svc.geo.as_deref(),
            has_search_backend: self.svc.search.is_some(),
            page_size_preference: self.ctx.prefer.max_page_size,
            signer: &self.svc.signer,
            dialect: self.svc.store.dialect(),
        };
        compile(&self.svc.model, meta, options, base, scopes, &cfg)
    }

    async fn execute_list(
        &self,
        meta: &EntityMetadata,
        options: &QueryOptions,
        compiled: &CompiledQuery,
    ) -> Result<(Vec<EntityResult>, bool, Option<u64>)> {
        let mut plan = compiled.plan.clone();

        if let SearchStrategy::Backend(expr) = &compiled.search {
            let backend = self
                .svc
                .search
                .as_ref()
                .ok_or_else(|| Error::internal("search backend disappeared"))?;
            let key_rows = backend.search(&meta.set_name, expr).await?;
            let key_cols: Vec<String> =
                meta.keys().iter().map(|k| k.column.clone()).collect();
            let exprs: Vec<SqlExpr> = key_cols
                .iter()
                .map(|c| SqlExpr::qualified(meta.table.clone(), c.clone()))
                .collect();
            let rows: Vec<Vec<Value>> = key_rows
                .iter()
                .map(|r| {
                    key_cols
                        .iter()
                        .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            let predicate = if exprs.len() == 1 {
                SqlExpr::In {
                    expr: Box::new(exprs.into_iter().next().unwrap()),
                    list: rows
                        .iter()
                        .map(|r| SqlExpr::Literal(r[0].clone()))
                        .collect(),
                }
            } else {
                SqlExpr::TupleIn { exprs, rows }
            };
            plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), predicate));
        }

        let mut rows = self.svc.store.query(&plan).await?;

        if let SearchStrategy::Memory(expr) = &compiled.search {
            rows.retain(|row| search_match(row, expr));
        }

        // Count reflects the filtered set, not the page.
        let count = if options.count == Some(true) && !compiled.is_aggregate {
            match &compiled.search {
                SearchStrategy::Memory(_) => Some(rows.len() as u64),
                _ => {
                    let count_plan = compiled
                        .count_plan
                        .as_ref()
                        .ok_or_else(|| Error::internal("missing count plan"))?;
                    Some(self.svc.store.count(count_plan).await?)
                }
            }
        } else {
            None
        };

        if let Some(skip) = compiled.mem_skip {
            rows = rows.into_iter().skip(skip as usize).collect();
        }
        let mut truncated = false;
        if let Some(window) = compiled.mem_top.or(compiled.page_limit) {
            if rows.len() as u64 > window {
                truncated = true;
                rows.truncate(window as usize);
            }
        }

        let results = run_expands(self.svc.store.as_ref(), &compiled.expands, rows).await?;
        Ok((results, truncated, count))
    }

    async fn fetch_one(&self, meta: &EntityMetadata, url: &UrlComponents) -> Result<EntityResult> {
        self.authorize(meta, Operation::ReadEntity).await?;
        let base = self.key_predicate(meta, url)?;
        let compiled = self.compile_query(
            meta,
            &QueryOptions::default(),
            Some(base),
            &[],
            url.type_cast.as_deref(),
        )?;
        let rows = self.svc.store.query(&compiled.plan).await?;
        rows.into_iter()
            .next()
            .map(EntityResult::bare)
            .ok_or_else(|| Error::not_found("entity does not exist"))
    }

    fn key_row(&self, meta: &EntityMetadata, url: &UrlComponents) -> Result<Row> {
        if meta.is_singleton {
            return Ok(Row::new());
        }
        let key = url
            .key
            .as_ref()
            .ok_or_else(|| Error::validation("entity key required"))?;
        resolve_key(meta, key)
    }

    fn key_predicate(&self, meta: &EntityMetadata, url: &UrlComponents) -> Result<SqlExpr> {
        if meta.is_singleton {
            return Ok(SqlExpr::Bool(true));
        }
        let key_row = self.key_row(meta, url)?;
        Ok(row_predicate(&meta.table, &key_row))
    }

    fn serializer(&self) -> Serializer<'_> {
        Serializer {
            model: &self.svc.model,
            base: &self.ctx.base,
            level: self.ctx.level,
        }
    }

    fn next_link(&self, meta: &EntityMetadata, raw_query: &str, token: &str) -> String {
        let mut parts: Vec<String> = parse_query_pairs(raw_query)
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| name != "$skiptoken")
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(&name),
                    urlencoding::encode(&value)
                )
            })
            .collect();
        parts.push(format!("$skiptoken={}", urlencoding::encode(token)));
        format!("{}/{}?{}", self.ctx.base, meta.set_name, parts.join("&"))
    }

    /// Stage the change-log row inside the transaction when persistence is
    /// configured.
    async fn persist_change(
        &self,
        tx: &mut (dyn StoreTx + 'static),
        meta: &EntityMetadata,
        operation: ChangeOperation,
        row: &Row,
        snapshot: Option<&Row>,
    ) -> Result<()> {
        let Some(table) = &self.svc.config.change_log_table else {
            return Ok(());
        };
        if !self.svc.tracker.enabled() {
            return Ok(());
        }
        let record = crate::changes::ChangeRecord {
            sequence: self.svc.tracker.current_sequence() + 1,
            set: meta.set_name.clone(),
            operation,
            key: key_of(meta, row),
            snapshot: snapshot.cloned(),
            timestamp: chrono::Utc::now(),
        };
        tx.insert(table, change_log_row(&record)).await?;
        Ok(())
    }

    /// Append to the in-memory log only after a successful commit; a rolled
    /// back transaction must emit no change event. Changeset members stage
    /// their records until the whole group commits.
    fn record_change(
        &self,
        meta: &EntityMetadata,
        operation: ChangeOperation,
        row: &Row,
        snapshot: Option<&Row>,
    ) {
        let key = key_of(meta, row);
        if let Some(pending) = &self.ctx.pending_changes {
            pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(crate::router::PendingChange {
                    set: meta.set_name.clone(),
                    operation,
                    key,
                    snapshot: snapshot.cloned(),
                });
            return;
        }
        self.svc.tracker.record(&meta.set_name, operation, key, snapshot.cloned());
    }

    fn json_response(
        &self,
        status: StatusCode,
        body: &serde_json::Value,
        extra: &[(&str, &str)],
    ) -> Result<Response> {
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, json_content_type(self.ctx.level))
            .header("OData-Version", &self.ctx.version);
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::from(serde_json::to_vec(body).map_err(|e| {
                Error::internal(format!("response serialization failed: {e}"))
            })?))
            .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
    }

    fn empty_response(&self, status: StatusCode, extra: &[(&str, &str)]) -> Result<Response> {
        let mut builder = Response::builder()
            .status(status)
            .header("OData-Version", &self.ctx.version);
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::empty())
            .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
    }
}

impl EntityResult {
    fn row_value(&self, column: &str) -> Value {
        self.row.get(column).cloned().unwrap_or(Value::Null)
    }
}

pub(crate) fn json_content_type(level: MetadataLevel) -> &'static str {
    match level {
        MetadataLevel::None => "application/json;odata.metadata=none",
        MetadataLevel::Minimal => "application/json;odata.metadata=minimal",
        MetadataLevel::Full => "application/json;odata.metadata=full",
    }
}

fn allowed_methods(meta: &EntityMetadata) -> Vec<String> {
    match &meta.allowed_methods {
        Some(methods) => methods.clone(),
        None => ["GET", "POST", "PATCH", "PUT", "DELETE", "HEAD", "OPTIONS"]
            .iter()
            .map(|m| m.to_string())
            .collect(),
    }
}

fn timing(compile_ms: f64, exec_ms: f64) -> String {
    format!("compile;dur={compile_ms:.1}, execute;dur={exec_ms:.1}")
}

fn applied_preferences(prefer: &crate::router::Preferences) -> String {
    let mut parts = Vec::new();
    if let Some(size) = prefer.max_page_size {
        parts.push(format!("odata.maxpagesize={size}"));
    }
    if prefer.track_changes {
        parts.push("odata.track-changes".to_string());
    }
    parts.join(", ")
}

/// Typecast segments filter on the discriminator; without one the cast
/// matches nothing.
fn typecast_predicate(meta: &EntityMetadata, cast: &str) -> SqlExpr {
    let Some(disc) = &meta.type_discriminator else {
        return SqlExpr::Bool(false);
    };
    let Some(prop) = meta.find_property(disc) else {
        return SqlExpr::Bool(false);
    };
    let short = cast.rsplit('.').next().unwrap_or(cast);
    SqlExpr::eq(
        SqlExpr::qualified(meta.table.clone(), prop.column.clone()),
        SqlExpr::Literal(Value::String(short.to_string())),
    )
}

/// Key predicate for a row of key columns, shared with the router's bound
/// operation resolution.
pub(crate) fn row_predicate_for(meta: &EntityMetadata, key_row: &Row) -> SqlExpr {
    row_predicate(&meta.table, key_row)
}

fn row_predicate(table: &str, key_row: &Row) -> SqlExpr {
    let mut predicate: Option<SqlExpr> = None;
    for (column, value) in key_row {
        let pair = SqlExpr::eq(
            SqlExpr::qualified(table.to_string(), column.clone()),
            SqlExpr::Literal(value.clone()),
        );
        predicate = Some(match predicate {
            Some(acc) => SqlExpr::and(acc, pair),
            None => pair,
        });
    }
    predicate.unwrap_or(SqlExpr::Bool(true))
}

fn column_of(meta: &EntityMetadata, property: &str) -> Result<String> {
    meta.find_property(property)
        .map(|p| p.column.clone())
        .ok_or_else(|| {
            Error::validation(format!(
                "property {property} does not exist on {}",
                meta.set_name
            ))
        })
}

fn key_of(meta: &EntityMetadata, row: &Row) -> Row {
    let mut key = Row::new();
    for prop in meta.keys() {
        if let Some(v) = row.get(&prop.column) {
            key.insert(prop.column.clone(), v.clone());
        }
    }
    if key.is_empty() { row.clone() } else { key }
}

async fn fetch_in_tx(
    tx: &mut (dyn StoreTx + 'static),
    meta: &EntityMetadata,
    predicate: &SqlExpr,
) -> Result<Row> {
    let plan = SelectPlan {
        table: meta.table.clone(),
        predicate: Some(predicate.clone()),
        limit: Some(1),
        ..Default::default()
    };
    tx.query(&plan)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found("entity does not exist"))
}

/// Concurrency gate: `If-Match` must equal the current ETag (412 otherwise),
/// `If-None-Match: *` forbids overwriting an existing row.
fn check_preconditions(meta: &EntityMetadata, current: &Row, headers: &HeaderMap) -> Result<()> {
    let etag = entity_etag(meta, current);
    if let Some(if_match) = headers.get(header::IF_MATCH) {
        let wanted = if_match
            .to_str()
            .map_err(|_| Error::validation("malformed If-Match header"))?;
        if wanted != "*" {
            match &etag {
                Some(current_etag) if wanted == current_etag => {}
                _ => {
                    return Err(Error::PreconditionFailed {
                        message: "the entity was modified by another request".into(),
                    });
                }
            }
        }
    }
    if let Some(if_none) = headers.get(header::IF_NONE_MATCH) {
        let wanted = if_none
            .to_str()
            .map_err(|_| Error::validation("malformed If-None-Match header"))?;
        if wanted == "*" || Some(wanted.to_string()) == etag.clone() {
            return Err(Error::PreconditionFailed {
                message: "the entity already exists".into(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum BodyMode {
    Create,
    Patch,
    Replace,
}

/// Deserialize a JSON entity body against the declared properties, applying
/// the computed/immutable rules for the operation.
fn deserialize_body(meta: &EntityMetadata, body: &[u8], mode: BodyMode) -> Result<Row> {
    if body.is_empty() {
        return Err(Error::validation("request body is required"));
    }
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::validation(format!("malformed JSON body: {e}")))?;
    let serde_json::Value::Object(map) = parsed else {
        return Err(Error::validation("entity body must be a JSON object"));
    };
    let mut row = Row::new();
    for (name, value) in &map {
        if name.starts_with('@') || name.contains("@odata") {
            continue;
        }
        let Some(prop) = meta.properties.iter().find(|p| &p.name == name) else {
            return Err(Error::validation_at(
                format!("property {name} does not exist"),
                name.clone(),
            ));
        };
        // Server-assigned values in the payload are ignored.
        if prop.computed {
            continue;
        }
        if prop.stream {
            return Err(Error::validation_at(
                format!("stream property {name} is written via $value"),
                name.clone(),
            ));
        }
        if prop.immutable && mode != BodyMode::Create {
            return Err(Error::validation_at(
                format!("property {name} is immutable"),
                name.clone(),
            ));
        }
        let converted = Value::from_json(value, &prop.ty)
            .map_err(|e| Error::validation_at(e, name.clone()))?;
        if converted.is_null() && !prop.nullable && mode != BodyMode::Patch {
            return Err(Error::validation_at(
                format!("property {name} must not be null"),
                name.clone(),
            ));
        }
        if let (Some(max), Value::String(s)) = (prop.max_length, &converted) {
            if s.chars().count() as u32 > max {
                return Err(Error::validation_at(
                    format!("property {name} exceeds its maximum length of {max}"),
                    name.clone(),
                ));
            }
        }
        row.insert(prop.column.clone(), converted);
    }
    if mode == BodyMode::Create {
        for prop in &meta.properties {
            let needed = !prop.nullable
                && !prop.computed
                && !prop.stream
                && prop.default_value.is_none();
            if needed && !row.contains_key(&prop.column) {
                return Err(Error::validation_at(
                    format!("property {} is required", prop.name),
                    prop.name.clone(),
                ));
            }
        }
    }
    Ok(row)
}

fn apply_defaults(meta: &EntityMetadata, row: &mut Row) {
    for prop in &meta.properties {
        if let Some(default) = &prop.default_value {
            row.entry(prop.column.clone()).or_insert_with(|| default.clone());
        }
    }
}

/// `$value` responses: text/plain for primitives, the declared media type
/// for streams.
fn raw_value_response(prop: &PropertyMetadata, value: &Value, version: &str) -> Result<Response> {
    if value.is_null() {
        return Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("OData-Version", version)
            .body(Body::empty())
            .unwrap_or_default());
    }
    let (content_type, bytes) = match (&prop.ty, value) {
        (EdmType::Stream, Value::Binary(data)) => (
            prop.media_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            data.clone(),
        ),
        (_, Value::Binary(data)) => ("application/octet-stream".into(), data.clone()),
        _ => ("text/plain".into(), value.raw_text().into_bytes()),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header("OData-Version", version)
        .body(Body::from(bytes))
        .map_err(|e| Error::internal(format!("response assembly failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, PropertyMetadata};

    fn meta() -> EntityMetadata {
        EntityMetadata::new("Products", "Product", "products")
            .property(PropertyMetadata::new("ID", EdmType::Int32).key().computed())
            .property(
                PropertyMetadata::new("Name", EdmType::String)
                    .required()
                    .max_length(10),
            )
            .property(PropertyMetadata::new("Price", EdmType::Double))
            .property(PropertyMetadata::new("Sku", EdmType::String).immutable())
    }

    #[test]
    fn create_body_requires_required_properties() {
        let meta = meta();
        let err = deserialize_body(&meta, br#"{"Price": 1.0}"#, BodyMode::Create).unwrap_err();
        assert!(err.to_string().contains("required"));
        let ok =
            deserialize_body(&meta, br#"{"Name":"X","Price":1.0}"#, BodyMode::Create).unwrap();
        assert_eq!(ok.get("Name"), Some(&Value::String("X".into())));
    }

    #[test]
    fn unknown_and_computed_properties() {
        let meta = meta();
        let err =
            deserialize_body(&meta, br#"{"Name":"X","Bogus":1}"#, BodyMode::Create).unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
        // Computed keys in the payload are dropped, not rejected.
        let row =
            deserialize_body(&meta, br#"{"ID":99,"Name":"X"}"#, BodyMode::Create).unwrap();
        assert!(!row.contains_key("ID"));
    }

    #[test]
    fn immutable_rejected_on_update_only() {
        let meta = meta();
        assert!(deserialize_body(&meta, br#"{"Name":"X","Sku":"A"}"#, BodyMode::Create).is_ok());
        let err = deserialize_body(&meta, br#"{"Sku":"B"}"#, BodyMode::Patch).unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn max_length_is_enforced() {
        let meta = meta();
        let err = deserialize_body(
            &meta,
            br#"{"Name":"this is far too long"}"#,
            BodyMode::Patch,
        )
        .unwrap_err();
        assert!(err.to_string().contains("maximum length"));
    }

    #[test]
    fn precondition_checks() {
        let meta = EntityMetadata::new("Products", "Product", "products")
            .property(PropertyMetadata::new("ID", EdmType::Int32).key())
            .property(PropertyMetadata::new("Rev", EdmType::Int64).etag());
        let mut row = Row::new();
        row.insert("ID".into(), Value::Int(1));
        row.insert("Rev".into(), Value::Int(1));
        let current_etag = entity_etag(&meta, &row).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, current_etag.parse().unwrap());
        assert!(check_preconditions(&meta, &row, &headers).is_ok());

        let mut stale = HeaderMap::new();
        stale.insert(header::IF_MATCH, "W/\"something-else\"".parse().unwrap());
        let err = check_preconditions(&meta, &row, &stale).unwrap_err();
        assert_eq!(err.status().as_u16(), 412);
    }
}
