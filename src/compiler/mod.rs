pub mod apply;
pub mod expand;
pub mod predicate;

pub use expand::{EntityResult, ExpandFetch, ExpansionResult, run_expands};

use crate::ast::{Expr, QueryOptions, SearchExpr, SelectItem};
use crate::compiler::apply::compile_apply;
use crate::compiler::expand::compile_expands;
use crate::compiler::predicate::PredicateCtx;
use crate::error::{Error, Result};
use crate::metadata::{EntityMetadata, EntityModel};
use crate::plan::{Dialect, OrderSpec, SelectColumn, SelectPlan, SqlBinOp, SqlExpr};
use crate::store::{GeospatialBackend, Row};
use crate::tokens::TokenSigner;
use crate::value::{Value, json_to_untyped};

/// Server-side knobs the compiler needs beyond the parsed options.
pub struct CompileConfig<'a> {
    pub max_page_size: u64,
    pub max_expand_depth: u32,
    pub geo: Option<&'a dyn GeospatialBackend>,
    pub has_search_backend: bool,
    /// `Prefer: odata.maxpagesize` value, already parsed.
    pub page_size_preference: Option<u64>,
    pub signer: &'a TokenSigner,
    pub dialect: Dialect,
}

/// How `$search` executes for this query.
pub enum SearchStrategy {
    None,
    /// Delegate to the SearchBackend; the handler injects the key rows.
    Backend(SearchExpr),
    /// In-memory fallback, applied before pagination windowing.
    Memory(SearchExpr),
}

/// One component of the keyset cursor behind `$skiptoken`.
#[derive(Debug, Clone)]
pub struct CursorColumn {
    /// Key under which the value appears in result rows.
    pub row_key: String,
    pub expr: SqlExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CursorSpec {
    pub columns: Vec<CursorColumn>,
}

/// Everything the handler needs to execute one list/read query.
pub struct CompiledQuery {
    pub plan: SelectPlan,
    pub count_plan: Option<SelectPlan>,
    pub expands: Vec<ExpandFetch>,
    pub search: SearchStrategy,
    /// Page window the executor enforces; rows past it mean truncation.
    pub page_limit: Option<u64>,
    /// Windowing the executor applies in memory (search fallback or a store
    /// without native pagination).
    pub mem_skip: Option<u64>,
    pub mem_top: Option<u64>,
    pub cursor: CursorSpec,
    pub is_aggregate: bool,
}

/// Compile (metadata, options) into a store plan. `base_predicate` carries
/// key/navigation constraints from the URL; `scopes` carries policy and hook
/// filters, conjoined with `$filter`.
pub fn compile(
    model: &EntityModel,
    meta: &EntityMetadata,
    options: &QueryOptions,
    base_predicate: Option<SqlExpr>,
    scopes: &[Expr],
    cfg: &CompileConfig<'_>,
) -> Result<CompiledQuery> {
    let mut ctx = PredicateCtx::new(
        model,
        meta,
        options,
        cfg.geo,
        cfg.dialect.escape_char,
    );
    let mut plan = SelectPlan {
        table: meta.table.clone(),
        predicate: base_predicate,
        ..Default::default()
    };

    if let Some(filter) = &options.filter {
        let compiled = ctx.compile(filter)?;
        plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), compiled));
    }
    for scope in scopes {
        let compiled = ctx.compile(scope)?;
        plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), compiled));
    }

    let is_aggregate = if options.apply.is_empty() {
        false
    } else {
        compile_apply(&mut ctx, &options.apply, &mut plan)?
    };

    let search = match (&options.search, is_aggregate) {
        (None, _) => SearchStrategy::None,
        (Some(_), true) => {
            return Err(Error::validation("$search cannot be combined with $apply"));
        }
        (Some(expr), false) if cfg.has_search_backend => SearchStrategy::Backend(expr.clone()),
        (Some(expr), false) => SearchStrategy::Memory(expr.clone()),
    };

    let mut cursor = CursorSpec::default();
    if !is_aggregate {
        let projected = projection(&mut ctx, meta, options)?;
        plan.columns.splice(0..0, projected);

        // Single ordering clause in client order, primary key appended for a
        // deterministic total order.
        let mut sort_idx = 0usize;
        for item in &options.order_by {
            let (expr, _) = ctx.resolve_path(&item.path)?;
            let row_key = match &expr {
                SqlExpr::Column { qualifier, name }
                    if qualifier.as_deref() == Some(meta.table.as_str()) =>
                {
                    name.clone()
                }
                _ => {
                    // Project the sort expression so cursor values can be
                    // read back from result rows.
                    let alias = format!("__sort{sort_idx}");
                    sort_idx += 1;
                    plan.columns.push(SelectColumn {
                        expr: expr.clone(),
                        alias: alias.clone(),
                    });
                    alias
                }
            };
            plan.order.push(OrderSpec {
                expr: expr.clone(),
                descending: item.descending,
            });
            cursor.columns.push(CursorColumn {
                row_key,
                expr,
                descending: item.descending,
            });
        }
        for key in meta.keys() {
            let expr = SqlExpr::qualified(meta.table.clone(), key.column.clone());
            let already = plan.order.iter().any(|o| o.expr == expr);
            if !already {
                plan.order.push(OrderSpec {
                    expr: expr.clone(),
                    descending: false,
                });
                cursor.columns.push(CursorColumn {
                    row_key: key.column.clone(),
                    expr,
                    descending: false,
                });
            }
        }
    }

    plan.joins.splice(0..0, std::mem::take(&mut ctx.joins));

    // Count uses the same predicates but none of the ordering, paging or
    // expand machinery.
    let count_plan = SelectPlan {
        table: plan.table.clone(),
        joins: plan.joins.clone(),
        predicate: plan.predicate.clone(),
        ..Default::default()
    };

    // Pagination: native window plus one row of overfetch to detect
    // truncation; the page cap applies server-wide.
    let mut mem_skip = None;
    let mut mem_top = None;
    let mut page_limit = None;
    if !is_aggregate {
        let cap = cfg
            .page_size_preference
            .map_or(cfg.max_page_size, |p| p.min(cfg.max_page_size));
        let window = options.top.map_or(cap, |t| t.min(cap));
        page_limit = Some(window);

        match (&search, &options.skip_token) {
            (SearchStrategy::Memory(_), _) => {
                // Fetch bounded by the cap, match in memory, then window the
                // matched sequence.
                plan.limit = Some(cfg.max_page_size + 1);
                mem_skip = options.skip;
                mem_top = Some(window);
            }
            (_, Some(token)) => {
                let values = decode_skiptoken(cfg.signer, token, cursor.columns.len())?;
                let resume = cursor_predicate(&cursor, &values);
                plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), resume));
                plan.limit = Some(window + 1);
            }
            _ => {
                if cfg.dialect.supports_native_pagination {
                    plan.offset = options.skip.filter(|s| *s > 0);
                } else {
                    mem_skip = options.skip;
                }
                plan.limit = Some(window + 1);
            }
        }
    } else {
        plan.limit = options.top;
        plan.offset = options.skip;
    }

    let expands = if is_aggregate {
        Vec::new()
    } else {
        compile_expands(
            model,
            meta,
            &options.expand,
            cfg.dialect.escape_char,
            cfg.max_expand_depth,
            1,
        )?
    };

    Ok(CompiledQuery {
        plan,
        count_plan: Some(count_plan),
        expands,
        search,
        page_limit,
        mem_skip,
        mem_top,
        cursor,
        is_aggregate,
    })
}

/// Base projection: `$select` plus everything the machinery needs (keys,
/// etag, discriminator, expand link columns), or all structural columns.
fn projection(
    ctx: &mut PredicateCtx<'_>,
    meta: &EntityMetadata,
    options: &QueryOptions,
) -> Result<Vec<SelectColumn>> {
    let mut columns: Vec<String> = Vec::new();
    let select_all =
        options.select.is_empty() || options.select.contains(&SelectItem::Wildcard);
    if select_all {
        columns.extend(
            meta.properties
                .iter()
                .filter(|p| !p.stream)
                .map(|p| p.column.clone()),
        );
    } else {
        for item in &options.select {
            let SelectItem::Path(path) = item else {
                continue;
            };
            if path.len() != 1 {
                // Navigation-path selects shape the expanded payload, not
                // the base projection.
                continue;
            }
            if options.compute_alias(&path[0]).is_some() {
                continue;
            }
            let prop = meta.find_property(&path[0]).ok_or_else(|| {
                Error::validation(format!(
                    "selected property {} does not exist on {}",
                    path[0], meta.set_name
                ))
            })?;
            if prop.stream {
                continue;
            }
            columns.push(prop.column.clone());
        }
        // Keys are always included so canonical URLs can be built.
        for key in meta.keys() {
            if !columns.contains(&key.column) {
                columns.push(key.column.clone());
            }
        }
        if let Some(etag) = meta.etag_property() {
            if !columns.contains(&etag.column) {
                columns.push(etag.column.clone());
            }
        }
        if let Some(disc) = &meta.type_discriminator {
            if let Some(prop) = meta.find_property(disc) {
                if !columns.contains(&prop.column) {
                    columns.push(prop.column.clone());
                }
            }
        }
        for node in &options.expand {
            if node.path.len() == 1 {
                if let Some(nav) = meta.find_navigation(&node.path[0]) {
                    for (from, _) in &nav.foreign_keys {
                        if let Some(prop) = meta.find_property(from) {
                            if !columns.contains(&prop.column) {
                                columns.push(prop.column.clone());
                            }
                        }
                    }
                }
            }
        }
        // Sort columns must ride along for cursor extraction.
        for item in &options.order_by {
            if item.path.len() == 1 {
                if let Some(prop) = meta.find_property(&item.path[0]) {
                    if !columns.contains(&prop.column) {
                        columns.push(prop.column.clone());
                    }
                }
            }
        }
    }
    let mut projected: Vec<SelectColumn> = columns
        .into_iter()
        .map(|c| SelectColumn {
            expr: SqlExpr::qualified(meta.table.clone(), c.clone()),
            alias: c,
        })
        .collect();
    for item in &options.compute {
        let expr = ctx.compile(&item.expr)?;
        projected.push(SelectColumn {
            expr,
            alias: item.alias.clone(),
        });
    }
    Ok(projected)
}

/// Lexicographic resume predicate for keyset pagination:
/// `(k0 > v0) OR (k0 = v0 AND k1 > v1) OR ...`, flipped per direction.
fn cursor_predicate(cursor: &CursorSpec, values: &[Value]) -> SqlExpr {
    let mut chain: Option<SqlExpr> = None;
    for i in 0..cursor.columns.len() {
        let mut group: Option<SqlExpr> = None;
        for (col, value) in cursor.columns.iter().zip(values).take(i) {
            let eq = SqlExpr::eq(col.expr.clone(), SqlExpr::Literal(value.clone()));
            group = Some(match group {
                Some(acc) => SqlExpr::and(acc, eq),
                None => eq,
            });
        }
        let col = &cursor.columns[i];
        let op = if col.descending {
            SqlBinOp::Lt
        } else {
            SqlBinOp::Gt
        };
        let cmp = SqlExpr::bin(op, col.expr.clone(), SqlExpr::Literal(values[i].clone()));
        let group = match group {
            Some(acc) => SqlExpr::and(acc, cmp),
            None => cmp,
        };
        chain = Some(match chain {
            Some(acc) => SqlExpr::bin(SqlBinOp::Or, acc, group),
            None => group,
        });
    }
    chain.unwrap_or(SqlExpr::Bool(true))
}

/// Encode the `$skiptoken` for the last row of a truncated page.
pub fn encode_skiptoken(signer: &TokenSigner, cursor: &CursorSpec, last_row: &Row) -> Option<String> {
    if cursor.columns.is_empty() {
        return None;
    }
    let values: Vec<serde_json::Value> = cursor
        .columns
        .iter()
        .map(|c| {
            last_row
                .get(&c.row_key)
                .map(Value::to_json)
                .unwrap_or(serde_json::Value::Null)
        })
        .collect();
    let payload = serde_json::json!({ "k": values }).to_string();
    Some(signer.sign(&payload))
}

fn decode_skiptoken(signer: &TokenSigner, token: &str, expected: usize) -> Result<Vec<Value>> {
    let payload = signer
        .verify(token)
        .ok_or_else(|| Error::validation("invalid $skiptoken"))?;
    let parsed: serde_json::Value = serde_json::from_str(&payload)
        .map_err(|_| Error::validation("invalid $skiptoken"))?;
    let values = parsed
        .get("k")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::validation("invalid $skiptoken"))?;
    if values.len() != expected {
        return Err(Error::validation("stale $skiptoken for this ordering"));
    }
    Ok(values.iter().map(json_to_untyped).collect())
}

/// In-memory `$search` fallback matcher: case-insensitive containment over
/// the row's textual values.
pub fn search_match(row: &Row, expr: &SearchExpr) -> bool {
    match expr {
        SearchExpr::Term(term) => {
            let needle = term.to_lowercase();
            row.values().any(|v| match v {
                Value::String(s) => s.to_lowercase().contains(&needle),
                _ => false,
            })
        }
        SearchExpr::And(a, b) => search_match(row, a) && search_match(row, b),
        SearchExpr::Or(a, b) => search_match(row, a) || search_match(row, b),
        SearchExpr::Not(inner) => !search_match(row, inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NavigationMetadata, PropertyMetadata};
    use crate::parser::parse_query_options;
    use crate::value::EdmType;

    fn model() -> EntityModel {
        let mut model = EntityModel::new("Shop", "Container");
        model
            .register(
                EntityMetadata::new("Products", "Product", "products")
                    .property(PropertyMetadata::new("ID", EdmType::Int32).key().computed())
                    .property(PropertyMetadata::new("Name", EdmType::String).required())
                    .property(PropertyMetadata::new("Price", EdmType::Double))
                    .navigation(
                        NavigationMetadata::collection("Descriptions", "ProductDescriptions")
                            .foreign_key("ID", "ProductID"),
                    ),
            )
            .unwrap();
        model
            .register(
                EntityMetadata::new(
                    "ProductDescriptions",
                    "ProductDescription",
                    "product_descriptions",
                )
                .property(PropertyMetadata::new("ID", EdmType::Int32).key())
                .property(PropertyMetadata::new("ProductID", EdmType::Int32))
                .property(PropertyMetadata::new("LanguageKey", EdmType::String)),
            )
            .unwrap();
        model.seal().unwrap();
        model
    }

    fn compile_query(model: &EntityModel, pairs: &[(&str, &str)]) -> Result<CompiledQuery> {
        let options = parse_query_options(
            &pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect::<Vec<_>>(),
            10,
        )?;
        let signer = TokenSigner::new();
        let cfg = CompileConfig {
            max_page_size: 100,
            max_expand_depth: 10,
            geo: None,
            has_search_backend: false,
            page_size_preference: None,
            signer: &signer,
            dialect: Dialect::default(),
        };
        compile(model, model.set("Products").unwrap(), &options, None, &[], &cfg)
    }

    #[test]
    fn orderby_gets_key_tiebreak() {
        let model = model();
        let q = compile_query(&model, &[("$orderby", "Price desc")]).unwrap();
        assert_eq!(q.plan.order.len(), 2);
        assert!(q.plan.order[0].descending);
        assert!(!q.plan.order[1].descending);
        assert_eq!(q.cursor.columns.len(), 2);
    }

    #[test]
    fn select_always_projects_keys() {
        let model = model();
        let q = compile_query(&model, &[("$select", "Name")]).unwrap();
        let aliases: Vec<&str> = q.plan.columns.iter().map(|c| c.alias.as_str()).collect();
        assert!(aliases.contains(&"Name"));
        assert!(aliases.contains(&"ID"));
        assert!(!aliases.contains(&"Price"));
    }

    #[test]
    fn top_is_capped_with_overfetch() {
        let model = model();
        let q = compile_query(&model, &[("$top", "5")]).unwrap();
        assert_eq!(q.page_limit, Some(5));
        assert_eq!(q.plan.limit, Some(6));

        let q = compile_query(&model, &[("$top", "500")]).unwrap();
        assert_eq!(q.page_limit, Some(100), "server cap wins");
    }

    #[test]
    fn skiptoken_round_trip_builds_resume_predicate() {
        let model = model();
        let signer = TokenSigner::new();
        let q = compile_query(&model, &[("$orderby", "Price desc")]).unwrap();
        let mut last = Row::new();
        last.insert("Price".into(), Value::Double(799.99));
        last.insert("ID".into(), Value::Int(2));
        let token = encode_skiptoken(&signer, &q.cursor, &last).unwrap();

        let options = parse_query_options(
            &[
                ("$orderby".to_string(), "Price desc".to_string()),
                ("$skiptoken".to_string(), token),
            ],
            10,
        )
        .unwrap();
        let cfg = CompileConfig {
            max_page_size: 100,
            max_expand_depth: 10,
            geo: None,
            has_search_backend: false,
            page_size_preference: None,
            signer: &signer,
            dialect: Dialect::default(),
        };
        let resumed = compile(
            &model,
            model.set("Products").unwrap(),
            &options,
            None,
            &[],
            &cfg,
        )
        .unwrap();
        assert!(resumed.plan.predicate.is_some());
        assert!(resumed.plan.offset.is_none());
    }

    #[test]
    fn search_without_backend_falls_back_to_memory() {
        let model = model();
        let q = compile_query(&model, &[("$search", "laptop")]).unwrap();
        assert!(matches!(q.search, SearchStrategy::Memory(_)));
        assert_eq!(q.mem_top, Some(100));
    }

    #[test]
    fn count_plan_strips_paging() {
        let model = model();
        let q = compile_query(&model, &[("$top", "2"), ("$count", "true")]).unwrap();
        let count = q.count_plan.unwrap();
        assert!(count.limit.is_none());
        assert!(count.order.is_empty());
    }

    #[test]
    fn search_matcher_is_case_insensitive() {
        let mut row = Row::new();
        row.insert("Name".into(), Value::String("Gaming Laptop".into()));
        assert!(search_match(&row, &SearchExpr::Term("laptop".into())));
        assert!(!search_match(&row, &SearchExpr::Term("chair".into())));
        assert!(search_match(
            &row,
            &SearchExpr::Not(Box::new(SearchExpr::Term("chair".into())))
        ));
    }
}
