use std::collections::HashMap;

use futures_util::future::BoxFuture;

use crate::ast::{ExpandLevels, ExpandNode, QueryOptions, SelectItem};
use crate::compiler::predicate::PredicateCtx;
use crate::error::{Error, Result};
use crate::metadata::{EntityMetadata, EntityModel, NavigationMetadata};
use crate::plan::{OrderSpec, SelectColumn, SelectPlan, SqlExpr};
use crate::store::{Row, Store};
use crate::value::Value;

/// One compiled `$expand` node: a batched child fetch executed once per node
/// regardless of parent count.
#[derive(Debug, Clone)]
pub struct ExpandFetch {
    pub nav: NavigationMetadata,
    /// Parent row columns whose values select the children.
    pub link_from: Vec<String>,
    /// Child row columns the link values match against.
    pub link_to: Vec<String>,
    /// Fetch plan without the parent-key predicate; the executor injects it.
    pub plan: SelectPlan,
    pub per_parent_skip: Option<u64>,
    pub per_parent_top: Option<u64>,
    pub include_count: bool,
    pub nested: Vec<ExpandFetch>,
}

/// An entity row plus its expanded navigations, ready for serialization.
#[derive(Debug, Clone)]
pub struct EntityResult {
    pub row: Row,
    pub expansions: Vec<(String, ExpansionResult)>,
}

impl EntityResult {
    pub fn bare(row: Row) -> Self {
        EntityResult {
            row,
            expansions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExpansionResult {
    Single(Option<Box<EntityResult>>),
    Collection {
        items: Vec<EntityResult>,
        count: Option<u64>,
    },
}

/// Compile the `$expand` tree against the parent metadata.
pub(crate) fn compile_expands(
    model: &EntityModel,
    meta: &EntityMetadata,
    nodes: &[ExpandNode],
    escape_char: char,
    max_depth: u32,
    depth: u32,
) -> Result<Vec<ExpandFetch>> {
    if depth > max_depth {
        return Err(Error::validation(format!(
            "$expand nesting exceeds the maximum depth of {max_depth}"
        )));
    }
    let mut fetches = Vec::new();
    for node in nodes {
        // `$expand=*` expands every navigation to depth 1.
        if node.path.len() == 1 && node.path[0] == "*" {
            for nav in &meta.navigations {
                fetches.push(compile_one(
                    model,
                    meta,
                    nav,
                    &QueryOptions::default(),
                    None,
                    escape_char,
                    max_depth,
                    depth,
                )?);
            }
            continue;
        }
        if node.path.len() != 1 {
            return Err(Error::validation(format!(
                "unsupported $expand path: {}",
                node.path.join("/")
            )));
        }
        let nav = meta.find_navigation(&node.path[0]).ok_or_else(|| {
            Error::not_found(format!(
                "navigation {} does not exist on {}",
                node.path[0], meta.set_name
            ))
        })?;
        fetches.push(compile_one(
            model,
            meta,
            nav,
            &node.options,
            node.levels,
            escape_char,
            max_depth,
            depth,
        )?);
    }
    Ok(fetches)
}

#[allow(clippy::too_many_arguments)]
fn compile_one(
    model: &EntityModel,
    meta: &EntityMetadata,
    nav: &NavigationMetadata,
    options: &QueryOptions,
    levels: Option<ExpandLevels>,
    escape_char: char,
    max_depth: u32,
    depth: u32,
) -> Result<ExpandFetch> {
    let target = model
        .set(&nav.target)
        .ok_or_else(|| Error::internal(format!("unsealed navigation target {}", nav.target)))?;
    if nav.foreign_keys.is_empty() {
        return Err(Error::validation(format!(
            "navigation {} declares no foreign keys",
            nav.name
        )));
    }
    let mut link_from = Vec::new();
    let mut link_to = Vec::new();
    for (from, to) in &nav.foreign_keys {
        link_from.push(property_column(meta, from)?);
        link_to.push(property_column(target, to)?);
    }

    let mut ctx = PredicateCtx::new(model, target, options, None, escape_char);
    let mut plan = SelectPlan {
        table: target.table.clone(),
        ..Default::default()
    };
    if let Some(filter) = &options.filter {
        plan.predicate = Some(ctx.compile(filter)?);
    }
    plan.columns = projection(target, &options.select, &link_to)?;
    for item in &options.order_by {
        let (expr, _) = ctx.resolve_path(&item.path)?;
        plan.order.push(OrderSpec {
            expr,
            descending: item.descending,
        });
    }
    // Key tiebreak keeps per-parent windowing deterministic.
    for key in target.keys() {
        let already = plan.order.iter().any(
            |o| matches!(&o.expr, SqlExpr::Column { name, .. } if *name == key.column),
        );
        if !already {
            plan.order.push(OrderSpec {
                expr: SqlExpr::qualified(target.table.clone(), key.column.clone()),
                descending: false,
            });
        }
    }
    plan.joins = std::mem::take(&mut ctx.joins);

    // $levels recurses a self-shaped navigation; clamp to the server cap.
    let mut nested =
        compile_expands(model, target, &options.expand, escape_char, max_depth, depth + 1)?;
    if let Some(levels) = levels {
        // Clamp silently to the depth budget left below this node.
        let budget = max_depth.saturating_sub(depth) + 1;
        let remaining = match levels {
            ExpandLevels::Depth(n) => n.min(budget),
            ExpandLevels::Max => budget,
        };
        if remaining > 1 {
            if let Some(self_nav) = target.find_navigation(&nav.name) {
                nested.push(compile_one(
                    model,
                    target,
                    self_nav,
                    options,
                    Some(ExpandLevels::Depth(remaining - 1)),
                    escape_char,
                    max_depth,
                    depth + 1,
                )?);
            }
        }
    }

    Ok(ExpandFetch {
        nav: nav.clone(),
        link_from,
        link_to,
        plan,
        per_parent_skip: options.skip,
        per_parent_top: options.top,
        include_count: options.count == Some(true),
        nested,
    })
}

/// Nested projection: selected columns plus keys and link columns, or every
/// structural column when `$select` is absent.
fn projection(
    target: &EntityMetadata,
    select: &[SelectItem],
    link_to: &[String],
) -> Result<Vec<SelectColumn>> {
    let mut columns: Vec<String> = Vec::new();
    if select.is_empty() || select.contains(&SelectItem::Wildcard) {
        columns.extend(
            target
                .properties
                .iter()
                .filter(|p| !p.stream)
                .map(|p| p.column.clone()),
        );
    } else {
        for item in select {
            let SelectItem::Path(path) = item else {
                continue;
            };
            if path.len() != 1 {
                continue;
            }
            let prop = target.find_property(&path[0]).ok_or_else(|| {
                Error::validation(format!(
                    "selected property {} does not exist on {}",
                    path[0], target.set_name
                ))
            })?;
            columns.push(prop.column.clone());
        }
        for key in target.keys() {
            if !columns.contains(&key.column) {
                columns.push(key.column.clone());
            }
        }
        for link in link_to {
            if !columns.contains(link) {
                columns.push(link.clone());
            }
        }
    }
    Ok(columns
        .into_iter()
        .map(|c| SelectColumn {
            expr: SqlExpr::qualified(target.table.clone(), c.clone()),
            alias: c,
        })
        .collect())
}

fn property_column(meta: &EntityMetadata, property: &str) -> Result<String> {
    meta.find_property(property)
        .map(|p| p.column.clone())
        .ok_or_else(|| {
            Error::validation(format!(
                "property {property} does not exist on {}",
                meta.set_name
            ))
        })
}

/// Execute the expand fetches for a page of parent rows: one store query per
/// node, children grouped back onto their parents in memory.
pub async fn run_expands(
    store: &dyn Store,
    fetches: &[ExpandFetch],
    rows: Vec<Row>,
) -> Result<Vec<EntityResult>> {
    let mut results: Vec<EntityResult> = rows.into_iter().map(EntityResult::bare).collect();
    for fetch in fetches {
        attach_expansion(store, fetch, &mut results).await?;
    }
    Ok(results)
}

/// Boxed for recursion: nested expand nodes re-enter this function.
fn attach_expansion<'a>(
    store: &'a dyn Store,
    fetch: &'a ExpandFetch,
    parents: &'a mut [EntityResult],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(attach_expansion_inner(store, fetch, parents))
}

async fn attach_expansion_inner(
    store: &dyn Store,
    fetch: &ExpandFetch,
    parents: &mut [EntityResult],
) -> Result<()> {
    // Gather distinct parent link tuples.
    let mut keys: Vec<Vec<Value>> = Vec::new();
    for parent in parents.iter() {
        let tuple: Vec<Value> = fetch
            .link_from
            .iter()
            .map(|col| parent.row.get(col).cloned().unwrap_or(Value::Null))
            .collect();
        if !tuple.iter().any(Value::is_null) && !keys.contains(&tuple) {
            keys.push(tuple);
        }
    }

    let children = if keys.is_empty() {
        Vec::new()
    } else {
        let mut plan = fetch.plan.clone();
        let link_exprs: Vec<SqlExpr> = fetch
            .link_to
            .iter()
            .map(|c| SqlExpr::qualified(plan.table.clone(), c.clone()))
            .collect();
        let key_predicate = if link_exprs.len() == 1 {
            SqlExpr::In {
                expr: Box::new(link_exprs.into_iter().next().unwrap()),
                list: keys
                    .iter()
                    .map(|k| SqlExpr::Literal(k[0].clone()))
                    .collect(),
            }
        } else {
            SqlExpr::TupleIn {
                exprs: link_exprs,
                rows: keys.clone(),
            }
        };
        plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), key_predicate));
        store.query(&plan).await?
    };

    // Recurse before grouping so nested expansions ride along.
    let children = if fetch.nested.is_empty() {
        children.into_iter().map(EntityResult::bare).collect()
    } else {
        let mut nested_results: Vec<EntityResult> =
            children.into_iter().map(EntityResult::bare).collect();
        for nested in &fetch.nested {
            attach_expansion(store, nested, &mut nested_results).await?;
        }
        nested_results
    };

    // Group children by link tuple.
    let mut grouped: HashMap<Vec<String>, Vec<EntityResult>> = HashMap::new();
    for child in children {
        let tuple: Vec<String> = fetch
            .link_to
            .iter()
            .map(|col| {
                child
                    .row
                    .get(col)
                    .map(Value::raw_text)
                    .unwrap_or_default()
            })
            .collect();
        grouped.entry(tuple).or_default().push(child);
    }

    for parent in parents.iter_mut() {
        let tuple: Vec<String> = fetch
            .link_from
            .iter()
            .map(|col| {
                parent
                    .row
                    .get(col)
                    .map(Value::raw_text)
                    .unwrap_or_default()
            })
            .collect();
        let mut items = grouped.get(&tuple).cloned().unwrap_or_default();
        let count = fetch.include_count.then(|| items.len() as u64);
        if let Some(skip) = fetch.per_parent_skip {
            items = items.into_iter().skip(skip as usize).collect();
        }
        if let Some(top) = fetch.per_parent_top {
            items.truncate(top as usize);
        }
        let expansion = if fetch.nav.collection {
            ExpansionResult::Collection { items, count }
        } else {
            ExpansionResult::Single(items.into_iter().next().map(Box::new))
        };
        parent
            .expansions
            .push((fetch.nav.name.clone(), expansion));
    }
    Ok(())
}
