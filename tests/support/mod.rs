//! In-memory Store used by the integration suite: interprets compiled plans
//! over plain row vectors, with snapshot transactions and a query counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use odata_server::plan::{Join, OrderSpec, SelectColumn, SelectPlan, SqlBinOp, SqlExpr, SqlFunc};
use odata_server::store::{Row, Store, StoreError, StoreTx};
use odata_server::value::Value;

#[derive(Clone, Default)]
pub struct Table {
    pub rows: Vec<Row>,
    /// Column that auto-increments when absent from an insert.
    pub auto_key: Option<String>,
    /// Columns that must be unique together (primary key).
    pub key_columns: Vec<String>,
}

type Tables = HashMap<String, Table>;

#[derive(Clone)]
pub struct MemStore {
    tables: Arc<Mutex<Tables>>,
    pub queries: Arc<AtomicU64>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            tables: Arc::new(Mutex::new(HashMap::new())),
            queries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_table(self, name: &str, table: Table) -> Self {
        self.tables.lock().unwrap().insert(name.to_string(), table);
        self
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn query(&self, plan: &SelectPlan) -> Result<Vec<Row>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().unwrap();
        eval_plan(&tables, plan)
    }

    async fn count(&self, plan: &SelectPlan) -> Result<u64, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().unwrap();
        let mut unbounded = plan.clone();
        unbounded.limit = None;
        unbounded.offset = None;
        Ok(eval_plan(&tables, &unbounded)?.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let snapshot = self.tables.lock().unwrap().clone();
        Ok(Box::new(MemTx {
            shared: self.tables.clone(),
            staged: snapshot,
        }))
    }
}

/// Snapshot transaction: mutations stage against a copy, commit swaps the
/// copy in, rollback drops it.
pub struct MemTx {
    shared: Arc<Mutex<Tables>>,
    staged: Tables,
}

#[async_trait]
impl StoreTx for MemTx {
    async fn query(&mut self, plan: &SelectPlan) -> Result<Vec<Row>, StoreError> {
        eval_plan(&self.staged, plan)
    }

    async fn insert(&mut self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        let table = self
            .staged
            .get_mut(table)
            .ok_or_else(|| StoreError::Backend(format!("unknown table {table}")))?;
        if let Some(auto) = &table.auto_key {
            if !row.contains_key(auto) {
                let next = table
                    .rows
                    .iter()
                    .filter_map(|r| match r.get(auto) {
                        Some(Value::Int(i)) => Some(*i),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0)
                    + 1;
                row.insert(auto.clone(), Value::Int(next));
            }
        }
        if !table.key_columns.is_empty() {
            let duplicate = table.rows.iter().any(|existing| {
                table
                    .key_columns
                    .iter()
                    .all(|col| existing.get(col) == row.get(col))
            });
            if duplicate {
                return Err(StoreError::Conflict("duplicate key".into()));
            }
        }
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &str,
        predicate: &SqlExpr,
        changes: Row,
    ) -> Result<u64, StoreError> {
        let snapshot = self.staged.clone();
        let table = self
            .staged
            .get_mut(table)
            .ok_or_else(|| StoreError::Backend(format!("unknown table {table}")))?;
        let mut affected = 0;
        for row in table.rows.iter_mut() {
            let env = row_env(row, None);
            if truthy(&eval_expr(&snapshot, predicate, &env)?) {
                for (col, value) in &changes {
                    row.insert(col.clone(), value.clone());
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&mut self, table: &str, predicate: &SqlExpr) -> Result<u64, StoreError> {
        let snapshot = self.staged.clone();
        let table = self
            .staged
            .get_mut(table)
            .ok_or_else(|| StoreError::Backend(format!("unknown table {table}")))?;
        let before = table.rows.len();
        let mut kept = Vec::new();
        for row in table.rows.drain(..) {
            let env = row_env(&row, None);
            if !truthy(&eval_expr(&snapshot, predicate, &env)?) {
                kept.push(row);
            }
        }
        table.rows = kept;
        Ok((before - table.rows.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        *self.shared.lock().unwrap() = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

// ───────────────────────── plan evaluation ─────────────────────────

/// Column environment: plain names plus `qualifier.name` entries.
type Env = HashMap<String, Value>;

fn row_env(row: &Row, qualifier: Option<&str>) -> Env {
    let mut env = Env::new();
    for (col, value) in row {
        env.insert(col.clone(), value.clone());
        if let Some(q) = qualifier {
            env.insert(format!("{q}.{col}"), value.clone());
        }
    }
    env
}

fn eval_plan(tables: &Tables, plan: &SelectPlan) -> Result<Vec<Row>, StoreError> {
    let base = tables
        .get(&plan.table)
        .ok_or_else(|| StoreError::Backend(format!("unknown table {}", plan.table)))?;

    // Base rows qualified by table name, then LEFT JOINs by alias.
    let mut envs: Vec<Env> = base
        .rows
        .iter()
        .map(|row| row_env(row, Some(&plan.table)))
        .collect();
    for join in &plan.joins {
        envs = apply_join(tables, envs, join)?;
    }

    let mut matched = Vec::new();
    for env in envs {
        let keep = match &plan.predicate {
            Some(predicate) => truthy(&eval_expr(tables, predicate, &env)?),
            None => true,
        };
        if keep {
            matched.push(env);
        }
    }

    let mut rows = if !plan.group_by.is_empty() || has_aggregates(&plan.columns) {
        aggregate(tables, plan, matched)?
    } else {
        matched
            .iter()
            .map(|env| project(tables, plan, env))
            .collect::<Result<Vec<_>, _>>()?
    };

    if !plan.order.is_empty() && plan.group_by.is_empty() {
        sort_rows(&mut rows, &plan.order);
    }
    if let Some(offset) = plan.offset {
        rows = rows.into_iter().skip(offset as usize).collect();
    }
    if let Some(limit) = plan.limit {
        rows.truncate(limit as usize);
    }
    Ok(rows)
}

fn apply_join(tables: &Tables, envs: Vec<Env>, join: &Join) -> Result<Vec<Env>, StoreError> {
    let target = tables
        .get(&join.table)
        .ok_or_else(|| StoreError::Backend(format!("unknown table {}", join.table)))?;
    let mut joined = Vec::new();
    for env in envs {
        let mut any = false;
        for row in &target.rows {
            let mut candidate = env.clone();
            for (col, value) in row {
                candidate.insert(format!("{}.{col}", join.alias), value.clone());
            }
            if truthy(&eval_expr(tables, &join.on, &candidate)?) {
                joined.push(candidate);
                any = true;
            }
        }
        if !any {
            joined.push(env);
        }
    }
    Ok(joined)
}

fn project(tables: &Tables, plan: &SelectPlan, env: &Env) -> Result<Row, StoreError> {
    if plan.columns.is_empty() {
        // SELECT *: every unqualified column of the environment.
        let mut row = Row::new();
        for (key, value) in env {
            if !key.contains('.') {
                row.insert(key.clone(), value.clone());
            }
        }
        return Ok(row);
    }
    let mut row = Row::new();
    for column in &plan.columns {
        row.insert(column.alias.clone(), eval_expr(tables, &column.expr, env)?);
    }
    Ok(row)
}

fn sort_rows(rows: &mut [Row], order: &[OrderSpec]) {
    rows.sort_by(|a, b| {
        for spec in order {
            let key = order_key(&spec.expr);
            let left = a.get(&key).cloned().unwrap_or(Value::Null);
            let right = b.get(&key).cloned().unwrap_or(Value::Null);
            let ordering = left
                .compare(&right)
                .unwrap_or(std::cmp::Ordering::Equal);
            let ordering = if spec.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn order_key(expr: &SqlExpr) -> String {
    match expr {
        SqlExpr::Column { name, .. } => name.clone(),
        _ => String::new(),
    }
}

fn has_aggregates(columns: &[SelectColumn]) -> bool {
    columns.iter().any(|c| {
        matches!(
            &c.expr,
            SqlExpr::Func { func, .. } if matches!(
                func,
                SqlFunc::AggSum
                    | SqlFunc::AggMin
                    | SqlFunc::AggMax
                    | SqlFunc::AggAvg
                    | SqlFunc::AggCount
                    | SqlFunc::AggCountDistinct
            )
        )
    })
}

fn aggregate(
    tables: &Tables,
    plan: &SelectPlan,
    envs: Vec<Env>,
) -> Result<Vec<Row>, StoreError> {
    let mut groups: Vec<(Vec<Value>, Vec<Env>)> = Vec::new();
    for env in envs {
        let key: Vec<Value> = plan
            .group_by
            .iter()
            .map(|k| eval_expr(tables, k, &env))
            .collect::<Result<_, _>>()?;
        if let Some(idx) = groups.iter().position(|(k, _)| *k == key) {
            groups[idx].1.push(env);
        } else {
            groups.push((key, vec![env]));
        }
    }
    if plan.group_by.is_empty() && groups.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    let mut rows = Vec::new();
    for (_, members) in groups {
        let mut row = Row::new();
        for column in &plan.columns {
            let value = match &column.expr {
                SqlExpr::Func { func, args } if is_agg(func) => {
                    let inputs: Vec<Value> = members
                        .iter()
                        .map(|env| {
                            args.first()
                                .map(|a| eval_expr(tables, a, env))
                                .unwrap_or(Ok(Value::Null))
                        })
                        .collect::<Result<_, _>>()?;
                    fold_aggregate(*func, &inputs)
                }
                expr => members
                    .first()
                    .map(|env| eval_expr(tables, expr, env))
                    .unwrap_or(Ok(Value::Null))?,
            };
            row.insert(column.alias.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn is_agg(func: &SqlFunc) -> bool {
    matches!(
        func,
        SqlFunc::AggSum
            | SqlFunc::AggMin
            | SqlFunc::AggMax
            | SqlFunc::AggAvg
            | SqlFunc::AggCount
            | SqlFunc::AggCountDistinct
    )
}

fn fold_aggregate(func: SqlFunc, inputs: &[Value]) -> Value {
    let numeric: Vec<f64> = inputs
        .iter()
        .filter_map(|v| match v {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        })
        .collect();
    match func {
        SqlFunc::AggCount => Value::Int(inputs.len() as i64),
        SqlFunc::AggCountDistinct => {
            let mut seen: Vec<String> = Vec::new();
            for v in inputs {
                let text = v.raw_text();
                if !seen.contains(&text) {
                    seen.push(text);
                }
            }
            Value::Int(seen.len() as i64)
        }
        SqlFunc::AggSum => Value::Double(numeric.iter().sum()),
        SqlFunc::AggAvg => {
            if numeric.is_empty() {
                Value::Null
            } else {
                Value::Double(numeric.iter().sum::<f64>() / numeric.len() as f64)
            }
        }
        SqlFunc::AggMin => numeric
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            })
            .map(Value::Double)
            .unwrap_or(Value::Null),
        SqlFunc::AggMax => numeric
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
            .map(Value::Double)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn lookup(env: &Env, qualifier: &Option<String>, name: &str) -> Value {
    if let Some(q) = qualifier {
        if let Some(v) = env.get(&format!("{q}.{name}")) {
            return v.clone();
        }
    }
    env.get(name).cloned().unwrap_or(Value::Null)
}

fn eval_expr(tables: &Tables, expr: &SqlExpr, env: &Env) -> Result<Value, StoreError> {
    Ok(match expr {
        SqlExpr::Column { qualifier, name } => lookup(env, qualifier, name),
        SqlExpr::Literal(v) => v.clone(),
        SqlExpr::Bool(b) => Value::Boolean(*b),
        SqlExpr::Bin { op, left, right } => {
            let l = eval_expr(tables, left, env)?;
            let r = eval_expr(tables, right, env)?;
            eval_binary(*op, &l, &r)
        }
        SqlExpr::Not(inner) => Value::Boolean(!truthy(&eval_expr(tables, inner, env)?)),
        SqlExpr::Neg(inner) => match eval_expr(tables, inner, env)? {
            Value::Int(i) => Value::Int(-i),
            Value::Double(d) => Value::Double(-d),
            _ => Value::Null,
        },
        SqlExpr::Func { func, args } => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| eval_expr(tables, a, env))
                .collect::<Result<_, _>>()?;
            eval_func(*func, &values)
        }
        SqlExpr::Like { expr, pattern } => {
            let target = eval_expr(tables, expr, env)?;
            let Value::String(text) = target else {
                return Ok(Value::Boolean(false));
            };
            Value::Boolean(like_match(&text, pattern))
        }
        SqlExpr::In { expr, list } => {
            let target = eval_expr(tables, expr, env)?;
            let mut found = false;
            for item in list {
                if eval_expr(tables, item, env)? == target {
                    found = true;
                    break;
                }
            }
            Value::Boolean(found)
        }
        SqlExpr::TupleIn { exprs, rows } => {
            let tuple: Vec<Value> = exprs
                .iter()
                .map(|e| eval_expr(tables, e, env))
                .collect::<Result<_, _>>()?;
            Value::Boolean(rows.contains(&tuple))
        }
        SqlExpr::IsNull { expr, negated } => {
            let v = eval_expr(tables, expr, env)?;
            Value::Boolean(v.is_null() != *negated)
        }
        SqlExpr::Exists { plan, negated } => {
            // Correlated: the inner predicate may reference outer columns.
            let inner = tables
                .get(&plan.table)
                .ok_or_else(|| StoreError::Backend(format!("unknown table {}", plan.table)))?;
            let mut any = false;
            for row in &inner.rows {
                let mut candidate = env.clone();
                for (col, value) in row {
                    candidate.insert(format!("{}.{col}", plan.table), value.clone());
                }
                let keep = match &plan.predicate {
                    Some(p) => truthy(&eval_expr(tables, p, &candidate)?),
                    None => true,
                };
                if keep {
                    any = true;
                    break;
                }
            }
            Value::Boolean(any != *negated)
        }
    })
}

fn eval_binary(op: SqlBinOp, l: &Value, r: &Value) -> Value {
    use std::cmp::Ordering::*;
    match op {
        SqlBinOp::And => Value::Boolean(truthy(l) && truthy(r)),
        SqlBinOp::Or => Value::Boolean(truthy(l) || truthy(r)),
        SqlBinOp::Eq => Value::Boolean(l.compare(r) == Some(Equal)),
        SqlBinOp::Ne => Value::Boolean(l.compare(r) != Some(Equal)),
        SqlBinOp::Gt => Value::Boolean(l.compare(r) == Some(Greater)),
        SqlBinOp::Ge => Value::Boolean(matches!(l.compare(r), Some(Greater | Equal))),
        SqlBinOp::Lt => Value::Boolean(l.compare(r) == Some(Less)),
        SqlBinOp::Le => Value::Boolean(matches!(l.compare(r), Some(Less | Equal))),
        SqlBinOp::Add | SqlBinOp::Sub | SqlBinOp::Mul | SqlBinOp::Div | SqlBinOp::Mod => {
            arithmetic(op, l, r)
        }
        SqlBinOp::BitAnd => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Value::Int(a & b),
            _ => Value::Null,
        },
    }
}

fn arithmetic(op: SqlBinOp, l: &Value, r: &Value) -> Value {
    let (a, b) = match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Value::Null,
    };
    let result = match op {
        SqlBinOp::Add => a + b,
        SqlBinOp::Sub => a - b,
        SqlBinOp::Mul => a * b,
        SqlBinOp::Div => {
            if b == 0.0 {
                return Value::Null;
            }
            a / b
        }
        SqlBinOp::Mod => {
            if b == 0.0 {
                return Value::Null;
            }
            a % b
        }
        _ => unreachable!(),
    };
    if let (Value::Int(_), Value::Int(_)) = (l, r) {
        if result == result.trunc() {
            return Value::Int(result as i64);
        }
    }
    Value::Double(result)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Double(d) => Some(*d),
        _ => None,
    }
}

fn eval_func(func: SqlFunc, args: &[Value]) -> Value {
    let text = |i: usize| -> Option<String> {
        match args.get(i) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.raw_text()),
            _ => None,
        }
    };
    match func {
        SqlFunc::Lower => text(0).map(|s| Value::String(s.to_lowercase())).unwrap_or(Value::Null),
        SqlFunc::Upper => text(0).map(|s| Value::String(s.to_uppercase())).unwrap_or(Value::Null),
        SqlFunc::Trim => text(0).map(|s| Value::String(s.trim().to_string())).unwrap_or(Value::Null),
        SqlFunc::Length => text(0)
            .map(|s| Value::Int(s.chars().count() as i64))
            .unwrap_or(Value::Null),
        SqlFunc::Concat => match (text(0), text(1)) {
            (Some(a), Some(b)) => Value::String(format!("{a}{b}")),
            _ => Value::Null,
        },
        SqlFunc::IndexOf => match (text(0), text(1)) {
            // One-based like SQL INSTR; the compiler subtracts one.
            (Some(haystack), Some(needle)) => Value::Int(
                haystack
                    .find(&needle)
                    .map(|i| i as i64 + 1)
                    .unwrap_or(0),
            ),
            _ => Value::Null,
        },
        SqlFunc::Substring => match (text(0), args.get(1)) {
            (Some(s), Some(Value::Int(start))) => {
                let start = (*start as usize).saturating_sub(1);
                let taken: String = match args.get(2) {
                    Some(Value::Int(len)) => {
                        s.chars().skip(start).take(*len as usize).collect()
                    }
                    _ => s.chars().skip(start).collect(),
                };
                Value::String(taken)
            }
            _ => Value::Null,
        },
        SqlFunc::Round => as_f64(args.first().unwrap_or(&Value::Null))
            .map(|d| Value::Double(d.round()))
            .unwrap_or(Value::Null),
        SqlFunc::Ceiling => as_f64(args.first().unwrap_or(&Value::Null))
            .map(|d| Value::Double(d.ceil()))
            .unwrap_or(Value::Null),
        SqlFunc::Floor => as_f64(args.first().unwrap_or(&Value::Null))
            .map(|d| Value::Double(d.floor()))
            .unwrap_or(Value::Null),
        SqlFunc::Matches => match (text(0), text(1)) {
            (Some(s), Some(pattern)) => regex::Regex::new(&pattern)
                .map(|re| Value::Boolean(re.is_match(&s)))
                .unwrap_or(Value::Boolean(false)),
            _ => Value::Boolean(false),
        },
        SqlFunc::Year | SqlFunc::Month | SqlFunc::Day | SqlFunc::Hour | SqlFunc::Minute
        | SqlFunc::Second => match args.first() {
            Some(Value::DateTime(dt)) => {
                use chrono::{Datelike, Timelike};
                let n = match func {
                    SqlFunc::Year => dt.year() as i64,
                    SqlFunc::Month => dt.month() as i64,
                    SqlFunc::Day => dt.day() as i64,
                    SqlFunc::Hour => dt.hour() as i64,
                    SqlFunc::Minute => dt.minute() as i64,
                    _ => dt.second() as i64,
                };
                Value::Int(n)
            }
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn truthy(v: &Value) -> bool {
    matches!(v, Value::Boolean(true))
}

/// LIKE with `\` escapes, `%` and `_` wildcards.
fn like_match(text: &str, pattern: &str) -> bool {
    let mut regex = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    regex.push_str(&regex::escape(&next.to_string()));
                }
            }
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

// ───────────────────────── fixture ─────────────────────────

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// The products fixture the boundary scenarios run against.
pub fn products_store() -> MemStore {
    let products = Table {
        rows: vec![
            row(&[
                ("ID", Value::Int(1)),
                ("Name", Value::String("Laptop".into())),
                ("Price", Value::Double(999.99)),
            ]),
            row(&[
                ("ID", Value::Int(2)),
                ("Name", Value::String("Smartphone".into())),
                ("Price", Value::Double(799.99)),
            ]),
            row(&[
                ("ID", Value::Int(3)),
                ("Name", Value::String("Chair".into())),
                ("Price", Value::Double(249.99)),
            ]),
            row(&[
                ("ID", Value::Int(4)),
                ("Name", Value::String("Mouse".into())),
                ("Price", Value::Double(29.99)),
            ]),
            row(&[
                ("ID", Value::Int(5)),
                ("Name", Value::String("Mug".into())),
                ("Price", Value::Double(9.99)),
            ]),
        ],
        auto_key: Some("ID".into()),
        key_columns: vec!["ID".into()],
    };
    let descriptions = Table {
        rows: vec![
            row(&[
                ("ID", Value::Int(1)),
                ("ProductID", Value::Int(1)),
                ("LanguageKey", Value::String("EN".into())),
                ("Text", Value::String("A fast laptop".into())),
            ]),
            row(&[
                ("ID", Value::Int(2)),
                ("ProductID", Value::Int(1)),
                ("LanguageKey", Value::String("DE".into())),
                ("Text", Value::String("Ein schneller Laptop".into())),
            ]),
            row(&[
                ("ID", Value::Int(3)),
                ("ProductID", Value::Int(2)),
                ("LanguageKey", Value::String("EN".into())),
                ("Text", Value::String("A shiny smartphone".into())),
            ]),
        ],
        auto_key: None,
        key_columns: vec!["ID".into()],
    };
    MemStore::new()
        .with_table("products", products)
        .with_table("product_descriptions", descriptions)
}
