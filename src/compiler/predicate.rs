use std::collections::HashMap;

use crate::ast::{BinaryOp, Expr, LambdaOp, QueryOptions, UnaryOp};
use crate::error::{Error, Result};
use crate::metadata::{EntityMetadata, EntityModel, NavigationMetadata};
use crate::plan::{Join, SelectColumn, SelectPlan, SqlBinOp, SqlExpr, SqlFunc, like_escape};
use crate::store::GeospatialBackend;
use crate::value::{EdmType, Value};

/// Shared state while compiling expressions for one request: accumulated
/// joins, the path→alias cache, and the lambda scope stack.
pub(crate) struct PredicateCtx<'a> {
    pub model: &'a EntityModel,
    pub meta: &'a EntityMetadata,
    pub options: &'a QueryOptions,
    pub geo: Option<&'a dyn GeospatialBackend>,
    pub escape_char: char,
    pub joins: Vec<Join>,
    path_aliases: HashMap<String, String>,
    next_alias: usize,
    scopes: Vec<LambdaScope>,
}

struct LambdaScope {
    var: String,
    set: String,
    qualifier: String,
}

impl<'a> PredicateCtx<'a> {
    pub fn new(
        model: &'a EntityModel,
        meta: &'a EntityMetadata,
        options: &'a QueryOptions,
        geo: Option<&'a dyn GeospatialBackend>,
        escape_char: char,
    ) -> Self {
        PredicateCtx {
            model,
            meta,
            options,
            geo,
            escape_char,
            joins: Vec::new(),
            path_aliases: HashMap::new(),
            next_alias: 0,
            scopes: Vec::new(),
        }
    }

    fn base_qualifier(&self) -> String {
        self.meta.table.clone()
    }

    /// Join a single-valued navigation once per distinct path; repeated
    /// references reuse the cached alias.
    fn ensure_join(
        &mut self,
        qualifier: &str,
        nav: &NavigationMetadata,
        source: &EntityMetadata,
    ) -> Result<String> {
        let cache_key = format!("{qualifier}/{}", nav.name);
        if let Some(alias) = self.path_aliases.get(&cache_key) {
            return Ok(alias.clone());
        }
        let target = self
            .model
            .set(&nav.target)
            .ok_or_else(|| Error::internal(format!("unsealed navigation target {}", nav.target)))?;
        self.next_alias += 1;
        let alias = format!("nav{}", self.next_alias);
        let mut on: Option<SqlExpr> = None;
        for (from, to) in &nav.foreign_keys {
            let from_col = column_of(source, from)?;
            let to_col = column_of(target, to)?;
            let pair = SqlExpr::eq(
                SqlExpr::qualified(alias.clone(), to_col),
                SqlExpr::qualified(qualifier.to_string(), from_col),
            );
            on = Some(match on {
                Some(acc) => SqlExpr::and(acc, pair),
                None => pair,
            });
        }
        let on = on.ok_or_else(|| {
            Error::validation(format!(
                "navigation {} declares no foreign keys",
                nav.name
            ))
        })?;
        self.joins.push(Join {
            table: target.table.clone(),
            alias: alias.clone(),
            on,
        });
        self.path_aliases.insert(cache_key, alias.clone());
        Ok(alias)
    }

    /// Resolve a property path to a column expression plus its declared type.
    pub fn resolve_path(&mut self, path: &[String]) -> Result<(SqlExpr, Option<EdmType>)> {
        let (mut meta, mut qualifier, mut idx) = self.path_scope(path);
        // Compute aliases are only addressable at the root scope.
        if idx == 0 && path.len() == 1 && self.scopes.is_empty() {
            if let Some(item) = self.options.compute_alias(&path[0]) {
                let expr = item.expr.clone();
                let compiled = self.compile(&expr)?;
                return Ok((compiled, None));
            }
        }
        while idx < path.len() - 1 {
            let segment = &path[idx];
            let nav = meta.find_navigation(segment).ok_or_else(|| {
                Error::validation(format!(
                    "property {segment} does not exist on {}",
                    meta.set_name
                ))
            })?;
            if nav.collection {
                return Err(Error::validation(format!(
                    "collection navigation {segment} requires any/all"
                )));
            }
            let nav = nav.clone();
            qualifier = self.ensure_join(&qualifier, &nav, meta)?;
            meta = self
                .model
                .set(&nav.target)
                .ok_or_else(|| Error::internal("dangling navigation target"))?;
            idx += 1;
        }
        let last = &path[idx];
        let prop = meta.find_property(last).ok_or_else(|| {
            Error::validation(format!(
                "property {last} does not exist on {}",
                meta.set_name
            ))
        })?;
        Ok((
            SqlExpr::qualified(qualifier, prop.column.clone()),
            Some(prop.ty.clone()),
        ))
    }

    /// Pick the metadata scope a path starts in: a lambda range variable,
    /// `$it` (the root), or the current entity.
    fn path_scope(&self, path: &[String]) -> (&'a EntityMetadata, String, usize) {
        if let Some(first) = path.first() {
            if first == "$it" {
                return (self.meta, self.base_qualifier(), 1);
            }
            for scope in self.scopes.iter().rev() {
                if &scope.var == first {
                    let meta = self
                        .model
                        .set(&scope.set)
                        .expect("lambda scope references sealed set");
                    return (meta, scope.qualifier.clone(), 1);
                }
            }
        }
        match self.scopes.last() {
            Some(scope) => {
                let meta = self
                    .model
                    .set(&scope.set)
                    .expect("lambda scope references sealed set");
                (meta, scope.qualifier.clone(), 0)
            }
            None => (self.meta, self.base_qualifier(), 0),
        }
    }

    pub fn compile(&mut self, expr: &Expr) -> Result<SqlExpr> {
        match expr {
            Expr::Literal { value, .. } => Ok(SqlExpr::Literal(value.clone())),
            Expr::Property(path) => Ok(self.resolve_path(path)?.0),
            Expr::Alias(name) => {
                let aliased = self
                    .options
                    .aliases
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::validation(format!("parameter alias @{name} is not defined"))
                    })?;
                self.compile(&aliased)
            }
            Expr::Binary { op, left, right } => self.compile_binary(*op, left, right),
            Expr::Unary { op, operand } => {
                let inner = self.compile(operand)?;
                Ok(match op {
                    UnaryOp::Not => SqlExpr::Not(Box::new(inner)),
                    UnaryOp::Neg => SqlExpr::Neg(Box::new(inner)),
                })
            }
            Expr::Call { name, args } => self.compile_call(name, args),
            Expr::Lambda {
                op,
                range_var,
                target,
                predicate,
            } => self.compile_lambda(*op, range_var, target, predicate.as_deref()),
            Expr::In { expr, list } => {
                let lhs = self.compile(expr)?;
                let values = list
                    .iter()
                    .map(|item| self.compile(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(SqlExpr::In {
                    expr: Box::new(lhs),
                    list: values,
                })
            }
            // cast() is a typed passthrough at the store level; range checks
            // happen when values surface.
            Expr::Cast { expr, ty: _ } => match expr {
                Some(inner) => self.compile(inner),
                None => Err(Error::validation("cast() requires an expression argument")),
            },
            Expr::IsOf { expr, ty } => self.compile_isof(expr.as_deref(), ty),
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<SqlExpr> {
        if op == BinaryOp::Has {
            return self.compile_has(left, right);
        }
        // null comparisons become IS [NOT] NULL.
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let (null_side, other) = match (left, right) {
                (Expr::Literal { value, .. }, other) if value.is_null() => (true, other),
                (other, Expr::Literal { value, .. }) if value.is_null() => (true, other),
                _ => (false, left),
            };
            if null_side {
                let inner = self.compile(other)?;
                return Ok(SqlExpr::IsNull {
                    expr: Box::new(inner),
                    negated: op == BinaryOp::Ne,
                });
            }
        }
        if op.is_comparison() {
            self.check_comparable(left, right)?;
        }
        let sql_op = match op {
            BinaryOp::Or => SqlBinOp::Or,
            BinaryOp::And => SqlBinOp::And,
            BinaryOp::Eq => SqlBinOp::Eq,
            BinaryOp::Ne => SqlBinOp::Ne,
            BinaryOp::Gt => SqlBinOp::Gt,
            BinaryOp::Ge => SqlBinOp::Ge,
            BinaryOp::Lt => SqlBinOp::Lt,
            BinaryOp::Le => SqlBinOp::Le,
            BinaryOp::Add => SqlBinOp::Add,
            BinaryOp::Sub => SqlBinOp::Sub,
            BinaryOp::Mul => SqlBinOp::Mul,
            BinaryOp::Div => SqlBinOp::Div,
            BinaryOp::Mod => SqlBinOp::Mod,
            BinaryOp::Has => unreachable!(),
        };
        let l = self.compile(left)?;
        let r = self.compile(right)?;
        Ok(SqlExpr::bin(sql_op, l, r))
    }

    /// `has` tests flag membership: `(col & member) = member`.
    fn compile_has(&mut self, left: &Expr, right: &Expr) -> Result<SqlExpr> {
        let Expr::Property(path) = left else {
            return Err(Error::validation("has requires a property on the left"));
        };
        let (col, ty) = self.resolve_path(path)?;
        let Some(EdmType::Enum(enum_name)) = ty else {
            return Err(Error::validation("has requires an enum-typed property"));
        };
        let enum_ty = self
            .model
            .enums
            .get(&enum_name)
            .or_else(|| {
                // Accept the unqualified name too.
                let short = enum_name.rsplit('.').next().unwrap_or(&enum_name);
                self.model.enums.get(short)
            })
            .ok_or_else(|| Error::validation(format!("unknown enum type {enum_name}")))?;
        let member_value = match right {
            Expr::Literal {
                value: Value::String(member),
                ..
            } => {
                // Accept `Member` and `NS.Type'Member'` spellings.
                let member = member.rsplit('\'').nth(1).unwrap_or(member);
                enum_ty
                    .members
                    .iter()
                    .find(|m| m.name == member)
                    .map(|m| m.value)
                    .ok_or_else(|| {
                        Error::validation(format!("unknown enum member {member}"))
                    })?
            }
            Expr::Literal {
                value: Value::Int(i),
                ..
            } => *i,
            _ => return Err(Error::validation("has requires an enum member literal")),
        };
        let masked = SqlExpr::bin(
            SqlBinOp::BitAnd,
            col,
            SqlExpr::Literal(Value::Int(member_value)),
        );
        Ok(SqlExpr::eq(masked, SqlExpr::Literal(Value::Int(member_value))))
    }

    fn compile_isof(&mut self, expr: Option<&Expr>, ty: &str) -> Result<SqlExpr> {
        if expr.is_some() {
            return Err(Error::validation(
                "isof() on arbitrary expressions is not supported",
            ));
        }
        // Without a discriminator, isof matches the empty set.
        let Some(disc) = &self.meta.type_discriminator else {
            return Ok(SqlExpr::Bool(false));
        };
        let (col, _) = self.resolve_path(&[disc.clone()])?;
        let short = ty.rsplit('.').next().unwrap_or(ty).to_string();
        Ok(SqlExpr::eq(col, SqlExpr::Literal(Value::String(short))))
    }

    fn compile_lambda(
        &mut self,
        op: LambdaOp,
        range_var: &str,
        target: &[String],
        predicate: Option<&Expr>,
    ) -> Result<SqlExpr> {
        // Walk single navigations up to the final collection navigation.
        let (mut meta, mut qualifier, mut idx) = self.path_scope(target);
        while idx < target.len() - 1 {
            let nav = meta
                .find_navigation(&target[idx])
                .cloned()
                .ok_or_else(|| {
                    Error::validation(format!("navigation {} does not exist", target[idx]))
                })?;
            if nav.collection {
                return Err(Error::validation(
                    "only the final lambda segment may be a collection",
                ));
            }
            qualifier = self.ensure_join(&qualifier, &nav, meta)?;
            meta = self
                .model
                .set(&nav.target)
                .ok_or_else(|| Error::internal("dangling navigation target"))?;
            idx += 1;
        }
        let nav = meta
            .find_navigation(&target[idx])
            .ok_or_else(|| {
                Error::validation(format!("navigation {} does not exist", target[idx]))
            })?
            .clone();
        if !nav.collection {
            return Err(Error::validation(format!(
                "{} is not a collection navigation",
                nav.name
            )));
        }
        let inner_meta = self
            .model
            .set(&nav.target)
            .ok_or_else(|| Error::internal("dangling navigation target"))?;

        // Correlate on every foreign-key component.
        let mut correlation: Option<SqlExpr> = None;
        for (from, to) in &nav.foreign_keys {
            let from_col = column_of(meta, from)?;
            let to_col = column_of(inner_meta, to)?;
            let pair = SqlExpr::eq(
                SqlExpr::qualified(inner_meta.table.clone(), to_col),
                SqlExpr::qualified(qualifier.clone(), from_col),
            );
            correlation = Some(match correlation {
                Some(acc) => SqlExpr::and(acc, pair),
                None => pair,
            });
        }
        let mut inner_pred = correlation.ok_or_else(|| {
            Error::validation(format!("navigation {} declares no foreign keys", nav.name))
        })?;

        if let Some(body) = predicate {
            self.scopes.push(LambdaScope {
                var: range_var.to_string(),
                set: nav.target.clone(),
                qualifier: inner_meta.table.clone(),
            });
            let compiled = self.compile(body);
            self.scopes.pop();
            let mut compiled = compiled?;
            // all(p) ≡ NOT EXISTS (NOT p).
            if op == LambdaOp::All {
                compiled = SqlExpr::Not(Box::new(compiled));
            }
            inner_pred = SqlExpr::and(inner_pred, compiled);
        } else if op == LambdaOp::All {
            return Err(Error::validation("all() requires a predicate"));
        }

        let subplan = SelectPlan {
            table: inner_meta.table.clone(),
            columns: vec![SelectColumn {
                expr: SqlExpr::Literal(Value::Int(1)),
                alias: "one".into(),
            }],
            predicate: Some(inner_pred),
            ..Default::default()
        };
        Ok(SqlExpr::Exists {
            plan: Box::new(subplan),
            negated: op == LambdaOp::All,
        })
    }

    fn compile_call(&mut self, name: &str, args: &[Expr]) -> Result<SqlExpr> {
        if let Some(geo_name) = name.strip_prefix("geo.") {
            let Some(backend) = self.geo else {
                return Err(Error::not_implemented(
                    "geospatial functions require a geospatial backend",
                ));
            };
            let compiled = args
                .iter()
                .map(|a| self.compile(a))
                .collect::<Result<Vec<_>>>()?;
            return backend.compile(geo_name, &compiled);
        }
        match name {
            "contains" | "startswith" | "endswith" => self.compile_match(name, args),
            "length" => self.unary_func(SqlFunc::Length, name, args),
            "tolower" => self.unary_func(SqlFunc::Lower, name, args),
            "toupper" => self.unary_func(SqlFunc::Upper, name, args),
            "trim" => self.unary_func(SqlFunc::Trim, name, args),
            "indexof" => {
                let compiled = self.exact_args(name, args, 2)?;
                // OData is zero-based; SQL INSTR is one-based.
                Ok(SqlExpr::bin(
                    SqlBinOp::Sub,
                    SqlExpr::Func {
                        func: SqlFunc::IndexOf,
                        args: compiled,
                    },
                    SqlExpr::Literal(Value::Int(1)),
                ))
            }
            "substring" => {
                let mut compiled = match args.len() {
                    2 | 3 => args
                        .iter()
                        .map(|a| self.compile(a))
                        .collect::<Result<Vec<_>>>()?,
                    n => {
                        return Err(Error::validation(format!(
                            "substring expects 2 or 3 arguments, got {n}"
                        )));
                    }
                };
                compiled[1] = SqlExpr::bin(
                    SqlBinOp::Add,
                    compiled[1].clone(),
                    SqlExpr::Literal(Value::Int(1)),
                );
                Ok(SqlExpr::Func {
                    func: SqlFunc::Substring,
                    args: compiled,
                })
            }
            "concat" => {
                let compiled = self.exact_args(name, args, 2)?;
                Ok(SqlExpr::Func {
                    func: SqlFunc::Concat,
                    args: compiled,
                })
            }
            "matchesPattern" => {
                let compiled = self.exact_args(name, args, 2)?;
                Ok(SqlExpr::Func {
                    func: SqlFunc::Matches,
                    args: compiled,
                })
            }
            "year" => self.unary_func(SqlFunc::Year, name, args),
            "month" => self.unary_func(SqlFunc::Month, name, args),
            "day" => self.unary_func(SqlFunc::Day, name, args),
            "hour" => self.unary_func(SqlFunc::Hour, name, args),
            "minute" => self.unary_func(SqlFunc::Minute, name, args),
            "second" => self.unary_func(SqlFunc::Second, name, args),
            "date" => self.unary_func(SqlFunc::ExtractDate, name, args),
            "time" => self.unary_func(SqlFunc::ExtractTime, name, args),
            "now" => Ok(SqlExpr::Func {
                func: SqlFunc::Now,
                args: vec![],
            }),
            "mindatetime" => Ok(SqlExpr::Literal(Value::String(
                "0001-01-01T00:00:00Z".into(),
            ))),
            "maxdatetime" => Ok(SqlExpr::Literal(Value::String(
                "9999-12-31T23:59:59Z".into(),
            ))),
            "totalseconds" => {
                // Durations are stored in whole microseconds.
                let compiled = self.exact_args(name, args, 1)?;
                Ok(SqlExpr::bin(
                    SqlBinOp::Div,
                    compiled.into_iter().next().unwrap(),
                    SqlExpr::Literal(Value::Int(1_000_000)),
                ))
            }
            "totaloffsetminutes" | "fractionalseconds" => Err(Error::not_implemented(format!(
                "{name}() is not supported by the store dialect"
            ))),
            "round" => self.unary_func(SqlFunc::Round, name, args),
            "ceiling" => self.unary_func(SqlFunc::Ceiling, name, args),
            "floor" => self.unary_func(SqlFunc::Floor, name, args),
            other => Err(Error::validation(format!("unknown function {other}"))),
        }
    }

    /// contains/startswith/endswith with a literal pattern become LIKE;
    /// non-literal patterns fall back to INSTR comparisons.
    fn compile_match(&mut self, name: &str, args: &[Expr]) -> Result<SqlExpr> {
        if args.len() != 2 {
            return Err(Error::validation(format!(
                "{name} expects 2 arguments, got {}",
                args.len()
            )));
        }
        let target = self.compile(&args[0])?;
        if let Expr::Literal {
            value: Value::String(s),
            ..
        } = &args[1]
        {
            let escaped = like_escape(s, self.escape_char);
            let pattern = match name {
                "contains" => format!("%{escaped}%"),
                "startswith" => format!("{escaped}%"),
                _ => format!("%{escaped}"),
            };
            return Ok(SqlExpr::Like {
                expr: Box::new(target),
                pattern,
            });
        }
        let needle = self.compile(&args[1])?;
        let position = SqlExpr::Func {
            func: SqlFunc::IndexOf,
            args: vec![target, needle],
        };
        Ok(SqlExpr::bin(
            SqlBinOp::Gt,
            position,
            SqlExpr::Literal(Value::Int(0)),
        ))
    }

    fn unary_func(&mut self, func: SqlFunc, name: &str, args: &[Expr]) -> Result<SqlExpr> {
        let compiled = self.exact_args(name, args, 1)?;
        Ok(SqlExpr::Func {
            func,
            args: compiled,
        })
    }

    fn exact_args(&mut self, name: &str, args: &[Expr], n: usize) -> Result<Vec<SqlExpr>> {
        if args.len() != n {
            return Err(Error::validation(format!(
                "{name} expects {n} argument(s), got {}",
                args.len()
            )));
        }
        args.iter().map(|a| self.compile(a)).collect()
    }

    /// Light static type check for comparisons between a property and a
    /// literal.
    fn check_comparable(&mut self, left: &Expr, right: &Expr) -> Result<()> {
        let (path, lit_value, lit_ty) = match (left, right) {
            (Expr::Property(p), Expr::Literal { value, ty }) => (p, value, ty),
            (Expr::Literal { value, ty }, Expr::Property(p)) => (p, value, ty),
            _ => return Ok(()),
        };
        if lit_value.is_null() {
            return Ok(());
        }
        // Resolving twice is cheap; the join cache absorbs repeated paths.
        let Ok((_, Some(prop_ty))) = self.resolve_path(path) else {
            return Ok(());
        };
        let compatible = match &prop_ty {
            t if t.is_numeric() => lit_ty.is_numeric(),
            EdmType::String | EdmType::Enum(_) => {
                matches!(lit_ty, EdmType::String)
            }
            EdmType::Boolean => matches!(lit_ty, EdmType::Boolean),
            EdmType::Guid => matches!(lit_ty, EdmType::Guid | EdmType::String),
            EdmType::Date => matches!(lit_ty, EdmType::Date | EdmType::String),
            EdmType::TimeOfDay => matches!(lit_ty, EdmType::TimeOfDay | EdmType::String),
            EdmType::DateTimeOffset => {
                matches!(lit_ty, EdmType::DateTimeOffset | EdmType::String)
            }
            EdmType::Duration => matches!(lit_ty, EdmType::Duration),
            _ => true,
        };
        if !compatible {
            return Err(Error::validation(format!(
                "cannot compare {} value with {} literal",
                prop_ty.name(),
                lit_ty.name()
            )));
        }
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;
    use crate::parser::parse_expression;

    fn model() -> EntityModel {
        let mut model = EntityModel::new("Shop", "Container");
        model
            .register(
                EntityMetadata::new("Products", "Product", "products")
                    .property(PropertyMetadata::new("ID", EdmType::Int32).key().computed())
                    .property(PropertyMetadata::new("Name", EdmType::String).required())
                    .property(PropertyMetadata::new("Price", EdmType::Double))
                    .property(PropertyMetadata::new("CategoryID", EdmType::Int32))
                    .navigation(
                        NavigationMetadata::single("Category", "Categories")
                            .foreign_key("CategoryID", "ID"),
                    )
                    .navigation(
                        NavigationMetadata::collection("Descriptions", "ProductDescriptions")
                            .foreign_key("ID", "ProductID"),
                    ),
            )
            .unwrap();
        model
            .register(
                EntityMetadata::new("Categories", "Category", "categories")
                    .property(PropertyMetadata::new("ID", EdmType::Int32).key())
                    .property(PropertyMetadata::new("Title", EdmType::String)),
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
                .property(PropertyMetadata::new("LanguageKey", EdmType::String))
                .property(PropertyMetadata::new("Text", EdmType::String)),
            )
            .unwrap();
        model.seal().unwrap();
        model
    }

    fn compile_filter(model: &EntityModel, input: &str) -> Result<(SqlExpr, Vec<Join>)> {
        let meta = model.set("Products").unwrap();
        let options = QueryOptions::default();
        let mut ctx = PredicateCtx::new(model, meta, &options, None, '\\');
        let expr = parse_expression(input)?;
        let compiled = ctx.compile(&expr)?;
        Ok((compiled, ctx.joins))
    }

    #[test]
    fn unknown_property_is_a_400() {
        let model = model();
        let err = compile_filter(&model, "Missing eq 1").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn navigation_path_adds_one_join_per_path() {
        let model = model();
        let (_, joins) =
            compile_filter(&model, "Category/Title eq 'Office' and Category/ID gt 1").unwrap();
        assert_eq!(joins.len(), 1, "alias cache must dedupe the join");
        assert_eq!(joins[0].alias, "nav1");
    }

    #[test]
    fn null_comparison_becomes_is_null() {
        let model = model();
        let (expr, _) = compile_filter(&model, "Name eq null").unwrap();
        assert!(matches!(expr, SqlExpr::IsNull { negated: false, .. }));
        let (expr, _) = compile_filter(&model, "Name ne null").unwrap();
        assert!(matches!(expr, SqlExpr::IsNull { negated: true, .. }));
    }

    #[test]
    fn contains_becomes_escaped_like() {
        let model = model();
        let (expr, _) = compile_filter(&model, "contains(Name, '50%_off')").unwrap();
        let SqlExpr::Like { pattern, .. } = expr else {
            panic!("expected LIKE, got {expr:?}");
        };
        assert_eq!(pattern, "%50\\%\\_off%");
    }

    #[test]
    fn lambda_compiles_to_correlated_exists() {
        let model = model();
        let (expr, _) =
            compile_filter(&model, "Descriptions/any(d: d/LanguageKey eq 'EN')").unwrap();
        let SqlExpr::Exists { plan, negated } = expr else {
            panic!("expected EXISTS, got {expr:?}");
        };
        assert!(!negated);
        assert_eq!(plan.table, "product_descriptions");
        // Correlation + predicate both present.
        assert!(plan.predicate.is_some());
    }

    #[test]
    fn all_is_not_exists_of_negation() {
        let model = model();
        let (expr, _) =
            compile_filter(&model, "Descriptions/all(d: d/LanguageKey eq 'EN')").unwrap();
        assert!(matches!(expr, SqlExpr::Exists { negated: true, .. }));
    }

    #[test]
    fn type_mismatch_is_a_400() {
        let model = model();
        assert!(compile_filter(&model, "Price gt 'abc'").is_err());
        assert!(compile_filter(&model, "Price gt 10").is_ok());
    }

    #[test]
    fn isof_without_discriminator_is_false() {
        let model = model();
        let (expr, _) = compile_filter(&model, "isof(Shop.Premium)").unwrap();
        assert_eq!(expr, SqlExpr::Bool(false));
    }

    #[test]
    fn geo_without_backend_is_501() {
        let model = model();
        let err = compile_filter(&model, "geo.distance(Name, Name) lt 10").unwrap_err();
        assert_eq!(err.status().as_u16(), 501);
    }

    #[test]
    fn undefined_alias_is_rejected() {
        let model = model();
        assert!(compile_filter(&model, "Price gt @missing").is_err());
    }
}
