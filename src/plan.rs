use crate::value::Value;

/// A compiled predicate/projection expression. Structured rather than
/// stringly: SQL stores render it with `render_sql`, test stores evaluate
/// it directly.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        qualifier: Option<String>,
        name: String,
    },
    Literal(Value),
    /// TRUE/FALSE constant (e.g. a typecast with no discriminator).
    Bool(bool),
    Bin {
        op: SqlBinOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    Neg(Box<SqlExpr>),
    Func {
        func: SqlFunc,
        args: Vec<SqlExpr>,
    },
    /// LIKE with an escaped pattern; escape char comes from the dialect.
    Like {
        expr: Box<SqlExpr>,
        pattern: String,
    },
    In {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
    },
    /// Row-value membership for composite keys: (a,b) IN ((1,2),(3,4)).
    TupleIn {
        exprs: Vec<SqlExpr>,
        rows: Vec<Vec<Value>>,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    /// Correlated EXISTS used by any/all lambdas.
    Exists {
        plan: Box<SelectPlan>,
        negated: bool,
    },
}

impl SqlExpr {
    pub fn column(name: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            qualifier: None,
            name: name.into(),
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }

    pub fn bin(op: SqlBinOp, left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Bin {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::bin(SqlBinOp::And, left, right)
    }

    pub fn eq(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::bin(SqlBinOp::Eq, left, right)
    }

    /// Conjoin an optional predicate with another.
    pub fn merge(existing: Option<SqlExpr>, extra: SqlExpr) -> SqlExpr {
        match existing {
            Some(e) => SqlExpr::and(e, extra),
            None => extra,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
}

impl SqlBinOp {
    fn sql(self) -> &'static str {
        match self {
            SqlBinOp::And => "AND",
            SqlBinOp::Or => "OR",
            SqlBinOp::Eq => "=",
            SqlBinOp::Ne => "<>",
            SqlBinOp::Gt => ">",
            SqlBinOp::Ge => ">=",
            SqlBinOp::Lt => "<",
            SqlBinOp::Le => "<=",
            SqlBinOp::Add => "+",
            SqlBinOp::Sub => "-",
            SqlBinOp::Mul => "*",
            SqlBinOp::Div => "/",
            SqlBinOp::Mod => "%",
            SqlBinOp::BitAnd => "&",
        }
    }
}

/// Scalar functions the compiler can emit. The dialect maps each to its
/// concrete SQL name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlFunc {
    Lower,
    Upper,
    Length,
    IndexOf,
    Substring,
    Trim,
    Concat,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    ExtractDate,
    ExtractTime,
    Now,
    Round,
    Ceiling,
    Floor,
    Matches,
    // Aggregates (rendered only inside projections).
    AggSum,
    AggMin,
    AggMax,
    AggAvg,
    AggCount,
    AggCountDistinct,
}

/// One projected column.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: SqlExpr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub expr: SqlExpr,
    pub descending: bool,
}

/// The relational half of a compiled query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectPlan {
    pub table: String,
    pub columns: Vec<SelectColumn>,
    pub joins: Vec<Join>,
    pub predicate: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub order: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// SQL dialect descriptor supplied by the store (spec'd capability; the
/// driver itself lives outside this crate).
#[derive(Debug, Clone)]
pub struct Dialect {
    pub identifier_quote: char,
    /// Escape character for LIKE patterns.
    pub escape_char: char,
    pub now: &'static str,
    pub extract_date: &'static str,
    pub extract_time: &'static str,
    pub ceiling: &'static str,
    pub floor: &'static str,
    /// Regex-match function; None means matchesPattern is unsupported.
    pub regex_match: Option<&'static str>,
    pub supports_native_pagination: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect {
            identifier_quote: '"',
            escape_char: '\\',
            now: "CURRENT_TIMESTAMP",
            extract_date: "DATE",
            extract_time: "TIME",
            ceiling: "CEILING",
            floor: "FLOOR",
            regex_match: None,
            supports_native_pagination: true,
        }
    }
}

impl Dialect {
    pub fn quote_ident(&self, name: &str) -> String {
        let q = self.identifier_quote;
        let doubled = name.replace(q, &format!("{q}{q}"));
        format!("{q}{doubled}{q}")
    }

    fn function_name(&self, func: SqlFunc) -> &'static str {
        match func {
            SqlFunc::Lower => "LOWER",
            SqlFunc::Upper => "UPPER",
            SqlFunc::Length => "LENGTH",
            SqlFunc::IndexOf => "INSTR",
            SqlFunc::Substring => "SUBSTR",
            SqlFunc::Trim => "TRIM",
            SqlFunc::Concat => "CONCAT",
            SqlFunc::Year => "YEAR",
            SqlFunc::Month => "MONTH",
            SqlFunc::Day => "DAY",
            SqlFunc::Hour => "HOUR",
            SqlFunc::Minute => "MINUTE",
            SqlFunc::Second => "SECOND",
            SqlFunc::ExtractDate => self.extract_date,
            SqlFunc::ExtractTime => self.extract_time,
            SqlFunc::Now => self.now,
            SqlFunc::Round => "ROUND",
            SqlFunc::Ceiling => self.ceiling,
            SqlFunc::Floor => self.floor,
            SqlFunc::Matches => self.regex_match.unwrap_or("REGEXP"),
            SqlFunc::AggSum => "SUM",
            SqlFunc::AggMin => "MIN",
            SqlFunc::AggMax => "MAX",
            SqlFunc::AggAvg => "AVG",
            SqlFunc::AggCount | SqlFunc::AggCountDistinct => "COUNT",
        }
    }
}

/// Escape `%`, `_` and the dialect escape character in a LIKE fragment.
pub fn like_escape(s: &str, escape: char) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '%' || ch == '_' || ch == escape {
            out.push(escape);
        }
        out.push(ch);
    }
    out
}

/// Render a plan as parameterized SQL (`?` placeholders, values in order).
pub fn render_sql(plan: &SelectPlan, dialect: &Dialect) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let sql = render_select(plan, dialect, &mut params);
    (sql, params)
}

fn render_select(plan: &SelectPlan, d: &Dialect, params: &mut Vec<Value>) -> String {
    let mut sql = String::from("SELECT ");
    if plan.columns.is_empty() {
        sql.push('*');
    } else {
        let cols: Vec<String> = plan
            .columns
            .iter()
            .map(|c| {
                let rendered = render_expr(&c.expr, d, params);
                if matches!(&c.expr, SqlExpr::Column { name, .. } if *name == c.alias) {
                    rendered
                } else {
                    format!("{rendered} AS {}", d.quote_ident(&c.alias))
                }
            })
            .collect();
        sql.push_str(&cols.join(", "));
    }
    sql.push_str(" FROM ");
    sql.push_str(&d.quote_ident(&plan.table));
    for join in &plan.joins {
        sql.push_str(" LEFT JOIN ");
        sql.push_str(&d.quote_ident(&join.table));
        sql.push_str(" AS ");
        sql.push_str(&d.quote_ident(&join.alias));
        sql.push_str(" ON ");
        sql.push_str(&render_expr(&join.on, d, params));
    }
    if let Some(pred) = &plan.predicate {
        sql.push_str(" WHERE ");
        sql.push_str(&render_expr(pred, d, params));
    }
    if !plan.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        let keys: Vec<String> = plan
            .group_by
            .iter()
            .map(|k| render_expr(k, d, params))
            .collect();
        sql.push_str(&keys.join(", "));
    }
    if !plan.order.is_empty() {
        sql.push_str(" ORDER BY ");
        let specs: Vec<String> = plan
            .order
            .iter()
            .map(|o| {
                format!(
                    "{}{}",
                    render_expr(&o.expr, d, params),
                    if o.descending { " DESC" } else { "" }
                )
            })
            .collect();
        sql.push_str(&specs.join(", "));
    }
    if let Some(limit) = plan.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = plan.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    sql
}

fn render_expr(expr: &SqlExpr, d: &Dialect, params: &mut Vec<Value>) -> String {
    match expr {
        SqlExpr::Column { qualifier, name } => match qualifier {
            Some(q) => format!("{}.{}", d.quote_ident(q), d.quote_ident(name)),
            None => d.quote_ident(name),
        },
        SqlExpr::Literal(v) => {
            params.push(v.clone());
            "?".to_string()
        }
        SqlExpr::Bool(b) => if *b { "1=1" } else { "1=0" }.to_string(),
        SqlExpr::Bin { op, left, right } => format!(
            "({} {} {})",
            render_expr(left, d, params),
            op.sql(),
            render_expr(right, d, params)
        ),
        SqlExpr::Not(inner) => format!("NOT ({})", render_expr(inner, d, params)),
        SqlExpr::Neg(inner) => format!("-({})", render_expr(inner, d, params)),
        SqlExpr::Func { func, args } => {
            if *func == SqlFunc::Now {
                return d.now.to_string();
            }
            let rendered: Vec<String> =
                args.iter().map(|a| render_expr(a, d, params)).collect();
            if *func == SqlFunc::AggCountDistinct {
                return format!("COUNT(DISTINCT {})", rendered.join(", "));
            }
            format!("{}({})", d.function_name(*func), rendered.join(", "))
        }
        SqlExpr::Like { expr, pattern } => {
            params.push(Value::String(pattern.clone()));
            format!(
                "{} LIKE ? ESCAPE '{}'",
                render_expr(expr, d, params),
                d.escape_char
            )
        }
        SqlExpr::In { expr, list } => {
            if list.is_empty() {
                return "1=0".to_string();
            }
            let rendered: Vec<String> =
                list.iter().map(|v| render_expr(v, d, params)).collect();
            format!(
                "{} IN ({})",
                render_expr(expr, d, params),
                rendered.join(", ")
            )
        }
        SqlExpr::TupleIn { exprs, rows } => {
            if rows.is_empty() {
                return "1=0".to_string();
            }
            // Expanded to an OR chain for dialect portability.
            let groups: Vec<String> = rows
                .iter()
                .map(|row| {
                    let pairs: Vec<String> = exprs
                        .iter()
                        .zip(row)
                        .map(|(e, v)| {
                            let lhs = render_expr(e, d, params);
                            params.push(v.clone());
                            format!("{lhs} = ?")
                        })
                        .collect();
                    format!("({})", pairs.join(" AND "))
                })
                .collect();
            format!("({})", groups.join(" OR "))
        }
        SqlExpr::IsNull { expr, negated } => format!(
            "{} IS {}NULL",
            render_expr(expr, d, params),
            if *negated { "NOT " } else { "" }
        ),
        SqlExpr::Exists { plan, negated } => {
            let inner = render_select(plan, d, params);
            format!("{}EXISTS ({inner})", if *negated { "NOT " } else { "" })
        }
    }
}
