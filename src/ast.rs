use std::collections::HashMap;

use crate::value::{EdmType, Value};

/// A parsed `$filter`/`$compute`/`$apply` expression tree. Language-neutral:
/// nothing here references metadata or SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal { value: Value, ty: EdmType },
    /// Slash-separated property path, possibly through single navigations.
    Property(Vec<String>),
    /// `@name` parameter alias, resolved at evaluation time.
    Alias(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `Nav/any(d: d/X eq 1)`; predicate absent for bare `any()`.
    Lambda {
        op: LambdaOp,
        range_var: String,
        target: Vec<String>,
        predicate: Option<Box<Expr>>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
    },
    Cast {
        expr: Option<Box<Expr>>,
        ty: String,
    },
    IsOf {
        expr: Option<Box<Expr>>,
        ty: String,
    },
}

impl Expr {
    pub fn literal(value: Value, ty: EdmType) -> Expr {
        Expr::Literal { value, ty }
    }

    /// Conjoin two optional filters (used when policies add scopes).
    pub fn conjoin(a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(a),
                right: Box::new(b),
            }),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Has,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaOp {
    Any,
    All,
}

/// One `$orderby` item.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub path: Vec<String>,
    pub descending: bool,
}

/// One `$select` item.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*` — all non-navigation structural properties.
    Wildcard,
    Path(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandLevels {
    Depth(u32),
    Max,
}

/// One `$expand` item with its nested options.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandNode {
    pub path: Vec<String>,
    pub options: Box<QueryOptions>,
    pub levels: Option<ExpandLevels>,
}

/// `$search` expression over a backend-pluggable matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchExpr {
    Term(String),
    And(Box<SearchExpr>, Box<SearchExpr>),
    Or(Box<SearchExpr>, Box<SearchExpr>),
    Not(Box<SearchExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Min,
    Max,
    Average,
    CountDistinct,
    /// `$count as Alias` — counts rows, no source expression.
    Count,
}

impl AggregateOp {
    pub fn parse(word: &str) -> Option<AggregateOp> {
        match word {
            "sum" => Some(AggregateOp::Sum),
            "min" => Some(AggregateOp::Min),
            "max" => Some(AggregateOp::Max),
            "average" => Some(AggregateOp::Average),
            "countdistinct" => Some(AggregateOp::CountDistinct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub expr: Option<Expr>,
    pub op: AggregateOp,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeItem {
    pub expr: Expr,
    pub alias: String,
}

/// One step of the `$apply` pipeline, order-preserving.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyStep {
    Filter(Expr),
    GroupBy {
        keys: Vec<Vec<String>>,
        aggregates: Vec<Aggregate>,
    },
    Aggregate(Vec<Aggregate>),
    Compute(Vec<ComputeItem>),
}

/// The parsed, immutable query-option record for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub filter: Option<Expr>,
    pub select: Vec<SelectItem>,
    pub expand: Vec<ExpandNode>,
    pub order_by: Vec<OrderByItem>,
    pub top: Option<u64>,
    pub skip: Option<u64>,
    pub count: Option<bool>,
    pub search: Option<SearchExpr>,
    pub apply: Vec<ApplyStep>,
    pub compute: Vec<ComputeItem>,
    pub skip_token: Option<String>,
    pub delta_token: Option<String>,
    pub format: Option<String>,
    /// `@name` → literal expression; unused aliases are allowed.
    pub aliases: HashMap<String, Expr>,
}

impl QueryOptions {
    pub fn is_empty(&self) -> bool {
        self == &QueryOptions::default()
    }

    /// Look up a `$compute` (or `$apply compute`) alias by name.
    pub fn compute_alias(&self, name: &str) -> Option<&ComputeItem> {
        self.compute
            .iter()
            .chain(self.apply.iter().flat_map(|step| match step {
                ApplyStep::Compute(items) => items.as_slice(),
                _ => &[],
            }))
            .find(|c| c.alias == name)
    }
}
