use crate::ast::{Aggregate, AggregateOp, ApplyStep, ComputeItem};
use crate::error::{Error, Result};
use crate::parser::filter::parse_expression;
use crate::parser::options::split_top_level;

/// Parse a `$apply` pipeline: `/`-separated transformations, each of
/// `filter(...)`, `groupby((k1,k2)[,aggregate(...)])`, `aggregate(...)`,
/// `compute(...)`. Order is preserved.
pub fn parse_apply(value: &str) -> Result<Vec<ApplyStep>> {
    let mut steps = Vec::new();
    for raw in split_top_level(value, '/') {
        let step = raw.trim();
        let (name, body) = split_transform(step)?;
        match name {
            "filter" => steps.push(ApplyStep::Filter(parse_expression(body)?)),
            "groupby" => steps.push(parse_groupby(body)?),
            "aggregate" => steps.push(ApplyStep::Aggregate(parse_aggregate_list(body)?)),
            "compute" => steps.push(ApplyStep::Compute(parse_compute_list(body)?)),
            other => {
                return Err(Error::validation(format!(
                    "unsupported $apply transformation: {other}"
                )));
            }
        }
    }
    if steps.is_empty() {
        return Err(Error::validation("$apply must contain a transformation"));
    }
    Ok(steps)
}

fn split_transform(step: &str) -> Result<(&str, &str)> {
    let open = step
        .find('(')
        .ok_or_else(|| Error::validation(format!("malformed $apply step: {step}")))?;
    if !step.ends_with(')') {
        return Err(Error::validation(format!(
            "unbalanced parentheses in $apply step: {step}"
        )));
    }
    Ok((step[..open].trim(), &step[open + 1..step.len() - 1]))
}

/// `groupby((K1,K2), aggregate(...))`.
fn parse_groupby(body: &str) -> Result<ApplyStep> {
    let parts = split_top_level(body, ',');
    let keys_part = parts
        .first()
        .map(|s| s.trim())
        .ok_or_else(|| Error::validation("groupby requires a key list"))?;
    let keys_inner = keys_part
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| {
            Error::validation(format!("groupby keys must be parenthesized: {keys_part}"))
        })?;
    let keys: Vec<Vec<String>> = split_top_level(keys_inner, ',')
        .iter()
        .map(|k| k.trim().split('/').map(str::to_string).collect())
        .collect();
    if keys.is_empty() || keys.iter().any(|k| k.iter().any(String::is_empty)) {
        return Err(Error::validation("groupby requires at least one key"));
    }
    let mut aggregates = Vec::new();
    for extra in &parts[1..] {
        let (name, inner) = split_transform(extra.trim())?;
        if name != "aggregate" {
            return Err(Error::validation(format!(
                "groupby only nests aggregate, got {name}"
            )));
        }
        aggregates.extend(parse_aggregate_list(inner)?);
    }
    Ok(ApplyStep::GroupBy { keys, aggregates })
}

/// `aggregate(Price with sum as Total, $count as Cnt)`.
fn parse_aggregate_list(body: &str) -> Result<Vec<Aggregate>> {
    let mut items = Vec::new();
    for raw in split_top_level(body, ',') {
        let item = raw.trim();
        let (lhs, alias) = item.rsplit_once(" as ").ok_or_else(|| {
            Error::validation(format!("aggregate item must end in `as Alias`: {item}"))
        })?;
        let alias = alias.trim().to_string();
        let lhs = lhs.trim();
        if lhs == "$count" {
            items.push(Aggregate {
                expr: None,
                op: AggregateOp::Count,
                alias,
            });
            continue;
        }
        let (expr_text, op_word) = lhs.rsplit_once(" with ").ok_or_else(|| {
            Error::validation(format!("aggregate item must use `expr with op`: {item}"))
        })?;
        let op = AggregateOp::parse(op_word.trim()).ok_or_else(|| {
            Error::validation(format!("unknown aggregation method: {}", op_word.trim()))
        })?;
        items.push(Aggregate {
            expr: Some(parse_expression(expr_text.trim())?),
            op,
            alias,
        });
    }
    if items.is_empty() {
        return Err(Error::validation("aggregate requires at least one item"));
    }
    Ok(items)
}

fn parse_compute_list(body: &str) -> Result<Vec<ComputeItem>> {
    let mut items = Vec::new();
    for raw in split_top_level(body, ',') {
        let item = raw.trim();
        let (expr_text, alias) = item.rsplit_once(" as ").ok_or_else(|| {
            Error::validation(format!("compute item must be `expr as Alias`: {item}"))
        })?;
        items.push(ComputeItem {
            expr: parse_expression(expr_text.trim())?,
            alias: alias.trim().to_string(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_order_is_preserved() {
        let steps = parse_apply(
            "filter(Price gt 100)/groupby((Category),aggregate(Price with sum as Total))",
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], ApplyStep::Filter(_)));
        let ApplyStep::GroupBy { keys, aggregates } = &steps[1] else {
            panic!("expected groupby");
        };
        assert_eq!(keys, &vec![vec!["Category".to_string()]]);
        assert_eq!(aggregates[0].alias, "Total");
        assert_eq!(aggregates[0].op, AggregateOp::Sum);
    }

    #[test]
    fn count_aggregate() {
        let steps = parse_apply("aggregate($count as Cnt)").unwrap();
        let ApplyStep::Aggregate(items) = &steps[0] else {
            panic!();
        };
        assert_eq!(items[0].op, AggregateOp::Count);
        assert!(items[0].expr.is_none());
    }

    #[test]
    fn compute_step() {
        let steps = parse_apply("compute(Price mul 2 as Doubled)").unwrap();
        let ApplyStep::Compute(items) = &steps[0] else {
            panic!();
        };
        assert_eq!(items[0].alias, "Doubled");
    }

    #[test]
    fn malformed_steps_are_rejected() {
        assert!(parse_apply("explode(Price)").is_err());
        assert!(parse_apply("groupby(Category)").is_err());
        assert!(parse_apply("aggregate(Price with tally as X)").is_err());
        assert!(parse_apply("").is_err());
    }
}
