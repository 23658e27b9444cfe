use crate::ast::{Aggregate, AggregateOp, ApplyStep};
use crate::compiler::predicate::PredicateCtx;
use crate::error::{Error, Result};
use crate::plan::{SelectColumn, SelectPlan, SqlExpr, SqlFunc};
use crate::value::Value;

/// Fold the `$apply` pipeline into the plan. Returns true when the pipeline
/// aggregates (the result shape is no longer the entity shape).
pub(crate) fn compile_apply(
    ctx: &mut PredicateCtx<'_>,
    steps: &[ApplyStep],
    plan: &mut SelectPlan,
) -> Result<bool> {
    let mut aggregated = false;
    for step in steps {
        match step {
            ApplyStep::Filter(expr) => {
                if aggregated {
                    return Err(Error::validation(
                        "filter after aggregation in $apply is not supported",
                    ));
                }
                let compiled = ctx.compile(expr)?;
                plan.predicate = Some(SqlExpr::merge(plan.predicate.take(), compiled));
            }
            ApplyStep::Compute(items) => {
                for item in items {
                    let expr = ctx.compile(&item.expr)?;
                    plan.columns.push(SelectColumn {
                        expr,
                        alias: item.alias.clone(),
                    });
                }
            }
            ApplyStep::GroupBy { keys, aggregates } => {
                if aggregated {
                    return Err(Error::validation(
                        "groupby after aggregation in $apply is not supported",
                    ));
                }
                let mut columns = Vec::new();
                let mut group_by = Vec::new();
                for key in keys {
                    let (expr, _) = ctx.resolve_path(key)?;
                    group_by.push(expr.clone());
                    columns.push(SelectColumn {
                        expr,
                        alias: key.last().cloned().unwrap_or_default(),
                    });
                }
                for agg in aggregates {
                    columns.push(aggregate_column(ctx, agg)?);
                }
                plan.group_by = group_by;
                plan.columns = columns;
                aggregated = true;
            }
            ApplyStep::Aggregate(items) => {
                if aggregated {
                    return Err(Error::validation(
                        "repeated aggregation in $apply is not supported",
                    ));
                }
                plan.columns = items
                    .iter()
                    .map(|agg| aggregate_column(ctx, agg))
                    .collect::<Result<Vec<_>>>()?;
                aggregated = true;
            }
        }
    }
    Ok(aggregated)
}

fn aggregate_column(ctx: &mut PredicateCtx<'_>, agg: &Aggregate) -> Result<SelectColumn> {
    let (func, args) = match agg.op {
        AggregateOp::Count => (SqlFunc::AggCount, vec![SqlExpr::Literal(Value::Int(1))]),
        op => {
            let source = agg.expr.as_ref().ok_or_else(|| {
                Error::validation(format!("aggregate {} requires an expression", agg.alias))
            })?;
            let compiled = ctx.compile(source)?;
            let func = match op {
                AggregateOp::Sum => SqlFunc::AggSum,
                AggregateOp::Min => SqlFunc::AggMin,
                AggregateOp::Max => SqlFunc::AggMax,
                AggregateOp::Average => SqlFunc::AggAvg,
                AggregateOp::CountDistinct => SqlFunc::AggCountDistinct,
                AggregateOp::Count => unreachable!(),
            };
            (func, vec![compiled])
        }
    };
    Ok(SelectColumn {
        expr: SqlExpr::Func { func, args },
        alias: agg.alias.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::QueryOptions;
    use crate::metadata::{EntityMetadata, EntityModel, PropertyMetadata};
    use crate::parser::apply::parse_apply;
    use crate::value::EdmType;

    fn model() -> EntityModel {
        let mut model = EntityModel::new("Shop", "Container");
        model
            .register(
                EntityMetadata::new("Products", "Product", "products")
                    .property(PropertyMetadata::new("ID", EdmType::Int32).key())
                    .property(PropertyMetadata::new("Category", EdmType::String))
                    .property(PropertyMetadata::new("Price", EdmType::Double)),
            )
            .unwrap();
        model.seal().unwrap();
        model
    }

    #[test]
    fn groupby_with_aggregate_shapes_the_plan() {
        let model = model();
        let meta = model.set("Products").unwrap();
        let options = QueryOptions::default();
        let mut ctx = PredicateCtx::new(&model, meta, &options, None, '\\');
        let steps = parse_apply(
            "filter(Price gt 10)/groupby((Category),aggregate(Price with sum as Total,$count as Cnt))",
        )
        .unwrap();
        let mut plan = SelectPlan {
            table: "products".into(),
            ..Default::default()
        };
        let aggregated = compile_apply(&mut ctx, &steps, &mut plan).unwrap();
        assert!(aggregated);
        assert!(plan.predicate.is_some());
        assert_eq!(plan.group_by.len(), 1);
        assert_eq!(plan.columns.len(), 3);
        assert_eq!(plan.columns[1].alias, "Total");
        assert_eq!(plan.columns[2].alias, "Cnt");
    }

    #[test]
    fn filter_after_aggregate_is_rejected() {
        let model = model();
        let meta = model.set("Products").unwrap();
        let options = QueryOptions::default();
        let mut ctx = PredicateCtx::new(&model, meta, &options, None, '\\');
        let steps = parse_apply("aggregate($count as N)/filter(Price gt 1)").unwrap();
        let mut plan = SelectPlan::default();
        assert!(compile_apply(&mut ctx, &steps, &mut plan).is_err());
    }
}
