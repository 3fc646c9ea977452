//! Heuristic plan optimizer
//!
//! Two rewrites, applied in order:
//!
//! 1. Predicate pushdown: equality conjuncts on leading key columns, plus at
//!    most one range on the next key column, narrow the Scan's key range. The
//!    Filter keeps the full predicate, so the result never changes.
//! 2. Projection pruning: the Scan materializes only the columns its consumers
//!    reference, and their column indices are rebound accordingly.

use tracing::trace;

use super::expr::{literal_text, PhysicalExpr};
use super::plan::{KeyRange, Plan, PlanNode, ScanNode};
use crate::catalog::DatasetDef;
use crate::dsl::BinaryOperator;
use crate::error::{Error, Result};
use crate::storage::key::{self, KeyEncoder};
use crate::storage::Value;

/// Heuristic-based plan optimizer
pub struct HeuristicOptimizer<'a> {
    def: &'a DatasetDef,
}

impl<'a> HeuristicOptimizer<'a> {
    pub fn new(def: &'a DatasetDef) -> Self {
        Self { def }
    }

    /// Optimize a plan
    pub fn optimize(&self, mut plan: Plan) -> Result<Plan> {
        self.push_down(&mut plan.root);
        prune(&mut plan.root)?;
        Ok(plan)
    }

    /// Narrow the scan below a Filter
    fn push_down(&self, node: &mut PlanNode) {
        match node {
            PlanNode::Filter { input, predicate } => {
                if let PlanNode::Scan(scan) = input.as_mut() {
                    if let Some(range) = self.key_range(predicate) {
                        trace!(dataset = %scan.dataset, conditions = ?range.conditions, "pushed down key range");
                        scan.range = range;
                    }
                } else {
                    self.push_down(input);
                }
            }
            PlanNode::Scan(_) => {}
            PlanNode::Project { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => self.push_down(input),
        }
    }

    /// Key range implied by a predicate; None when nothing can be pushed
    pub fn key_range(&self, predicate: &PhysicalExpr) -> Option<KeyRange> {
        let conjuncts: Vec<KeyCondition> = predicate
            .conjuncts()
            .into_iter()
            .filter_map(KeyCondition::from_expr)
            .collect();
        if conjuncts.is_empty() {
            return None;
        }

        let generation = self.def.generation;
        let mut encoder = KeyEncoder::new(generation);
        let mut conditions = Vec::new();
        let mut lower: Option<Vec<u8>> = None;
        let mut upper: Option<Vec<u8>> = None;

        for position in self.def.key_positions() {
            let column = &self.def.schema.columns()[position];
            let usable = |c: &&KeyCondition| {
                c.position == position && c.value.column_type() == Some(column.column_type)
            };

            if let Some(eq) = conjuncts
                .iter()
                .filter(usable)
                .find(|c| c.op == BinaryOperator::Eq)
            {
                encoder.push(&eq.value);
                conditions.push(format!("{} = {}", column.name, literal_text(&eq.value)));
                continue;
            }

            // one range on the first key column without an equality
            let prefix = encoder.prefix().to_vec();
            for cond in conjuncts.iter().filter(usable) {
                let mut bound = prefix.clone();
                key::encode_value(&mut bound, &cond.value);
                match cond.op {
                    BinaryOperator::Gte if lower.is_none() => lower = Some(bound),
                    BinaryOperator::Gt if lower.is_none() => {
                        lower = key::prefix_successor(&bound);
                        if lower.is_none() {
                            continue;
                        }
                    }
                    BinaryOperator::Lt if upper.is_none() => upper = Some(bound),
                    BinaryOperator::Lte if upper.is_none() => {
                        upper = key::prefix_successor(&bound);
                        if upper.is_none() {
                            continue;
                        }
                    }
                    _ => continue,
                }
                conditions.push(format!("{} {} {}", column.name, cond.op, literal_text(&cond.value)));
            }
            break;
        }

        if conditions.is_empty() {
            return None;
        }

        let prefix = encoder.into_prefix();
        let rows_end = key::rows_end(generation);
        let lower = lower.unwrap_or_else(|| prefix.clone());
        let upper = upper
            .or_else(|| key::prefix_successor(&prefix))
            .map_or(rows_end.clone(), |u| u.min(rows_end));
        Some(KeyRange {
            lower,
            upper,
            conditions,
        })
    }
}

/// `column op literal` over a schema position, with the literal on the right
struct KeyCondition {
    position: usize,
    op: BinaryOperator,
    value: Value,
}

impl KeyCondition {
    fn from_expr(expr: &PhysicalExpr) -> Option<Self> {
        let PhysicalExpr::Binary {
            left, op, right, ..
        } = expr
        else {
            return None;
        };
        if !op.is_comparison() || *op == BinaryOperator::Neq {
            return None;
        }
        let (position, op, value) = match (left.as_ref(), right.as_ref()) {
            (PhysicalExpr::Column { index, .. }, PhysicalExpr::Literal { value, .. }) => {
                (*index, *op, value)
            }
            (PhysicalExpr::Literal { value, .. }, PhysicalExpr::Column { index, .. }) => {
                (*index, op.flip(), value)
            }
            _ => return None,
        };
        if value.is_null() {
            return None;
        }
        Some(Self {
            position,
            op,
            value: value.clone(),
        })
    }
}

/// Restrict the scan to the columns its consumer chain references
fn prune(node: &mut PlanNode) -> Result<()> {
    match node {
        PlanNode::Project { input, exprs } if reaches_scan(input) => {
            let mut needed = Vec::new();
            for (_, expr) in exprs.iter() {
                expr.column_indices(&mut needed);
            }
            let mapping = prune_input(input, needed)?;
            for (_, expr) in exprs.iter_mut() {
                expr.rebind(&|i| remap(&mapping, i))?;
            }
            Ok(())
        }
        PlanNode::Aggregate {
            input,
            group_by,
            aggregates,
        } if reaches_scan(input) => {
            let mut needed = Vec::new();
            for (_, expr) in group_by.iter() {
                expr.column_indices(&mut needed);
            }
            for agg in aggregates.iter() {
                if let Some(arg) = &agg.arg {
                    arg.column_indices(&mut needed);
                }
            }
            let mapping = prune_input(input, needed)?;
            for (_, expr) in group_by.iter_mut() {
                expr.rebind(&|i| remap(&mapping, i))?;
            }
            for agg in aggregates.iter_mut() {
                if let Some(arg) = agg.arg.as_mut() {
                    arg.rebind(&|i| remap(&mapping, i))?;
                }
            }
            Ok(())
        }
        PlanNode::Scan(_) => Ok(()),
        PlanNode::Filter { input, .. }
        | PlanNode::Project { input, .. }
        | PlanNode::Aggregate { input, .. }
        | PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. } => prune(input),
    }
}

/// Whether the node is a Scan, optionally under one Filter
fn reaches_scan(node: &PlanNode) -> bool {
    match node {
        PlanNode::Scan(_) => true,
        PlanNode::Filter { input, .. } => matches!(input.as_ref(), PlanNode::Scan(_)),
        _ => false,
    }
}

/// Narrow the scan (under an optional Filter) to `needed` plus the filter's
/// own columns. Returns the schema positions now materialized, in order.
fn prune_input(node: &mut PlanNode, mut needed: Vec<usize>) -> Result<Vec<usize>> {
    match node {
        PlanNode::Scan(scan) => {
            needed.sort_unstable();
            apply_projection(scan, &needed)?;
            Ok(needed)
        }
        PlanNode::Filter { input, predicate } => {
            predicate.column_indices(&mut needed);
            let mapping = prune_input(input, needed)?;
            predicate.rebind(&|i| remap(&mapping, i))?;
            Ok(mapping)
        }
        _ => Err(Error::Internal("projection pruning reached a non-scan node".to_string())),
    }
}

fn apply_projection(scan: &mut ScanNode, positions: &[usize]) -> Result<()> {
    let mut columns = Vec::with_capacity(positions.len());
    for &p in positions {
        let slot = scan.projection.iter().position(|&q| q == p).ok_or_else(|| {
            Error::Internal(format!("column position {} is not scanned", p))
        })?;
        columns.push(scan.columns[slot].clone());
    }
    scan.projection = positions.to_vec();
    scan.columns = columns;
    Ok(())
}

fn remap(mapping: &[usize], old: usize) -> Option<usize> {
    mapping.iter().position(|&p| p == old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, DatasetKeys, Schema};
    use crate::dsl::parse;
    use crate::executor::planner::Planner;

    fn def() -> DatasetDef {
        DatasetDef::new(
            "metrics",
            7,
            Schema::from_columns(vec![
                Column::new("host", ColumnType::String).nullable(false),
                Column::new("ts", ColumnType::Int64).nullable(false),
                Column::new("value", ColumnType::Float64),
                Column::new("note", ColumnType::String),
            ]),
            DatasetKeys::partition(["host"]).with_sort(["ts"]),
        )
        .unwrap()
    }

    fn optimized(text: &str) -> Plan {
        let def = def();
        let plan = Planner::new(&def).plan(&parse(text).unwrap()).unwrap();
        HeuristicOptimizer::new(&def).optimize(plan).unwrap()
    }

    fn prefix(values: &[Value]) -> Vec<u8> {
        let mut encoder = KeyEncoder::new(7);
        for v in values {
            encoder.push(v);
        }
        encoder.into_prefix()
    }

    #[test]
    fn test_equality_prefix_pushdown() {
        let plan = optimized("select value from metrics where host = 'a' and ts = 5");
        let range = &plan.scan().unwrap().range;
        let p = prefix(&[Value::from("a"), Value::Int64(5)]);
        assert_eq!(range.lower, p);
        assert_eq!(range.upper, key::prefix_successor(&p).unwrap());
        assert_eq!(range.conditions, vec!["host = 'a'", "ts = 5"]);
    }

    #[test]
    fn test_pushed_string_conditions_are_quoted() {
        let plan = optimized("select value from metrics where host = 'o''brien' and ts < 3");
        let range = &plan.scan().unwrap().range;
        assert_eq!(range.conditions, vec!["host = 'o''brien'", "ts < 3"]);
        assert_eq!(range.lower, prefix(&[Value::from("o'brien")]));
        assert!(plan.to_string().contains("host = 'o''brien'"));
    }

    #[test]
    fn test_range_on_next_key_column() {
        let plan = optimized("select value from metrics where host = 'a' and ts > 10 and ts <= 20");
        let range = &plan.scan().unwrap().range;
        let host = prefix(&[Value::from("a")]);
        let ten = prefix(&[Value::from("a"), Value::Int64(10)]);
        let twenty = prefix(&[Value::from("a"), Value::Int64(20)]);
        assert!(range.lower > ten && range.lower.starts_with(&host));
        assert_eq!(range.lower, key::prefix_successor(&ten).unwrap());
        assert_eq!(range.upper, key::prefix_successor(&twenty).unwrap());
    }

    #[test]
    fn test_flipped_literal_and_between() {
        let plan = optimized("select value from metrics where 'a' = host and ts between 3 and 4");
        let range = &plan.scan().unwrap().range;
        assert_eq!(range.lower, prefix(&[Value::from("a"), Value::Int64(3)]));
        assert_eq!(range.conditions.len(), 3);
    }

    #[test]
    fn test_no_pushdown_without_leading_key() {
        let plan = optimized("select value from metrics where ts = 5");
        assert!(plan.scan().unwrap().range.is_full());

        let plan = optimized("select value from metrics where host = 'a' or ts = 5");
        assert!(plan.scan().unwrap().range.is_full());

        // float literal against an int64 key column
        let plan = optimized("select value from metrics where host = 'a' and ts = 1.5");
        assert_eq!(plan.scan().unwrap().range.conditions, vec!["host = 'a'"]);
    }

    #[test]
    fn test_projection_pruning() {
        let plan = optimized("select value from metrics where host = 'a'");
        let scan = plan.scan().unwrap();
        assert_eq!(scan.projection, vec![0, 2]);
        let names: Vec<&str> = scan.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["host", "value"]);

        let plan = optimized("select count(*) from metrics");
        assert!(plan.scan().unwrap().projection.is_empty());

        let plan = optimized("select note from metrics order by ts");
        assert_eq!(plan.scan().unwrap().projection, vec![1, 3]);
    }

    #[test]
    fn test_pushdown_is_deterministic() {
        let text = "select * from metrics where host = 'x' and ts >= 1";
        assert_eq!(optimized(text), optimized(text));
        assert_eq!(optimized(text).to_string(), optimized(text).to_string());
    }
}
