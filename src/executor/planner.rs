//! Query planner
//!
//! Resolves a parsed query against one dataset generation and lowers it into
//! a plan tree. Operators are stacked in a fixed order:
//!
//! `Scan -> [Filter] -> [Aggregate] -> Project -> [Sort] -> [Limit] -> [Project]`
//!
//! The trailing Project only appears when ORDER BY needs a column the select
//! list does not return; it drops that column again after sorting.

use super::expr::PhysicalExpr;
use super::plan::{AggregateExpr, KeyRange, OutputColumn, Plan, PlanNode, ScanNode, SortKey};
use crate::catalog::{ColumnType, DatasetDef};
use crate::dsl::{AggregateFunc, BinaryOperator, Expr, Query, SelectItem, UnaryOperator};
use crate::error::{Error, Result};
use crate::storage::key;
use crate::storage::Value;

/// Columns visible to an expression
struct Scope<'a> {
    dataset: &'a str,
    columns: Vec<OutputColumn>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, name: &str) -> Option<(usize, &OutputColumn)> {
        self.columns.iter().enumerate().find(|(_, c)| c.name == name)
    }
}

/// A resolved expression; `ty` is None for an untyped NULL literal
struct Resolved {
    expr: PhysicalExpr,
    ty: Option<ColumnType>,
}

impl Resolved {
    /// Give an untyped NULL the type it is used as
    fn typed(self, ty: ColumnType) -> PhysicalExpr {
        match self.ty {
            Some(_) => self.expr,
            None => PhysicalExpr::Literal {
                value: Value::Null,
                column_type: ty,
            },
        }
    }
}

/// Query planner for one dataset generation
pub struct Planner<'a> {
    def: &'a DatasetDef,
}

impl<'a> Planner<'a> {
    pub fn new(def: &'a DatasetDef) -> Self {
        Self { def }
    }

    /// Plan a query with a full-range scan over every column
    pub fn plan(&self, query: &Query) -> Result<Plan> {
        let dataset_scope = self.dataset_scope();

        let mut node = PlanNode::Scan(ScanNode {
            dataset: self.def.name.clone(),
            generation: self.def.generation,
            projection: (0..dataset_scope.columns.len()).collect(),
            columns: dataset_scope.columns.clone(),
            range: KeyRange {
                lower: key::namespace_start(self.def.generation),
                upper: key::rows_end(self.def.generation),
                conditions: Vec::new(),
            },
        });

        if let Some(selection) = &query.selection {
            let resolved = self.resolve(&dataset_scope, selection)?;
            match resolved.ty {
                Some(ColumnType::Boolean) | None => {}
                Some(other) => {
                    return Err(Error::TypeMismatch {
                        context: "WHERE clause".to_string(),
                        expected: ColumnType::Boolean.to_string(),
                        found: other.to_string(),
                    })
                }
            }
            node = PlanNode::Filter {
                input: Box::new(node),
                predicate: resolved.typed(ColumnType::Boolean),
            };
        }

        let (node, mut exprs, scope) = if query.is_aggregate() {
            self.plan_aggregate(query, node, &dataset_scope)?
        } else {
            let exprs = self.plan_projection(query, &dataset_scope)?;
            (node, exprs, None)
        };

        let output: Vec<OutputColumn> = exprs
            .iter()
            .map(|(name, expr)| OutputColumn::new(name.clone(), expr.column_type()))
            .collect();
        for (i, column) in output.iter().enumerate() {
            if output[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::Semantic(format!(
                    "duplicate output column '{}'",
                    column.name
                )));
            }
        }

        let keys = self.sort_keys(query, &mut exprs, scope.as_ref(), &dataset_scope)?;
        let hidden = exprs.len() > output.len();

        let mut node = PlanNode::Project {
            input: Box::new(node),
            exprs,
        };
        if !keys.is_empty() {
            node = PlanNode::Sort {
                input: Box::new(node),
                keys,
            };
        }
        if query.limit.is_some() || query.offset.is_some() {
            node = PlanNode::Limit {
                input: Box::new(node),
                limit: query.limit,
                offset: query.offset.unwrap_or(0),
            };
        }
        if hidden {
            let trimmed = output
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    (
                        c.name.clone(),
                        PhysicalExpr::column(i, c.name.clone(), c.column_type),
                    )
                })
                .collect();
            node = PlanNode::Project {
                input: Box::new(node),
                exprs: trimmed,
            };
        }

        Ok(Plan {
            dataset: self.def.name.clone(),
            generation: self.def.generation,
            root: node,
            output,
        })
    }

    fn dataset_scope(&self) -> Scope<'a> {
        Scope {
            dataset: &self.def.name,
            columns: self
                .def
                .schema
                .columns()
                .iter()
                .map(|c| OutputColumn::new(c.name.clone(), c.column_type))
                .collect(),
        }
    }

    fn plan_projection(
        &self,
        query: &Query,
        scope: &Scope<'_>,
    ) -> Result<Vec<(String, PhysicalExpr)>> {
        let mut exprs = Vec::new();
        for item in &query.projection {
            match item {
                SelectItem::Wildcard => {
                    for (i, c) in scope.columns.iter().enumerate() {
                        exprs.push((c.name.clone(), PhysicalExpr::column(i, c.name.clone(), c.column_type)));
                    }
                }
                SelectItem::Expr { expr, .. } => {
                    let resolved = self.resolve(scope, expr)?;
                    exprs.push((item.output_name(), resolved.typed(ColumnType::Int64)));
                }
                SelectItem::Aggregate { .. } => {
                    return Err(Error::Internal(
                        "aggregate in a non-aggregate projection".to_string(),
                    ))
                }
            }
        }
        Ok(exprs)
    }

    /// Plan GROUP BY and aggregates. Returns the Aggregate node, the select
    /// list over its output and the scope ORDER BY may reach into.
    fn plan_aggregate<'s>(
        &self,
        query: &Query,
        input: PlanNode,
        dataset_scope: &Scope<'s>,
    ) -> Result<(PlanNode, Vec<(String, PhysicalExpr)>, Option<Scope<'s>>)> {
        let mut group_by = Vec::with_capacity(query.group_by.len());
        for name in &query.group_by {
            let (index, column) = dataset_scope.lookup(name).ok_or_else(|| Error::UnknownColumn {
                column: name.clone(),
                dataset: self.def.name.clone(),
            })?;
            if group_by.iter().any(|(n, _)| n == name) {
                return Err(Error::Semantic(format!("column '{}' grouped twice", name)));
            }
            group_by.push((
                name.clone(),
                PhysicalExpr::column(index, name.clone(), column.column_type),
            ));
        }

        let mut aggregates = Vec::new();
        for item in &query.projection {
            if let SelectItem::Aggregate { func, arg, .. } = item {
                aggregates.push(self.plan_aggregate_expr(dataset_scope, *func, arg.as_ref(), item.output_name())?);
            }
        }

        // Aggregate output: group columns, then aggregates
        let group_scope = Scope {
            dataset: dataset_scope.dataset,
            columns: group_by
                .iter()
                .map(|(n, e)| OutputColumn::new(n.clone(), e.column_type()))
                .collect(),
        };
        let mut exprs = Vec::new();
        let mut next_aggregate = group_by.len();
        for item in &query.projection {
            match item {
                SelectItem::Wildcard => {
                    return Err(Error::Semantic(
                        "'*' cannot be combined with aggregation".to_string(),
                    ))
                }
                SelectItem::Aggregate { .. } => {
                    let agg = &aggregates[next_aggregate - group_by.len()];
                    exprs.push((
                        agg.name.clone(),
                        PhysicalExpr::column(next_aggregate, agg.name.clone(), agg.output_type),
                    ));
                    next_aggregate += 1;
                }
                SelectItem::Expr { expr, .. } => {
                    let mut referenced = Vec::new();
                    expr.columns(&mut referenced);
                    for name in referenced {
                        if group_scope.lookup(&name).is_some() {
                            continue;
                        }
                        if dataset_scope.lookup(&name).is_some() {
                            return Err(Error::Semantic(format!(
                                "column '{}' must appear in GROUP BY or inside an aggregate",
                                name
                            )));
                        }
                        return Err(Error::UnknownColumn {
                            column: name,
                            dataset: self.def.name.clone(),
                        });
                    }
                    let resolved = self.resolve(&group_scope, expr)?;
                    exprs.push((item.output_name(), resolved.typed(ColumnType::Int64)));
                }
            }
        }

        let node = PlanNode::Aggregate {
            input: Box::new(input),
            group_by,
            aggregates,
        };
        Ok((node, exprs, Some(group_scope)))
    }

    fn plan_aggregate_expr(
        &self,
        scope: &Scope<'_>,
        func: AggregateFunc,
        arg: Option<&Expr>,
        name: String,
    ) -> Result<AggregateExpr> {
        let arg = match arg {
            Some(expr) => Some(self.resolve(scope, expr)?.typed(ColumnType::Int64)),
            None => None,
        };
        let arg_type = arg.as_ref().map(PhysicalExpr::column_type);

        let output_type = match (func, arg_type) {
            (AggregateFunc::Count, _) => ColumnType::Int64,
            (AggregateFunc::Avg, Some(t)) if t.is_numeric() => ColumnType::Float64,
            (AggregateFunc::Sum, Some(t)) if t.is_numeric() => t,
            (AggregateFunc::Min | AggregateFunc::Max, Some(t)) => t,
            (_, found) => {
                return Err(Error::TypeMismatch {
                    context: name,
                    expected: "numeric".to_string(),
                    found: found.map_or("*".to_string(), |t| t.to_string()),
                })
            }
        };
        Ok(AggregateExpr {
            func,
            arg,
            name,
            output_type,
        })
    }

    /// Resolve ORDER BY against output names first, then against input
    /// columns, which are appended to `exprs` as hidden outputs
    fn sort_keys(
        &self,
        query: &Query,
        exprs: &mut Vec<(String, PhysicalExpr)>,
        group_scope: Option<&Scope<'_>>,
        dataset_scope: &Scope<'_>,
    ) -> Result<Vec<SortKey>> {
        let mut keys = Vec::with_capacity(query.order_by.len());
        for item in &query.order_by {
            let name = &item.column;
            let index = match exprs.iter().position(|(n, _)| n == name) {
                Some(index) => index,
                None => {
                    let inner = group_scope.unwrap_or(dataset_scope);
                    let (position, column) = match inner.lookup(name) {
                        Some(found) => found,
                        None if dataset_scope.lookup(name).is_some() => {
                            return Err(Error::Semantic(format!(
                                "cannot order by '{}': not grouped",
                                name
                            )))
                        }
                        None => {
                            return Err(Error::UnknownColumn {
                                column: name.clone(),
                                dataset: self.def.name.clone(),
                            })
                        }
                    };
                    exprs.push((
                        name.clone(),
                        PhysicalExpr::column(position, name.clone(), column.column_type),
                    ));
                    exprs.len() - 1
                }
            };
            keys.push(SortKey {
                index,
                name: name.clone(),
                ascending: item.ascending,
            });
        }
        Ok(keys)
    }

    // ========== Expression Resolution ==========

    fn resolve(&self, scope: &Scope<'_>, expr: &Expr) -> Result<Resolved> {
        match expr {
            Expr::Column(name) => {
                let (index, column) = scope.lookup(name).ok_or_else(|| Error::UnknownColumn {
                    column: name.clone(),
                    dataset: scope.dataset.to_string(),
                })?;
                Ok(Resolved {
                    expr: PhysicalExpr::column(index, name.clone(), column.column_type),
                    ty: Some(column.column_type),
                })
            }
            Expr::Literal(lit) => {
                let value = lit.to_value();
                let ty = value.column_type();
                Ok(Resolved {
                    expr: PhysicalExpr::Literal {
                        value,
                        column_type: ty.unwrap_or(ColumnType::Int64),
                    },
                    ty,
                })
            }
            Expr::BinaryOp { left, op, right } => self.resolve_binary(scope, expr, left, *op, right),
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: inner,
            } => {
                let inner = self.resolve(scope, inner)?;
                let inner = expect_type(inner, ColumnType::Boolean, expr)?;
                Ok(Resolved {
                    expr: PhysicalExpr::Not(Box::new(inner)),
                    ty: Some(ColumnType::Boolean),
                })
            }
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: inner,
            } => {
                let inner = self.resolve(scope, inner)?;
                let inner = expect_numeric(inner, expr)?;
                let ty = inner.column_type();
                Ok(Resolved {
                    expr: PhysicalExpr::Negate(Box::new(inner)),
                    ty: Some(ty),
                })
            }
            Expr::IsNull {
                expr: inner,
                negated,
            } => {
                let inner = self.resolve(scope, inner)?.typed(ColumnType::Int64);
                Ok(Resolved {
                    expr: PhysicalExpr::IsNull {
                        expr: Box::new(inner),
                        negated: *negated,
                    },
                    ty: Some(ColumnType::Boolean),
                })
            }
            Expr::Between {
                expr: inner,
                low,
                high,
                negated,
            } => {
                let range = Expr::binary(
                    Expr::binary((**inner).clone(), BinaryOperator::Gte, (**low).clone()),
                    BinaryOperator::And,
                    Expr::binary((**inner).clone(), BinaryOperator::Lte, (**high).clone()),
                );
                self.resolve(scope, &negate_if(range, *negated))
            }
            Expr::InList {
                expr: inner,
                list,
                negated,
            } => {
                let mut alternatives = list
                    .iter()
                    .map(|item| Expr::binary((**inner).clone(), BinaryOperator::Eq, item.clone()));
                let first = alternatives
                    .next()
                    .ok_or_else(|| Error::Semantic("empty IN list".to_string()))?;
                let any = alternatives.fold(first, |acc, eq| Expr::binary(acc, BinaryOperator::Or, eq));
                self.resolve(scope, &negate_if(any, *negated))
            }
        }
    }

    fn resolve_binary(
        &self,
        scope: &Scope<'_>,
        whole: &Expr,
        left: &Expr,
        op: BinaryOperator,
        right: &Expr,
    ) -> Result<Resolved> {
        let l = self.resolve(scope, left)?;
        let r = self.resolve(scope, right)?;

        let (left, right, result) = if op.is_comparison() {
            let (left, right) = match (l.ty, r.ty) {
                (None, None) => (l.typed(ColumnType::Boolean), r.typed(ColumnType::Boolean)),
                (Some(t), None) => (l.expr, r.typed(t)),
                (None, Some(t)) => (l.typed(t), r.expr),
                (Some(a), Some(b)) => {
                    if !a.is_comparable_with(&b) {
                        return Err(mismatch(whole, a, b));
                    }
                    if a == b {
                        (l.expr, r.expr)
                    } else {
                        (widen(l.expr), widen(r.expr))
                    }
                }
            };
            (left, right, ColumnType::Boolean)
        } else if op.is_arithmetic() {
            let fallback = l.ty.or(r.ty).unwrap_or(ColumnType::Int64);
            let left = expect_numeric(Resolved { ty: Some(l.ty.unwrap_or(fallback)), expr: l.typed(fallback) }, whole)?;
            let right = expect_numeric(Resolved { ty: Some(r.ty.unwrap_or(fallback)), expr: r.typed(fallback) }, whole)?;
            let result = left
                .column_type()
                .numeric_result(&right.column_type())
                .unwrap_or(ColumnType::Float64);
            if result == ColumnType::Float64 {
                (widen(left), widen(right), result)
            } else {
                (left, right, result)
            }
        } else {
            let left = expect_type(l, ColumnType::Boolean, whole)?;
            let right = expect_type(r, ColumnType::Boolean, whole)?;
            (left, right, ColumnType::Boolean)
        };

        Ok(Resolved {
            expr: PhysicalExpr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                result,
            },
            ty: Some(result),
        })
    }
}

fn negate_if(expr: Expr, negated: bool) -> Expr {
    if negated {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(expr),
        }
    } else {
        expr
    }
}

/// Widen an int64 expression to float64; literals are folded
fn widen(expr: PhysicalExpr) -> PhysicalExpr {
    match expr {
        PhysicalExpr::Literal {
            value,
            column_type: ColumnType::Int64,
        } => PhysicalExpr::Literal {
            value: value.coerce_to(ColumnType::Float64).unwrap_or(Value::Null),
            column_type: ColumnType::Float64,
        },
        e if e.column_type() == ColumnType::Int64 => PhysicalExpr::Cast {
            expr: Box::new(e),
            to: ColumnType::Float64,
        },
        e => e,
    }
}

fn mismatch(context: &Expr, expected: ColumnType, found: ColumnType) -> Error {
    Error::TypeMismatch {
        context: context.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn expect_type(resolved: Resolved, expected: ColumnType, context: &Expr) -> Result<PhysicalExpr> {
    match resolved.ty {
        Some(t) if t != expected => Err(mismatch(context, expected, t)),
        _ => Ok(resolved.typed(expected)),
    }
}

fn expect_numeric(resolved: Resolved, context: &Expr) -> Result<PhysicalExpr> {
    match resolved.ty {
        Some(t) if !t.is_numeric() => Err(Error::TypeMismatch {
            context: context.to_string(),
            expected: "numeric".to_string(),
            found: t.to_string(),
        }),
        _ => Ok(resolved.typed(ColumnType::Int64)),
    }
}
