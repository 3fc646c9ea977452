//! Vectorized expression evaluation
//!
//! Expressions are resolved and typed by the planner; evaluation runs whole
//! columns through Arrow compute kernels.

use std::fmt;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric::{add, div, mul, neg, rem, sub};
use arrow::compute::{and_kleene, cast, is_not_null, is_null, not, or_kleene};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::batch::convert::constant_array;
use crate::catalog::ColumnType;
use crate::dsl::BinaryOperator;
use crate::error::{Error, Result};
use crate::storage::Value;

/// A resolved, typed expression over the columns of an operator's input
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalExpr {
    /// Column at `index` of the input batch
    Column {
        index: usize,
        name: String,
        column_type: ColumnType,
    },
    Literal {
        value: Value,
        column_type: ColumnType,
    },
    Binary {
        left: Box<PhysicalExpr>,
        op: BinaryOperator,
        right: Box<PhysicalExpr>,
        result: ColumnType,
    },
    Not(Box<PhysicalExpr>),
    Negate(Box<PhysicalExpr>),
    IsNull {
        expr: Box<PhysicalExpr>,
        negated: bool,
    },
    /// Int64 to Float64 widening
    Cast {
        expr: Box<PhysicalExpr>,
        to: ColumnType,
    },
}

impl PhysicalExpr {
    pub fn column(index: usize, name: impl Into<String>, column_type: ColumnType) -> Self {
        PhysicalExpr::Column {
            index,
            name: name.into(),
            column_type,
        }
    }

    /// Result type
    pub fn column_type(&self) -> ColumnType {
        match self {
            PhysicalExpr::Column { column_type, .. } | PhysicalExpr::Literal { column_type, .. } => {
                *column_type
            }
            PhysicalExpr::Binary { result, .. } => *result,
            PhysicalExpr::Not(_) | PhysicalExpr::IsNull { .. } => ColumnType::Boolean,
            PhysicalExpr::Negate(inner) => inner.column_type(),
            PhysicalExpr::Cast { to, .. } => *to,
        }
    }

    /// Input column indices referenced, in first-use order
    pub fn column_indices(&self, out: &mut Vec<usize>) {
        match self {
            PhysicalExpr::Column { index, .. } => {
                if !out.contains(index) {
                    out.push(*index);
                }
            }
            PhysicalExpr::Literal { .. } => {}
            PhysicalExpr::Binary { left, right, .. } => {
                left.column_indices(out);
                right.column_indices(out);
            }
            PhysicalExpr::Not(inner)
            | PhysicalExpr::Negate(inner)
            | PhysicalExpr::IsNull { expr: inner, .. }
            | PhysicalExpr::Cast { expr: inner, .. } => inner.column_indices(out),
        }
    }

    /// Rewrite column indices through `mapping` (old index to new index)
    pub fn rebind(&mut self, mapping: &dyn Fn(usize) -> Option<usize>) -> Result<()> {
        match self {
            PhysicalExpr::Column { index, name, .. } => {
                *index = mapping(*index).ok_or_else(|| {
                    Error::Internal(format!("column '{}' missing after pruning", name))
                })?;
                Ok(())
            }
            PhysicalExpr::Literal { .. } => Ok(()),
            PhysicalExpr::Binary { left, right, .. } => {
                left.rebind(mapping)?;
                right.rebind(mapping)
            }
            PhysicalExpr::Not(inner)
            | PhysicalExpr::Negate(inner)
            | PhysicalExpr::IsNull { expr: inner, .. }
            | PhysicalExpr::Cast { expr: inner, .. } => inner.rebind(mapping),
        }
    }

    /// Split a predicate into its top-level AND conjuncts
    pub fn conjuncts(&self) -> Vec<&PhysicalExpr> {
        match self {
            PhysicalExpr::Binary {
                left,
                op: BinaryOperator::And,
                right,
                ..
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Evaluate over every row of `batch`
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        match self {
            PhysicalExpr::Column { index, name, .. } => {
                if *index >= batch.num_columns() {
                    return Err(Error::Internal(format!(
                        "column '{}' bound to missing index {}",
                        name, index
                    )));
                }
                Ok(batch.column(*index).clone())
            }
            PhysicalExpr::Literal { value, column_type } => {
                constant_array(value, *column_type, batch.num_rows())
            }
            PhysicalExpr::Binary {
                left, op, right, ..
            } => {
                let l = left.evaluate(batch)?;
                let r = right.evaluate(batch)?;
                evaluate_binary(&l, *op, &r)
            }
            PhysicalExpr::Not(inner) => {
                let value = inner.evaluate(batch)?;
                Ok(Arc::new(not(as_boolean(&value)?)?))
            }
            PhysicalExpr::Negate(inner) => Ok(neg(inner.evaluate(batch)?.as_ref())?),
            PhysicalExpr::IsNull { expr, negated } => {
                let value = expr.evaluate(batch)?;
                let mask = if *negated {
                    is_not_null(value.as_ref())?
                } else {
                    is_null(value.as_ref())?
                };
                Ok(Arc::new(mask))
            }
            PhysicalExpr::Cast { expr, to } => {
                let value = expr.evaluate(batch)?;
                Ok(cast(&value, &to.arrow_type())?)
            }
        }
    }

    /// Evaluate a boolean expression into a selection mask
    pub fn evaluate_mask(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let value = self.evaluate(batch)?;
        Ok(as_boolean(&value)?.clone())
    }
}

fn as_boolean(array: &ArrayRef) -> Result<&BooleanArray> {
    array.as_boolean_opt().ok_or_else(|| {
        Error::Internal(format!("expected a boolean array, got {}", array.data_type()))
    })
}

fn evaluate_binary(l: &ArrayRef, op: BinaryOperator, r: &ArrayRef) -> Result<ArrayRef> {
    let out: ArrayRef = match op {
        BinaryOperator::Eq => Arc::new(eq(l, r)?),
        BinaryOperator::Neq => Arc::new(neq(l, r)?),
        BinaryOperator::Lt => Arc::new(lt(l, r)?),
        BinaryOperator::Lte => Arc::new(lt_eq(l, r)?),
        BinaryOperator::Gt => Arc::new(gt(l, r)?),
        BinaryOperator::Gte => Arc::new(gt_eq(l, r)?),
        BinaryOperator::And => Arc::new(and_kleene(as_boolean(l)?, as_boolean(r)?)?),
        BinaryOperator::Or => Arc::new(or_kleene(as_boolean(l)?, as_boolean(r)?)?),
        BinaryOperator::Add => add(l, r)?,
        BinaryOperator::Sub => sub(l, r)?,
        BinaryOperator::Mul => mul(l, r)?,
        BinaryOperator::Div => div(l, r)?,
        BinaryOperator::Mod => rem(l, r)?,
    };
    Ok(out)
}

/// A literal as it is written in a query: strings quoted, `'` doubled
pub fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

impl fmt::Display for PhysicalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalExpr::Column { name, .. } => write!(f, "{}", name),
            PhysicalExpr::Literal { value, .. } => f.write_str(&literal_text(value)),
            PhysicalExpr::Binary {
                left, op, right, ..
            } => write!(f, "({} {} {})", left, op, right),
            PhysicalExpr::Not(inner) => write!(f, "(NOT {})", inner),
            PhysicalExpr::Negate(inner) => write!(f, "(-{})", inner),
            PhysicalExpr::IsNull { expr, negated } => {
                write!(f, "({} IS {}NULL)", expr, if *negated { "NOT " } else { "" })
            }
            PhysicalExpr::Cast { expr, to } => write!(f, "CAST({} AS {})", expr, to),
        }
    }
}
