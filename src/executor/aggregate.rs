//! Hash aggregation
//!
//! Groups are kept in first-seen order so output is deterministic for a given
//! input. The group table counts against the same per-query memory ceiling as
//! Sort; aggregation never spills.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;

use super::context::ExecContext;
use super::expr::PhysicalExpr;
use super::operators::Operator;
use super::plan::AggregateExpr;
use crate::batch::convert::{rows_to_batch, value_at};
use crate::dsl::AggregateFunc;
use crate::error::{Error, Result};
use crate::storage::Value;

/// Running state of one aggregate within one group
#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Min(Value),
    Max(Value),
    Avg { sum: f64, count: i64 },
}

impl Accumulator {
    fn new(agg: &AggregateExpr) -> Self {
        match agg.func {
            AggregateFunc::Count => Accumulator::Count(0),
            AggregateFunc::Sum if agg.output_type == crate::catalog::ColumnType::Int64 => {
                Accumulator::SumInt(None)
            }
            AggregateFunc::Sum => Accumulator::SumFloat(None),
            AggregateFunc::Min => Accumulator::Min(Value::Null),
            AggregateFunc::Max => Accumulator::Max(Value::Null),
            AggregateFunc::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
        }
    }

    /// Fold one input value; `None` is a `count(*)` row
    fn update(&mut self, value: Option<Value>) -> Result<()> {
        let value = match value {
            None => {
                if let Accumulator::Count(n) = self {
                    *n += 1;
                }
                return Ok(());
            }
            Some(Value::Null) => return Ok(()),
            Some(v) => v,
        };
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::SumInt(sum) => {
                let v = value.as_i64().unwrap_or_default();
                let next = sum.unwrap_or(0).checked_add(v).ok_or_else(|| {
                    Error::ExecutionError("integer overflow in sum".to_string())
                })?;
                *sum = Some(next);
            }
            Accumulator::SumFloat(sum) => {
                *sum = Some(sum.unwrap_or(0.0) + value.as_f64().unwrap_or_default())
            }
            Accumulator::Min(current) => {
                if current.is_null() || value.compare(current) == Some(std::cmp::Ordering::Less) {
                    *current = value;
                }
            }
            Accumulator::Max(current) => {
                if current.is_null()
                    || value.compare(current) == Some(std::cmp::Ordering::Greater)
                {
                    *current = value;
                }
            }
            Accumulator::Avg { sum, count } => {
                *sum += value.as_f64().unwrap_or_default();
                *count += 1;
            }
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int64(*n),
            Accumulator::SumInt(sum) => sum.map_or(Value::Null, Value::Int64),
            Accumulator::SumFloat(sum) => sum.map_or(Value::Null, Value::Float64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone(),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { sum, count } => Value::Float64(sum / *count as f64),
        }
    }
}

pub struct AggregateOp {
    input: Option<Box<Operator>>,
    group_by: Vec<PhysicalExpr>,
    aggregates: Vec<AggregateExpr>,
    schema: SchemaRef,
    output: Option<(RecordBatch, usize)>,
}

impl AggregateOp {
    pub fn new(
        input: Operator,
        group_by: Vec<PhysicalExpr>,
        aggregates: Vec<AggregateExpr>,
        schema: SchemaRef,
    ) -> Self {
        Self {
            input: Some(Box::new(input)),
            group_by,
            aggregates,
            schema,
            output: None,
        }
    }

    pub fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        if self.output.is_none() {
            let batch = self.consume(ctx)?;
            self.output = Some((batch, 0));
        }
        let Some((batch, offset)) = self.output.as_mut() else {
            return Ok(None);
        };
        if *offset >= batch.num_rows() {
            return Ok(None);
        }
        let len = ctx.options().batch_rows.min(batch.num_rows() - *offset);
        let out = batch.slice(*offset, len);
        *offset += len;
        Ok(Some(out))
    }

    fn consume(&mut self, ctx: &ExecContext) -> Result<RecordBatch> {
        let limit = ctx.options().memory_limit;
        let mut input = self
            .input
            .take()
            .ok_or_else(|| Error::Internal("aggregate input consumed twice".to_string()))?;

        let mut groups: IndexMap<Vec<Value>, Vec<Accumulator>> = IndexMap::new();
        let mut bytes = 0usize;
        let fresh: Vec<Accumulator> = self.aggregates.iter().map(Accumulator::new).collect();
        let per_group = fresh.len() * std::mem::size_of::<Accumulator>();

        while let Some(batch) = input.next_batch(ctx)? {
            let keys = self
                .group_by
                .iter()
                .map(|e| e.evaluate(&batch))
                .collect::<Result<Vec<_>>>()?;
            let args = self
                .aggregates
                .iter()
                .map(|a| a.arg.as_ref().map(|e| e.evaluate(&batch)).transpose())
                .collect::<Result<Vec<_>>>()?;

            for row in 0..batch.num_rows() {
                let key: Vec<Value> = keys
                    .iter()
                    .map(|k| value_at(k.as_ref(), row).canonical())
                    .collect();
                if !groups.contains_key(&key) {
                    bytes += per_group + key.iter().map(Value::estimated_size).sum::<usize>();
                    if bytes > limit {
                        return Err(Error::ResourceExhausted {
                            resource: "aggregate memory".to_string(),
                            limit,
                        });
                    }
                }
                let accumulators = groups.entry(key).or_insert_with(|| fresh.clone());
                for (acc, arg) in accumulators.iter_mut().zip(&args) {
                    acc.update(arg.as_ref().map(|a| value_at(a.as_ref(), row)))?;
                }
            }
        }
        drop(input);

        // a global aggregate over no rows still yields one row
        if self.group_by.is_empty() && groups.is_empty() {
            groups.insert(Vec::new(), fresh);
        }

        let rows: Vec<Vec<Value>> = groups
            .into_iter()
            .map(|(mut key, accumulators)| {
                key.extend(accumulators.iter().map(Accumulator::finish));
                key
            })
            .collect();
        rows_to_batch(self.schema.clone(), &rows)
    }
}
