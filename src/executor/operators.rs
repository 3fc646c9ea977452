//! Pull-based physical operators
//!
//! Every operator answers `next_batch`, returning `None` once exhausted. The
//! context is checked on every pull, so cancellation and deadlines surface at
//! the next batch boundary of whichever operator is running.

use std::sync::Arc;

use arrow::compute::filter_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tracing::trace;

use super::aggregate::AggregateOp;
use super::context::ExecContext;
use super::expr::PhysicalExpr;
use super::plan::{arrow_schema, PlanNode};
use super::sort::SortOp;
use crate::batch::convert::{batch_with_rows, rows_to_batch};
use crate::error::Result;
use crate::storage::row::decode_projected;
use crate::storage::{RangeScan, Snapshot, StorageEngine, Value};

/// A running operator tree
pub enum Operator {
    Scan(ScanOp),
    Filter(FilterOp),
    Project(ProjectOp),
    Aggregate(AggregateOp),
    Sort(SortOp),
    Limit(LimitOp),
    #[cfg(test)]
    Values(ValuesOp),
}

impl Operator {
    /// Pull the next batch
    pub fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        ctx.check()?;
        match self {
            Operator::Scan(op) => op.next_batch(),
            Operator::Filter(op) => op.next_batch(ctx),
            Operator::Project(op) => op.next_batch(ctx),
            Operator::Aggregate(op) => op.next_batch(ctx),
            Operator::Sort(op) => op.next_batch(ctx),
            Operator::Limit(op) => op.next_batch(ctx),
            #[cfg(test)]
            Operator::Values(op) => Ok(op.next_batch()),
        }
    }
}

/// Reads one key range of a generation, then the caller's unflushed rows
pub struct ScanOp {
    scan: Option<RangeScan>,
    positions: Vec<usize>,
    schema: SchemaRef,
    overlay: Vec<Vec<Value>>,
    batch_rows: usize,
}

impl ScanOp {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        while let Some(scan) = self.scan.as_mut() {
            let Some(entries) = scan.next_chunk()? else {
                // drops the snapshot as soon as the range is exhausted
                self.scan = None;
                break;
            };
            let rows = entries
                .iter()
                .map(|(_, value)| decode_projected(value, &self.positions))
                .collect::<Result<Vec<_>>>()?;
            if !rows.is_empty() {
                return rows_to_batch(self.schema.clone(), &rows).map(Some);
            }
        }

        if self.overlay.is_empty() {
            return Ok(None);
        }
        let take = self.batch_rows.min(self.overlay.len());
        let rows: Vec<Vec<Value>> = self
            .overlay
            .drain(..take)
            .map(|row| self.positions.iter().map(|&p| row[p].clone()).collect())
            .collect();
        trace!(rows = rows.len(), "scanning unflushed rows");
        rows_to_batch(self.schema.clone(), &rows).map(Some)
    }
}

pub struct FilterOp {
    input: Box<Operator>,
    predicate: PhysicalExpr,
}

impl FilterOp {
    fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        while let Some(batch) = self.input.next_batch(ctx)? {
            let mask = self.predicate.evaluate_mask(&batch)?;
            let filtered = filter_record_batch(&batch, &mask)?;
            if filtered.num_rows() > 0 {
                return Ok(Some(filtered));
            }
        }
        Ok(None)
    }
}

pub struct ProjectOp {
    input: Box<Operator>,
    exprs: Vec<PhysicalExpr>,
    schema: SchemaRef,
}

impl ProjectOp {
    fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        let Some(batch) = self.input.next_batch(ctx)? else {
            return Ok(None);
        };
        let columns = self
            .exprs
            .iter()
            .map(|e| e.evaluate(&batch))
            .collect::<Result<Vec<_>>>()?;
        batch_with_rows(self.schema.clone(), columns, batch.num_rows()).map(Some)
    }
}

/// Skips `offset` rows, then passes at most `limit` rows.
///
/// The input is dropped as soon as the limit is reached, which releases the
/// scan and its snapshot before the consumer finishes reading.
pub struct LimitOp {
    input: Option<Box<Operator>>,
    skip: u64,
    remaining: Option<u64>,
}

impl LimitOp {
    fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        loop {
            if self.remaining == Some(0) {
                self.input = None;
                return Ok(None);
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            let Some(batch) = input.next_batch(ctx)? else {
                self.input = None;
                return Ok(None);
            };

            let rows = batch.num_rows() as u64;
            let start = self.skip.min(rows);
            self.skip -= start;
            let mut len = rows - start;
            if let Some(remaining) = self.remaining.as_mut() {
                len = len.min(*remaining);
                *remaining -= len;
            }
            if len == 0 {
                continue;
            }
            let out = batch.slice(start as usize, len as usize);
            if self.remaining == Some(0) {
                self.input = None;
            }
            return Ok(Some(out));
        }
    }
}

/// Emits a fixed list of batches
#[cfg(test)]
pub struct ValuesOp {
    batches: std::collections::VecDeque<RecordBatch>,
}

#[cfg(test)]
impl ValuesOp {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    fn next_batch(&mut self) -> Option<RecordBatch> {
        self.batches.pop_front()
    }
}

/// What the scan at the bottom of a plan reads from
pub struct ScanSource<'a> {
    pub storage: &'a Arc<StorageEngine>,
    pub snapshot: &'a Snapshot,
    /// Unflushed rows of the querying session, in schema layout
    pub overlay: Vec<Vec<Value>>,
    pub batch_rows: usize,
}

/// Instantiate the operator tree for a plan node
pub fn build(node: &PlanNode, source: &mut ScanSource<'_>) -> Result<Operator> {
    let op = match node {
        PlanNode::Scan(scan) => {
            let range = source.storage.range_scan(
                source.snapshot,
                scan.range.lower.clone(),
                Some(scan.range.upper.clone()),
            );
            Operator::Scan(ScanOp {
                scan: Some(range),
                positions: scan.projection.clone(),
                schema: arrow_schema(&scan.columns),
                overlay: std::mem::take(&mut source.overlay),
                batch_rows: source.batch_rows.max(1),
            })
        }
        PlanNode::Filter { input, predicate } => Operator::Filter(FilterOp {
            input: Box::new(build(input, source)?),
            predicate: predicate.clone(),
        }),
        PlanNode::Project { input, exprs } => Operator::Project(ProjectOp {
            input: Box::new(build(input, source)?),
            exprs: exprs.iter().map(|(_, e)| e.clone()).collect(),
            schema: arrow_schema(&node.columns()),
        }),
        PlanNode::Aggregate {
            input,
            group_by,
            aggregates,
        } => Operator::Aggregate(AggregateOp::new(
            build(input, source)?,
            group_by.iter().map(|(_, e)| e.clone()).collect(),
            aggregates.clone(),
            arrow_schema(&node.columns()),
        )),
        PlanNode::Sort { input, keys } => Operator::Sort(SortOp::new(
            build(input, source)?,
            keys.clone(),
            arrow_schema(&node.columns()),
        )),
        PlanNode::Limit {
            input,
            limit,
            offset,
        } => Operator::Limit(LimitOp {
            input: Some(Box::new(build(input, source)?)),
            skip: *offset,
            remaining: *limit,
        }),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::convert::batch_to_rows;
    use crate::catalog::ColumnType;
    use crate::executor::context::ExecOptions;
    use crate::executor::plan::OutputColumn;

    fn numbers(batches: usize, per_batch: i64) -> Vec<RecordBatch> {
        let schema = arrow_schema(&[OutputColumn::new("n", ColumnType::Int64)]);
        (0..batches as i64)
            .map(|b| {
                let rows: Vec<Vec<Value>> = (0..per_batch)
                    .map(|i| vec![Value::Int64(b * per_batch + i)])
                    .collect();
                rows_to_batch(schema.clone(), &rows).unwrap()
            })
            .collect()
    }

    fn drain(op: &mut Operator, ctx: &ExecContext) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(batch) = op.next_batch(ctx).unwrap() {
            out.extend(
                batch_to_rows(&batch)
                    .into_iter()
                    .filter_map(|r| r[0].as_i64()),
            );
        }
        out
    }

    fn limit(offset: u64, limit: Option<u64>) -> Operator {
        Operator::Limit(LimitOp {
            input: Some(Box::new(Operator::Values(ValuesOp::new(numbers(3, 4))))),
            skip: offset,
            remaining: limit,
        })
    }

    #[test]
    fn test_limit_spans_batches() {
        let ctx = ExecContext::new(ExecOptions::default());
        assert_eq!(drain(&mut limit(3, Some(6)), &ctx), vec![3, 4, 5, 6, 7, 8]);
        assert_eq!(drain(&mut limit(10, None), &ctx), vec![10, 11]);
        assert!(drain(&mut limit(0, Some(0)), &ctx).is_empty());
        assert!(drain(&mut limit(20, Some(5)), &ctx).is_empty());
    }

    #[test]
    fn test_limit_releases_input_once_satisfied() {
        let ctx = ExecContext::new(ExecOptions::default());
        let mut op = limit(0, Some(2));
        op.next_batch(&ctx).unwrap();
        let Operator::Limit(inner) = &op else {
            unreachable!()
        };
        assert!(inner.input.is_none());
    }

    #[test]
    fn test_filter_skips_empty_batches() {
        let ctx = ExecContext::new(ExecOptions::default());
        let n = PhysicalExpr::column(0, "n", ColumnType::Int64);
        let predicate = PhysicalExpr::Binary {
            left: Box::new(n),
            op: crate::dsl::BinaryOperator::Gt,
            right: Box::new(PhysicalExpr::Literal {
                value: Value::Int64(9),
                column_type: ColumnType::Int64,
            }),
            result: ColumnType::Boolean,
        };
        let mut op = Operator::Filter(FilterOp {
            input: Box::new(Operator::Values(ValuesOp::new(numbers(3, 4)))),
            predicate,
        });
        assert_eq!(op.next_batch(&ctx).unwrap().unwrap().num_rows(), 2);
        assert!(op.next_batch(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_context_stops_pull() {
        let ctx = ExecContext::new(ExecOptions::default());
        let mut op = Operator::Values(ValuesOp::new(numbers(2, 2)));
        op.next_batch(&ctx).unwrap();
        ctx.token().cancel();
        assert!(matches!(
            op.next_batch(&ctx),
            Err(crate::error::Error::Cancelled)
        ));
    }
}
