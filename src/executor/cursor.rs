//! Result cursor
//!
//! A cursor owns a running operator tree together with the generation lease
//! the query was compiled against. Closing it, explicitly or by exhausting it,
//! releases the scan's snapshot and the lease.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::context::ExecContext;
use super::operators::Operator;
use crate::batch::convert::batch_to_rows;
use crate::catalog::{GenerationId, GenerationLease};
use crate::error::Result;
use crate::storage::Value;

pub struct Cursor {
    root: Option<Operator>,
    ctx: ExecContext,
    schema: SchemaRef,
    lease: Option<GenerationLease>,
    generation: GenerationId,
    rows: u64,
}

impl Cursor {
    pub(crate) fn new(
        root: Operator,
        ctx: ExecContext,
        schema: SchemaRef,
        lease: GenerationLease,
    ) -> Self {
        Self {
            root: Some(root),
            ctx,
            schema,
            generation: lease.generation(),
            lease: Some(lease),
            rows: 0,
        }
    }

    /// Pull the next non-empty batch; `None` once the result is complete.
    ///
    /// The cursor closes itself on the last batch and on any error.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            let Some(root) = self.root.as_mut() else {
                return Ok(None);
            };
            match root.next_batch(&self.ctx) {
                Ok(Some(batch)) if batch.num_rows() == 0 => continue,
                Ok(Some(batch)) => {
                    self.rows += batch.num_rows() as u64;
                    return Ok(Some(batch));
                }
                Ok(None) => {
                    self.close();
                    return Ok(None);
                }
                Err(e) => {
                    debug!(generation = self.generation, error = %e, "query failed");
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Release the operator tree and the generation lease
    pub fn close(&mut self) {
        if self.root.take().is_some() {
            debug!(generation = self.generation, rows = self.rows, "cursor closed");
        }
        self.lease = None;
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_none()
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    /// Cancelling this token fails the next pull with `Cancelled`
    pub fn token(&self) -> &CancellationToken {
        self.ctx.token()
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Drain the remaining result into rows
    pub fn collect_rows(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch()? {
            rows.extend(batch_to_rows(&batch));
        }
        Ok(rows)
    }
}

impl Iterator for Cursor {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("generation", &self.generation)
            .field("columns", &self.column_names())
            .field("rows", &self.rows)
            .field("closed", &self.is_closed())
            .finish()
    }
}
