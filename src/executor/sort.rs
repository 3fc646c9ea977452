//! Sort operator with a memory ceiling
//!
//! Input batches are buffered until the ceiling. Past it the query either
//! fails with `ResourceExhausted` or, with spilling enabled, the buffer is
//! sorted into a run, written as an Arrow IPC stream to a temporary file and
//! released. Runs are merged at the end with a k-way merge over the Arrow row
//! format.
//!
//! Ties keep input order: the in-memory sort carries the input position as a
//! last key and the merge prefers earlier runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::compute::{
    concat_batches, interleave, lexsort_to_indices, take_record_batch, SortColumn, SortOptions,
};
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, Rows, SortField};
use tracing::debug;

use super::context::{ExecContext, ExecOptions};
use super::operators::Operator;
use super::plan::SortKey;
use crate::batch::convert::batch_with_rows;
use crate::error::{Error, Result};

fn sort_options(key: &SortKey) -> SortOptions {
    SortOptions {
        descending: !key.ascending,
        nulls_first: key.ascending,
    }
}

pub struct SortOp {
    input: Option<Box<Operator>>,
    keys: Vec<SortKey>,
    schema: SchemaRef,
    output: Option<SortOutput>,
}

enum SortOutput {
    Memory { batch: RecordBatch, offset: usize },
    Merge(SpillMerge),
}

impl SortOp {
    pub fn new(input: Operator, keys: Vec<SortKey>, schema: SchemaRef) -> Self {
        Self {
            input: Some(Box::new(input)),
            keys,
            schema,
            output: None,
        }
    }

    pub fn next_batch(&mut self, ctx: &ExecContext) -> Result<Option<RecordBatch>> {
        if self.output.is_none() {
            self.output = Some(self.consume(ctx)?);
        }
        let batch_rows = ctx.options().batch_rows;
        match self.output.as_mut() {
            Some(SortOutput::Memory { batch, offset }) => {
                if *offset >= batch.num_rows() {
                    return Ok(None);
                }
                let len = batch_rows.min(batch.num_rows() - *offset);
                let out = batch.slice(*offset, len);
                *offset += len;
                Ok(Some(out))
            }
            Some(SortOutput::Merge(merge)) => merge.next_batch(batch_rows),
            None => Ok(None),
        }
    }

    /// Drain the input, spilling sorted runs past the memory ceiling
    fn consume(&mut self, ctx: &ExecContext) -> Result<SortOutput> {
        let options = ctx.options().clone();
        let mut input = match self.input.take() {
            Some(input) => input,
            None => return Err(Error::Internal("sort input consumed twice".to_string())),
        };

        let mut buffered: Vec<RecordBatch> = Vec::new();
        let mut bytes = 0usize;
        let mut runs: Vec<File> = Vec::new();

        while let Some(batch) = input.next_batch(ctx)? {
            bytes += batch.get_array_memory_size();
            buffered.push(batch);
            if bytes > options.memory_limit {
                if !options.spill_enabled {
                    return Err(Error::ResourceExhausted {
                        resource: "sort memory".to_string(),
                        limit: options.memory_limit,
                    });
                }
                let run = sort_batches(&self.schema, &buffered, &self.keys)?;
                buffered.clear();
                bytes = 0;
                runs.push(write_run(&run, &options)?);
            }
        }
        drop(input);

        let sorted = sort_batches(&self.schema, &buffered, &self.keys)?;
        drop(buffered);
        if runs.is_empty() {
            return Ok(SortOutput::Memory {
                batch: sorted,
                offset: 0,
            });
        }
        if sorted.num_rows() > 0 {
            runs.push(write_run(&sorted, &options)?);
        }
        debug!(runs = runs.len(), "merging spilled sort runs");
        Ok(SortOutput::Merge(SpillMerge::new(
            runs,
            &self.keys,
            self.schema.clone(),
        )?))
    }
}

/// Sort batches into one batch; ties keep input order
pub fn sort_batches(schema: &SchemaRef, batches: &[RecordBatch], keys: &[SortKey]) -> Result<RecordBatch> {
    let batch = concat_batches(schema, batches)?;
    let rows = batch.num_rows();
    if rows <= 1 {
        return Ok(batch);
    }

    let mut columns: Vec<SortColumn> = keys
        .iter()
        .map(|k| SortColumn {
            values: batch.column(k.index).clone(),
            options: Some(sort_options(k)),
        })
        .collect();
    columns.push(SortColumn {
        values: Arc::new(UInt64Array::from_iter_values(0..rows as u64)),
        options: None,
    });
    let indices = lexsort_to_indices(&columns, None)?;
    Ok(take_record_batch(&batch, &indices)?)
}

fn write_run(batch: &RecordBatch, options: &ExecOptions) -> Result<File> {
    let file = match &options.spill_dir {
        Some(dir) => tempfile::tempfile_in(dir)?,
        None => tempfile::tempfile()?,
    };
    let mut writer = StreamWriter::try_new(BufWriter::new(file), &batch.schema())?;
    let mut offset = 0;
    while offset < batch.num_rows() {
        let len = options.batch_rows.min(batch.num_rows() - offset);
        writer.write(&batch.slice(offset, len))?;
        offset += len;
    }
    writer.finish()?;
    let mut file = writer
        .into_inner()?
        .into_inner()
        .map_err(|e| Error::IoError(e.into_error()))?;
    file.rewind()?;
    debug!(rows = batch.num_rows(), "spilled sort run");
    Ok(file)
}

struct MergeCursor {
    reader: StreamReader<BufReader<File>>,
    batch: RecordBatch,
    rows: Rows,
    pos: usize,
}

/// K-way merge over sorted spill runs
struct SpillMerge {
    converter: RowConverter,
    key_indices: Vec<usize>,
    schema: SchemaRef,
    cursors: Vec<MergeCursor>,
    heap: BinaryHeap<Reverse<(OwnedRow, usize)>>,
}

impl SpillMerge {
    fn new(runs: Vec<File>, keys: &[SortKey], schema: SchemaRef) -> Result<Self> {
        let fields = keys
            .iter()
            .map(|k| {
                SortField::new_with_options(
                    schema.field(k.index).data_type().clone(),
                    sort_options(k),
                )
            })
            .collect();
        let mut merge = Self {
            converter: RowConverter::new(fields)?,
            key_indices: keys.iter().map(|k| k.index).collect(),
            schema,
            cursors: Vec::with_capacity(runs.len()),
            heap: BinaryHeap::new(),
        };
        for file in runs {
            let mut reader = StreamReader::try_new(BufReader::new(file), None)?;
            if let Some(batch) = next_nonempty(&mut reader)? {
                let rows = merge.convert(&batch)?;
                let run = merge.cursors.len();
                merge.heap.push(Reverse((rows.row(0).owned(), run)));
                merge.cursors.push(MergeCursor {
                    reader,
                    batch,
                    rows,
                    pos: 0,
                });
            }
        }
        Ok(merge)
    }

    fn convert(&self, batch: &RecordBatch) -> Result<Rows> {
        let columns: Vec<ArrayRef> = self
            .key_indices
            .iter()
            .map(|&i| batch.column(i).clone())
            .collect();
        Ok(self.converter.convert_columns(&columns)?)
    }

    /// Emit up to `max_rows` merged rows. Stops early when a run's current
    /// batch runs out, since output rows still point into it.
    fn next_batch(&mut self, max_rows: usize) -> Result<Option<RecordBatch>> {
        let mut indices: Vec<(usize, usize)> = Vec::new();
        let mut drained = None;
        while indices.len() < max_rows {
            let Some(Reverse((_, run))) = self.heap.pop() else {
                break;
            };
            let cursor = &mut self.cursors[run];
            indices.push((run, cursor.pos));
            cursor.pos += 1;
            if cursor.pos < cursor.batch.num_rows() {
                self.heap
                    .push(Reverse((cursor.rows.row(cursor.pos).owned(), run)));
            } else {
                drained = Some(run);
                break;
            }
        }
        if indices.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for c in 0..self.schema.fields().len() {
            let arrays: Vec<&dyn Array> = self
                .cursors
                .iter()
                .map(|cur| cur.batch.column(c).as_ref())
                .collect();
            columns.push(interleave(&arrays, &indices)?);
        }
        let out = batch_with_rows(self.schema.clone(), columns, indices.len())?;

        if let Some(run) = drained {
            self.advance(run)?;
        }
        Ok(Some(out))
    }

    fn advance(&mut self, run: usize) -> Result<()> {
        let next = next_nonempty(&mut self.cursors[run].reader)?;
        if let Some(batch) = next {
            let rows = self.convert(&batch)?;
            self.heap.push(Reverse((rows.row(0).owned(), run)));
            let cursor = &mut self.cursors[run];
            cursor.batch = batch;
            cursor.rows = rows;
            cursor.pos = 0;
        }
        Ok(())
    }
}

fn next_nonempty(reader: &mut StreamReader<BufReader<File>>) -> Result<Option<RecordBatch>> {
    for batch in reader.by_ref() {
        let batch = batch?;
        if batch.num_rows() > 0 {
            return Ok(Some(batch));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::convert::{batch_to_rows, rows_to_batch};
    use crate::executor::operators::ValuesOp;
    use crate::storage::Value;
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("tag", DataType::Utf8, true),
        ]))
    }

    fn input(n: i64) -> Vec<RecordBatch> {
        // keys cycle 0..10 so there are many ties
        (0..n)
            .collect::<Vec<_>>()
            .chunks(7)
            .map(|chunk| {
                let rows: Vec<Vec<Value>> = chunk
                    .iter()
                    .map(|i| vec![Value::Int64((i * 7) % 10), Value::String(format!("r{}", i))])
                    .collect();
                rows_to_batch(schema(), &rows).unwrap()
            })
            .collect()
    }

    fn key(ascending: bool) -> Vec<SortKey> {
        vec![SortKey {
            index: 0,
            name: "k".to_string(),
            ascending,
        }]
    }

    fn run(options: ExecOptions, ascending: bool) -> Result<Vec<Vec<Value>>> {
        let ctx = ExecContext::new(options);
        let mut op = SortOp::new(
            Operator::Values(ValuesOp::new(input(100))),
            key(ascending),
            schema(),
        );
        let mut rows = Vec::new();
        while let Some(batch) = op.next_batch(&ctx)? {
            rows.extend(batch_to_rows(&batch));
        }
        Ok(rows)
    }

    fn expected(ascending: bool) -> Vec<Vec<Value>> {
        let mut all: Vec<Vec<Value>> = input(100).iter().flat_map(batch_to_rows).collect();
        all.sort_by(|a, b| {
            let ord = a[0].compare(&b[0]).unwrap();
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        all
    }

    #[test]
    fn test_in_memory_sort_is_stable() {
        let rows = run(ExecOptions::default(), true).unwrap();
        assert_eq!(rows, expected(true));
        let rows = run(ExecOptions::default(), false).unwrap();
        assert_eq!(rows, expected(false));
    }

    #[test]
    fn test_ceiling_without_spill_is_resource_exhausted() {
        let options = ExecOptions {
            memory_limit: 64,
            spill_enabled: false,
            ..ExecOptions::default()
        };
        match run(options, true) {
            Err(Error::ResourceExhausted { limit, .. }) => assert_eq!(limit, 64),
            other => panic!("unexpected {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_spilled_merge_matches_in_memory_sort() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = ExecOptions {
            memory_limit: 64,
            spill_enabled: true,
            spill_dir: Some(dir.path().to_path_buf()),
            batch_rows: 9,
        };
        assert_eq!(run(options.clone(), true).unwrap(), expected(true));
        assert_eq!(run(options, false).unwrap(), expected(false));
    }

    #[test]
    fn test_nulls_sort_first_ascending() {
        let rows = vec![
            vec![Value::Int64(2), Value::Null],
            vec![Value::Null, Value::Null],
            vec![Value::Int64(1), Value::Null],
        ];
        let batch = rows_to_batch(schema(), &rows).unwrap();
        let sorted = sort_batches(&schema(), &[batch], &key(true)).unwrap();
        let keys: Vec<Value> = batch_to_rows(&sorted).into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(keys, vec![Value::Null, Value::Int64(1), Value::Int64(2)]);
    }
}
