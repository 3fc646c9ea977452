//! Dataset service
//!
//! Transport-agnostic async endpoints over a [`Database`]. Admin calls are
//! serialized on one lane. Put, Get and Query share a bounded worker pool
//! and run their blocking work off the async runtime.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use futures::Stream;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use super::protocol::{PutResponse, Request, Response, ResultPage};
use crate::batch::convert::batch_to_rows;
use crate::catalog::{DatasetInfo, DatasetKeys, GenerationId, Schema};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::storage::{Record, Value};

/// Result pages buffered between the executor and a slow consumer
const QUERY_CHANNEL_PAGES: usize = 4;

pub struct DatasetService {
    db: Arc<Database>,
    /// The admin lane
    admin: Mutex<()>,
    workers: Arc<Semaphore>,
    page_rows: usize,
}

impl DatasetService {
    pub fn new(db: Arc<Database>) -> Self {
        let workers = db.config().worker_threads.max(1);
        let page_rows = db.config().page_rows.max(1);
        Self {
            db,
            admin: Mutex::new(()),
            workers: Arc::new(Semaphore::new(workers)),
            page_rows,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run on the admin lane; admin calls never interleave
    async fn admin<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _lane = self.admin.lock().await;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Internal(format!("admin task failed: {}", e)))?
    }

    /// Run on the worker pool
    async fn work<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Internal(format!("worker task failed: {}", e)))?
    }

    // ========== Admin ==========

    pub async fn create_dataset(
        &self,
        name: String,
        schema: Schema,
        keys: DatasetKeys,
    ) -> Result<GenerationId> {
        self.admin(move |db| Ok(db.create_dataset(&name, schema, keys)?.generation))
            .await
    }

    pub async fn drop_dataset(&self, name: String) -> Result<GenerationId> {
        self.admin(move |db| db.drop_dataset(&name)).await
    }

    pub async fn describe_dataset(&self, name: String) -> Result<DatasetInfo> {
        self.admin(move |db| db.describe_dataset(&name)).await
    }

    pub async fn list_datasets(&self) -> Result<Vec<String>> {
        self.admin(|db| Ok(db.list_datasets())).await
    }

    // ========== Put / Get ==========

    pub async fn put(
        &self,
        dataset: String,
        records: Vec<Record>,
        session: Option<String>,
    ) -> Result<PutResponse> {
        self.work(move |db| {
            let outcome = db.put(&dataset, records, session.as_deref())?;
            Ok(PutResponse {
                seq: outcome.seq(),
                accepted: outcome.accepted,
                failures: outcome.failures,
            })
        })
        .await
    }

    pub async fn flush(&self, session: String) -> Result<Option<u64>> {
        self.work(move |db| db.flush(&session)).await
    }

    pub async fn get(
        &self,
        dataset: String,
        key: Vec<Value>,
        session: Option<String>,
    ) -> Result<Vec<Value>> {
        self.work(move |db| db.get(&dataset, &key, session.as_deref()))
            .await
    }

    // ========== Query ==========

    pub async fn explain(&self, text: String) -> Result<String> {
        self.work(move |db| db.explain(&text)).await
    }

    /// Compile and start a query.
    ///
    /// Compile errors are returned here. The worker permit, the cursor and its
    /// snapshot are held until the stream ends or is dropped.
    pub async fn query(
        &self,
        text: String,
        session: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<QueryStream> {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;

        let token = CancellationToken::new();
        let mut ctx = self.db.context().with_token(token.clone());
        if timeout.is_some() {
            ctx = ctx.with_timeout(timeout);
        }
        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_PAGES);
        let (ready_tx, ready_rx) = oneshot::channel();
        let db = self.db.clone();
        let page_rows = self.page_rows;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut cursor = match db.query_with(&text, session.as_deref(), ctx) {
                Ok(cursor) => cursor,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let columns = cursor.column_names();
            if ready_tx.send(Ok(columns.clone())).is_err() {
                return;
            }
            loop {
                match cursor.next_batch() {
                    Ok(Some(batch)) => {
                        if !send_pages(&tx, &columns, &batch, page_rows) {
                            debug!(generation = cursor.generation(), "query stream closed by consumer");
                            cursor.token().cancel();
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            cursor.close();
        });

        let columns = ready_rx
            .await
            .map_err(|_| Error::Internal("query task ended before starting".to_string()))??;
        Ok(QueryStream {
            columns,
            pages: ReceiverStream::new(rx),
            _cancel: token.drop_guard(),
        })
    }

    /// Answer a single-response request
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::CreateDataset { name, schema, keys } => self
                .create_dataset(name.clone(), schema, keys)
                .await
                .map(|generation| Response::Created {
                    dataset: name,
                    generation,
                }),
            Request::DropDataset { name } => {
                self.drop_dataset(name.clone())
                    .await
                    .map(|generation| Response::Dropped {
                        dataset: name,
                        generation,
                    })
            }
            Request::DescribeDataset { name } => self
                .describe_dataset(name)
                .await
                .map(|info| Response::Described { info }),
            Request::ListDatasets => self
                .list_datasets()
                .await
                .map(|names| Response::Datasets { names }),
            Request::Put {
                dataset,
                records,
                session,
            } => self.put(dataset, records, session).await.map(Response::Put),
            Request::Flush { session } => self
                .flush(session)
                .await
                .map(|seq| Response::Flushed { seq }),
            Request::Get {
                dataset,
                key,
                session,
            } => self
                .get(dataset, key, session)
                .await
                .map(|values| Response::Row { values }),
            Request::Explain { text } => self
                .explain(text)
                .await
                .map(|plan| Response::Explained { plan }),
            Request::Query { .. } => Err(Error::Protocol(
                "queries are streamed, not answered with one response".to_string(),
            )),
        };
        result.unwrap_or_else(|e| {
            info!(kind = %e.kind(), error = %e, "request failed");
            Response::Error(e.to_info())
        })
    }
}

/// Split a batch into pages; false once the consumer is gone
fn send_pages(
    tx: &mpsc::Sender<Result<ResultPage>>,
    columns: &[String],
    batch: &RecordBatch,
    page_rows: usize,
) -> bool {
    let mut offset = 0;
    while offset < batch.num_rows() {
        let len = page_rows.min(batch.num_rows() - offset);
        let page = ResultPage {
            columns: columns.to_vec(),
            rows: batch_to_rows(&batch.slice(offset, len)),
        };
        if tx.blocking_send(Ok(page)).is_err() {
            return false;
        }
        offset += len;
    }
    true
}

/// Pages of one running query.
///
/// Dropping the stream cancels the query; the executor stops at its next
/// batch boundary and releases the cursor with its snapshot and lease.
pub struct QueryStream {
    columns: Vec<String>,
    pages: ReceiverStream<Result<ResultPage>>,
    _cancel: DropGuard,
}

impl QueryStream {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Stream for QueryStream {
    type Item = Result<ResultPage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.pages).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType};
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> DatasetService {
        let config = EngineConfig::new(dir.path()).worker_threads(2).page_rows(10);
        DatasetService::new(Arc::new(Database::open(config).unwrap()))
    }

    fn schema() -> Schema {
        Schema::from_columns(vec![
            Column::new("id", ColumnType::Int64).nullable(false),
            Column::new("payload", ColumnType::String),
        ])
    }

    fn record(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), Value::Int64(id));
        r.insert("payload".into(), Value::String(format!("p{}", id)));
        r
    }

    #[tokio::test]
    async fn test_query_streams_pages() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service
            .create_dataset("events".into(), schema(), DatasetKeys::partition(["id"]))
            .await
            .unwrap();
        let put = service
            .put("events".into(), (0..25).map(record).collect(), None)
            .await
            .unwrap();
        assert_eq!(put.accepted, 25);
        assert!(put.seq.is_some());

        let stream = service
            .query("select id from events".into(), None, None)
            .await
            .unwrap();
        assert_eq!(stream.columns(), ["id".to_string()]);
        let pages: Vec<ResultPage> = stream.map(|p| p.unwrap()).collect().await;
        assert_eq!(pages.len(), 3);
        let total: usize = pages.iter().map(|p| p.rows.len()).sum();
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn test_compile_errors_surface_before_streaming() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service
            .create_dataset("events".into(), schema(), DatasetKeys::default())
            .await
            .unwrap();
        let err = service
            .query("select nope from events".into(), None, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SemanticError);
        let err = service
            .query("select id events".into(), None, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
    }

    #[tokio::test]
    async fn test_handle_maps_errors_to_info() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let response = service
            .handle(Request::DropDataset {
                name: "missing".into(),
            })
            .await;
        match response {
            Response::Error(info) => {
                assert_eq!(info.kind, ErrorKind::NotFound);
                assert_eq!(info.detail, Some(serde_json::json!({ "dataset": "missing" })));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
