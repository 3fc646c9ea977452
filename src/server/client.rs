//! Simple client for the framed protocol

use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::protocol::{read_frame, write_frame, Request, Response, ResultPage};
use crate::error::{Error, Result};
use crate::storage::Value;

/// Rows and column names of a completed query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    /// Connect to a server, e.g. `127.0.0.1:7171`
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    async fn receive(&mut self) -> Result<Response> {
        read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| Error::Protocol("server closed the connection".to_string()))
    }

    /// Send a single-response request; an `Error` response becomes `Err`
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.writer, request).await?;
        self.receive().await?.into_result()
    }

    /// Run a query and collect every page
    pub async fn query(&mut self, text: &str, session: Option<&str>) -> Result<QueryResult> {
        let request = Request::Query {
            text: text.to_string(),
            session: session.map(str::to_string),
            timeout_ms: None,
        };
        write_frame(&mut self.writer, &request).await?;

        let mut rows = Vec::new();
        loop {
            match self.receive().await?.into_result()? {
                Response::Page(ResultPage { rows: page, .. }) => rows.extend(page),
                Response::End { columns, .. } => return Ok(QueryResult { columns, rows }),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected response to a query: {:?}",
                        other
                    )))
                }
            }
        }
    }
}
