//! TCP Server for GrooveDB
//!
//! This module implements the network boundary: a tokio listener speaking the
//! framed JSON protocol of [`protocol`], dispatching into a [`DatasetService`].

pub mod client;
pub mod protocol;
pub mod service;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub use client::Client;
pub use protocol::{PutResponse, Request, Response, ResultPage};
pub use service::{DatasetService, QueryStream};

use crate::error::{Error, Result};
use protocol::{read_frame, write_frame};

/// Default server port
pub const DEFAULT_PORT: u16 = 7171;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_connections: 100,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host address
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection limit
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    /// Get the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// GrooveDB TCP Server
pub struct Server {
    config: ServerConfig,
    service: Arc<DatasetService>,
    connections: Arc<Semaphore>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig, service: Arc<DatasetService>) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            service,
            connections,
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.bind_address()).await?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!(address = %listener.local_addr()?, "GrooveDB server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let permit = match self.connections.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "connection limit reached; refusing");
                            continue;
                        }
                    };
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        debug!(%peer, "client connected");
                        if let Err(e) = handle_connection(stream, service).await {
                            warn!(%peer, error = %e, "connection error");
                        }
                        debug!(%peer, "client disconnected");
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping new connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = self.bind().await?;
        self.run_until(listener, shutdown).await
    }
}

/// Serve one client connection until it disconnects
async fn handle_connection(stream: TcpStream, service: Arc<DatasetService>) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    serve(BufReader::new(reader), BufWriter::new(writer), &service).await
}

/// Request loop over any byte stream
pub async fn serve<R, W>(mut reader: R, mut writer: W, service: &DatasetService) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_frame::<_, Request>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e @ Error::Protocol(_)) => {
                // framing may be lost; report and hang up
                write_frame(&mut writer, &Response::Error(e.to_info())).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match request {
            Request::Query {
                text,
                session,
                timeout_ms,
            } => {
                let timeout = timeout_ms.map(Duration::from_millis);
                stream_query(&mut writer, service, text, session, timeout).await?;
            }
            other => {
                let response = service.handle(other).await;
                write_frame(&mut writer, &response).await?;
            }
        }
    }
}

/// Send the pages of one query, then `End` or `Error`.
///
/// A failed write drops the stream, which cancels the query.
async fn stream_query<W>(
    writer: &mut W,
    service: &DatasetService,
    text: String,
    session: Option<String>,
    timeout: Option<Duration>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = match service.query(text, session, timeout).await {
        Ok(stream) => stream,
        Err(e) => return write_frame(writer, &Response::Error(e.to_info())).await,
    };
    let columns = stream.columns().to_vec();
    let mut rows = 0u64;
    while let Some(page) = stream.next().await {
        match page {
            Ok(page) => {
                rows += page.rows.len() as u64;
                write_frame(writer, &Response::Page(page)).await?;
            }
            Err(e) => return write_frame(writer, &Response::Error(e.to_info())).await,
        }
    }
    write_frame(writer, &Response::End { columns, rows }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new().host("0.0.0.0").port(5500).max_connections(0);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5500);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.bind_address(), "0.0.0.0:5500");
    }
}
