//! Wire protocol
//!
//! Every message is a frame: a `u32` big-endian payload length followed by
//! the JSON encoding of a [`Request`] or [`Response`]. A request is answered
//! by one response, except `Query`, which is answered by zero or more `Page`
//! frames followed by `End` or `Error`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::batch::RowFailure;
use crate::catalog::{DatasetInfo, DatasetKeys, GenerationId, Schema};
use crate::error::{Error, ErrorInfo, Result};
use crate::storage::{Record, Value};

/// Largest frame either side accepts
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Client to server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    // ========== Admin ==========
    CreateDataset {
        name: String,
        schema: Schema,
        #[serde(default)]
        keys: DatasetKeys,
    },
    DropDataset {
        name: String,
    },
    DescribeDataset {
        name: String,
    },
    ListDatasets,

    // ========== Put ==========
    Put {
        dataset: String,
        records: Vec<Record>,
        #[serde(default)]
        session: Option<String>,
    },
    Flush {
        session: String,
    },

    // ========== Get ==========
    Get {
        dataset: String,
        key: Vec<Value>,
        #[serde(default)]
        session: Option<String>,
    },

    // ========== Query ==========
    Query {
        text: String,
        #[serde(default)]
        session: Option<String>,
        /// Overrides the server's default deadline
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Explain {
        text: String,
    },
}

/// Result of a Put
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Sequence number of the write; None while rows are only buffered
    pub seq: Option<u64>,
    pub accepted: usize,
    /// Rows rejected by validation, by index in the request
    pub failures: Vec<RowFailure>,
}

/// One streamed page of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Server to client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Created {
        dataset: String,
        generation: GenerationId,
    },
    Dropped {
        dataset: String,
        generation: GenerationId,
    },
    Described {
        info: DatasetInfo,
    },
    Datasets {
        names: Vec<String>,
    },
    Put(PutResponse),
    Flushed {
        seq: Option<u64>,
    },
    Row {
        values: Vec<Value>,
    },
    Page(ResultPage),
    End {
        columns: Vec<String>,
        rows: u64,
    },
    Explained {
        plan: String,
    },
    Error(ErrorInfo),
}

impl Response {
    /// Turn an `Error` response back into an error
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error(info) => Err(Error::Remote(info)),
            other => Ok(other),
        }
    }
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES as usize {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; None on a clean end of stream between frames
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::Query {
            text: "select * from events".to_string(),
            session: None,
            timeout_ms: Some(50),
        };
        write_frame(&mut client, &request).await.unwrap();
        drop(client);

        let received: Option<Request> = read_frame(&mut server).await.unwrap();
        assert_eq!(received, Some(request));
        let end: Option<Request> = read_frame(&mut server).await.unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_request_json_shape() {
        let json = r#"{"type":"put","dataset":"events","records":[{"id":1,"payload":"a"}]}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::Put {
                dataset,
                records,
                session,
            } => {
                assert_eq!(dataset, "events");
                assert_eq!(records[0]["id"], Value::Int64(1));
                assert_eq!(session, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = client.write_u32(MAX_FRAME_BYTES + 1).await;
        });
        let err = read_frame::<_, Request>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_error_response_round_trips_as_error() {
        let response = Response::Error(Error::DatasetNotFound("x".into()).to_info());
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
