//! IPC client implementation

use serde::de::DeserializeOwned;
use std::path::Path;
use tenrol_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::{IpcError, IpcResult};

/// Reads one NDJSON frame at a time, skipping blank lines
struct LineReader {
    inner: BufReader<OwnedReadHalf>,
    buf: String,
}

impl LineReader {
    async fn next<T: DeserializeOwned>(&mut self) -> IpcResult<T> {
        loop {
            self.buf.clear();
            if self.inner.read_line(&mut self.buf).await? == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            let line = self.buf.trim();
            if !line.is_empty() {
                return Ok(serde_json::from_str(line)?);
            }
        }
    }
}

/// Connection to tenrold
pub struct IpcClient {
    reader: LineReader,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let (read_half, writer) = UnixStream::connect(socket_path).await?.into_split();

        Ok(Self {
            reader: LineReader {
                inner: BufReader::new(read_half),
                buf: String::new(),
            },
            writer,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut json = serde_json::to_string(&Request::new(request_id, command))?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;

        let response: Response = self.reader.next().await?;

        // Rejections of unparseable lines carry id 0
        if response.request_id != request_id && response.request_id != 0 {
            return Err(IpcError::ServerError(format!(
                "response for request {} while waiting for {}",
                response.request_id, request_id
            )));
        }

        Ok(response)
    }

    /// Send a command, turning an error response into [`IpcError::Rejected`]
    pub async fn call(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::Rejected {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// Subscribe and turn this connection into an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        self.call(Command::SubscribeEvents).await?;

        Ok(EventStream {
            reader: self.reader,
        })
    }
}

/// Broadcast events from tenrold
pub struct EventStream {
    reader: LineReader,
}

impl EventStream {
    pub async fn next(&mut self) -> IpcResult<Event> {
        self.reader.next().await
    }
}
