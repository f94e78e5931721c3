use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::transport::codec::{FrameCodec, MAX_FRAME_SIZE};
use crate::transport::{Connection, Dialer};

/// Default timeout for establishing a TCP connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`TcpConnection`]s.
///
/// # Example
///
/// ```no_run
/// use proxyrpc_common::transport::{Dialer, TcpDialer};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dialer = TcpDialer::new().with_connect_timeout(Duration::from_secs(1));
/// let conn = dialer.dial("127.0.0.1:9013").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let dial_error = |message: String| RpcError::Dial {
            address: address.to_string(),
            message,
        };

        let socket_addrs = tokio::net::lookup_host(address)
            .await
            .map_err(|e| dial_error(format!("invalid address: {}", e)))?;

        // Try each resolved address until one succeeds
        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => {
                    last_err = Some(format!(
                        "connect timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                }
            }
        }

        Err(dial_error(
            last_err.unwrap_or_else(|| "address resolved to nothing".to_string()),
        ))
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let stream = self.connect(address).await?;
        tracing::debug!(address = %address, "connection established");
        Ok(Arc::new(TcpConnection::new(address, stream)))
    }
}

/// A TCP connection carrying one request/response exchange at a time.
///
/// A connection whose I/O failed, or whose exchange was abandoned halfway (the caller's
/// future was dropped), can no longer be trusted to be in sync with the peer and reports
/// itself closed.
pub struct TcpConnection {
    address: String,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn new(address: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            address: address.into(),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        }
    }

    fn closed_error(&self) -> RpcError {
        RpcError::Transport(format!("connection to {} is closed", self.address))
    }
}

/// Marks the connection broken unless the exchange ran to completion.
struct ExchangeGuard<'a> {
    closed: &'a AtomicBool,
    completed: bool,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, request: RpcRequest) -> Result<RpcResponse> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let frame = FrameCodec::encode_request(&request)?;

        let mut stream = self.stream.lock().await;
        let stream = match stream.as_mut() {
            Some(stream) if !self.is_closed() => stream,
            _ => return Err(self.closed_error()),
        };

        let mut guard = ExchangeGuard {
            closed: &self.closed,
            completed: false,
        };

        write_frame(stream, &frame).await?;
        let data = read_frame(stream).await?;
        let response = FrameCodec::decode_response(&data)?;
        if response.request_id != request.request_id {
            return Err(RpcError::Protocol(format!(
                "response id {} does not match request id {}",
                response.request_id, request.request_id
            )));
        }

        guard.completed = true;
        Ok(response)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // An exchange in flight owns the stream; it fails on its own once the flag is seen.
        if let Ok(mut stream) = self.stream.try_lock() {
            if let Some(mut stream) = stream.take() {
                let _ = stream.shutdown().await;
            }
        }
        tracing::debug!(address = %self.address, "connection closed");
    }
}

/// Writes a frame with its length prefix.
///
/// Wire format: `[4-byte length as u32 big-endian] + [frame body]`
///
/// # Arguments
///
/// * `stream` - The stream to write to
/// * `data` - The encoded frame body
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;

    stream
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;

    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads a length-prefixed frame.
///
/// # Errors
///
/// Returns an error if:
/// - Reading the length prefix fails
/// - The frame exceeds the maximum size (100 MB)
/// - Reading the frame body fails
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| map_io_error(e, "reading length prefix"))?;

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(RpcError::Protocol(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame"))?;

    Ok(buf)
}

fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => {
            RpcError::Transport(format!("{}: connection lost", context))
        }
        _ => RpcError::Transport(format!("{}: {}", context, err)),
    }
}
