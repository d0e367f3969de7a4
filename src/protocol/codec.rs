//! Message framing over a byte stream.
//!
//! Every connection carries one request and one reply. The request is read in
//! chunks of at most `frame_size` bytes. Plain commands are read until the
//! peer half-closes, up to a fixed command length. A `results` message
//! declares its payload length in its header, and the reader keeps pulling
//! chunks until exactly that many payload bytes are buffered, then stops.
//! Every read and write is bounded by the configured I/O timeout so a stalled
//! peer cannot pin a task forever.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{CiError, Result};
use crate::protocol::message::{parse_length, ProtocolError, Request, Response, RESULTS_PREFIX};

/// Default read chunk size.
pub const FRAME_SIZE: usize = 1024;

/// Longest `results:<commit>:<length>:` header we wait for.
const MAX_HEADER_LEN: usize = 512;

/// Most bytes thrown away from a rejected request before replying.
const DISCARD_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub frame_size: usize,
    pub max_payload_bytes: usize,
    pub io_timeout: Duration,
}

impl FrameLimits {
    /// Longest plain command accepted.
    fn command_limit(&self) -> usize {
        self.frame_size.max(MAX_HEADER_LEN)
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            max_payload_bytes: 16 * 1024 * 1024,
            io_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FrameStatus {
    Complete,
    /// Not a `results` message: keep reading until the peer closes.
    UntilEof,
    /// A `results` header has started but its length field is not visible yet.
    NeedHeader,
    /// The buffer must grow to this many bytes.
    NeedBytes(usize),
}

fn frame_status(buf: &[u8], limits: &FrameLimits) -> std::result::Result<FrameStatus, ProtocolError> {
    let offset = buf.len() - buf.trim_ascii_start().len();
    let message = &buf[offset..];
    let header_may_grow = buf.len() < limits.command_limit();

    // A partial "results:" prefix is read like any other command; the
    // results branch takes over once the prefix is complete.
    let Some(rest) = message.strip_prefix(RESULTS_PREFIX) else {
        if buf.len() > limits.command_limit() {
            return Err(ProtocolError::CommandTooLong {
                limit: limits.command_limit(),
            });
        }
        return Ok(FrameStatus::UntilEof);
    };

    let mut fields = rest.splitn(3, |b| *b == b':');
    let commit_id = fields.next().unwrap_or_default();
    let (Some(length), Some(_)) = (fields.next(), fields.next()) else {
        return Ok(if header_may_grow {
            FrameStatus::NeedHeader
        } else {
            FrameStatus::Complete
        });
    };
    // A bad length is reported by the decoder.
    let Ok(declared) = parse_length(length) else {
        return Ok(FrameStatus::Complete);
    };
    if declared > limits.max_payload_bytes {
        return Err(ProtocolError::PayloadTooLarge {
            declared,
            limit: limits.max_payload_bytes,
        });
    }

    let header_len = offset + RESULTS_PREFIX.len() + commit_id.len() + 1 + length.len() + 1;
    let needed = header_len + declared;
    if buf.len() >= needed {
        Ok(FrameStatus::Complete)
    } else {
        Ok(FrameStatus::NeedBytes(needed))
    }
}

async fn read_chunk<S>(stream: &mut S, chunk: &mut [u8], peer: &str, io_timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    match timeout(io_timeout, stream.read(chunk)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CiError::Timeout {
            operation: "read",
            peer: peer.to_string(),
        }),
    }
}

/// Swallow what the peer is still sending so our reply is not lost to a
/// reset. Stops at EOF, at [`DISCARD_LIMIT`] bytes or after one I/O timeout.
async fn discard_input<S>(stream: &mut S, chunk: &mut [u8], peer: &str, io_timeout: Duration)
where
    S: AsyncRead + Unpin,
{
    let mut discarded = 0;
    let drain = async {
        while discarded < DISCARD_LIMIT {
            match stream.read(chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
    };
    let _ = timeout(io_timeout, drain).await;
    tracing::debug!(peer, discarded, "Discarded rest of rejected request");
}

/// Read and decode one request.
///
/// Returns [`CiError::Protocol`] for malformed input; the caller answers with
/// [`ProtocolError::response`]. Transport failures are returned as-is.
pub async fn read_request<S>(stream: &mut S, peer: &str, limits: &FrameLimits) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(limits.frame_size);
    let mut chunk = vec![0u8; limits.frame_size];

    let mut read = read_chunk(stream, &mut chunk, peer, limits.io_timeout).await?;
    buf.extend_from_slice(&chunk[..read]);

    while read > 0 {
        let status = match frame_status(&buf, limits) {
            Ok(status) => status,
            Err(e) => {
                discard_input(stream, &mut chunk, peer, limits.io_timeout).await;
                return Err(e.into());
            }
        };
        let want = match status {
            FrameStatus::Complete => break,
            FrameStatus::UntilEof => (limits.command_limit() + 1 - buf.len()).min(limits.frame_size),
            FrameStatus::NeedHeader => limits.frame_size,
            FrameStatus::NeedBytes(needed) => (needed - buf.len()).min(limits.frame_size),
        };
        read = read_chunk(stream, &mut chunk[..want], peer, limits.io_timeout).await?;
        buf.extend_from_slice(&chunk[..read]);
        if read > 0 {
            tracing::trace!(peer, buffered = buf.len(), "Read overflow chunk");
        }
    }

    Ok(Request::decode(&buf)?)
}

/// Write a reply and close our side of the connection.
pub async fn write_response<S>(
    stream: &mut S,
    peer: &str,
    response: &Response,
    io_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_and_close(stream, peer, response.as_str().as_bytes(), io_timeout).await
}

pub(crate) async fn write_all_and_close<S>(
    stream: &mut S,
    peer: &str,
    bytes: &[u8],
    io_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(bytes).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match timeout(io_timeout, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CiError::Timeout {
            operation: "write",
            peer: peer.to_string(),
        }),
    }
}
