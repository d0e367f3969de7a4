use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{CiError, Result};
use crate::protocol::codec::write_all_and_close;
use crate::protocol::message::{Request, Response};

/// Replies are single words or short phrases.
const MAX_REPLY_LEN: u64 = 4096;

/// Send one request to `addr` and wait for its reply.
///
/// Opens a fresh connection, writes the encoded request, half-closes the
/// connection and reads until the peer closes. Connecting, writing and reading
/// are each bounded by `io_timeout`.
pub async fn communicate(addr: &str, request: &Request, io_timeout: Duration) -> Result<Response> {
    let mut stream = match timeout(io_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(CiError::Timeout {
                operation: "connect",
                peer: addr.to_string(),
            })
        }
    };

    write_all_and_close(&mut stream, addr, &request.encode(), io_timeout).await?;

    let mut reply = Vec::new();
    let mut limited = (&mut stream).take(MAX_REPLY_LEN);
    let read = limited.read_to_end(&mut reply);
    match timeout(io_timeout, read).await {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            return Err(CiError::Timeout {
                operation: "read reply",
                peer: addr.to_string(),
            })
        }
    }

    let response = Response::parse(&String::from_utf8_lossy(&reply));
    tracing::trace!(peer = addr, command = request.name(), reply = %response, "Exchange complete");
    Ok(response)
}

/// Like [`communicate`], but any reply other than `expected` is an error.
pub async fn expect_reply(
    addr: &str,
    request: &Request,
    expected: Response,
    io_timeout: Duration,
) -> Result<()> {
    let response = communicate(addr, request, io_timeout).await?;
    if response == expected {
        Ok(())
    } else {
        Err(CiError::UnexpectedReply {
            peer: addr.to_string(),
            expected: expected.to_string(),
            got: response.to_string(),
        })
    }
}
