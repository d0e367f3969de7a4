//! The colon-delimited command protocol spoken between observer, dispatcher
//! and runners.
//!
//! - [`message`]: request/reply grammar and protocol errors
//! - [`codec`]: chunked reads with length-prefixed `results` overflow
//! - [`client`]: one-shot request/reply helper

pub mod client;
pub mod codec;
pub mod message;

pub use client::{communicate, expect_reply};
pub use codec::{read_request, write_response, FrameLimits, FRAME_SIZE};
pub use message::{ProtocolError, Request, Response};
