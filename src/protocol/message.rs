use std::fmt;

use thiserror::Error;

const STATUS: &str = "status";
const REGISTER: &str = "register";
const DISPATCH: &str = "dispatch";
const RESULTS: &str = "results";
const PING: &str = "ping";
const RUNTEST: &str = "runtest";

pub(crate) const RESULTS_PREFIX: &[u8] = b"results:";

/// A decoded inbound message.
///
/// The dispatcher serves `Status`, `Register`, `Dispatch` and `Results`;
/// a runner serves `Ping` and `RunTest`. Anything that does not decode is a
/// [`ProtocolError`], which carries the reply the peer should get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Status,
    Register { host: String, port: u16 },
    Dispatch { commit_id: String },
    Results { commit_id: String, payload: Vec<u8> },
    Ping,
    RunTest { commit_id: String },
}

impl Request {
    /// Wire name of the command, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Status => STATUS,
            Request::Register { .. } => REGISTER,
            Request::Dispatch { .. } => DISPATCH,
            Request::Results { .. } => RESULTS,
            Request::Ping => PING,
            Request::RunTest { .. } => RUNTEST,
        }
    }

    /// Decode one complete message.
    ///
    /// Leading and trailing whitespace is ignored, except that a `results`
    /// payload is taken as exactly the declared number of bytes following the
    /// header; bytes past the declared length are dropped.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let raw = raw.trim_ascii_start();
        if let Some(rest) = raw.strip_prefix(RESULTS_PREFIX) {
            return decode_results(rest);
        }
        let raw = raw.trim_ascii_end();
        if raw.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let text = String::from_utf8_lossy(raw);
        let (command, rest) = match text.split_once(':') {
            Some((command, rest)) => (command, Some(rest)),
            None => (text.as_ref(), None),
        };

        match command {
            STATUS => Ok(Request::Status),
            PING => Ok(Request::Ping),
            REGISTER => decode_register(rest.unwrap_or_default()),
            DISPATCH => Ok(Request::Dispatch {
                commit_id: commit_id_field(DISPATCH, rest)?,
            }),
            RUNTEST => Ok(Request::RunTest {
                commit_id: commit_id_field(RUNTEST, rest)?,
            }),
            RESULTS => Err(ProtocolError::MalformedResults(
                "missing commit id and length".to_string(),
            )),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Status => STATUS.as_bytes().to_vec(),
            Request::Ping => PING.as_bytes().to_vec(),
            Request::Register { host, port } => format!("{REGISTER}:{host}:{port}").into_bytes(),
            Request::Dispatch { commit_id } => format!("{DISPATCH}:{commit_id}").into_bytes(),
            Request::RunTest { commit_id } => format!("{RUNTEST}:{commit_id}").into_bytes(),
            Request::Results { commit_id, payload } => {
                let mut out = format!("{RESULTS}:{commit_id}:{}:", payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out
            }
        }
    }
}

fn decode_register(rest: &str) -> Result<Request, ProtocolError> {
    let invalid = || ProtocolError::InvalidAddress(rest.to_string());
    let mut fields = rest.split(':');
    let (Some(host), Some(port), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(invalid());
    };
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(Request::Register {
            host: host.to_string(),
            port,
        }),
        _ => Err(invalid()),
    }
}

fn commit_id_field(command: &'static str, rest: Option<&str>) -> Result<String, ProtocolError> {
    let commit_id = rest.unwrap_or_default();
    validate_commit_id(command, commit_id)?;
    Ok(commit_id.to_string())
}

fn decode_results(rest: &[u8]) -> Result<Request, ProtocolError> {
    let mut fields = rest.splitn(3, |b| *b == b':');
    let commit_id = fields.next().unwrap_or_default();
    let declared = fields.next();
    let payload = fields.next().unwrap_or_default();

    let commit_id = std::str::from_utf8(commit_id)
        .map_err(|_| ProtocolError::MalformedResults("commit id is not UTF-8".to_string()))?;
    validate_commit_id(RESULTS, commit_id)?;

    let declared = declared
        .ok_or_else(|| ProtocolError::MalformedResults("missing length".to_string()))?;
    let declared = parse_length(declared)?;

    if payload.len() < declared {
        return Err(ProtocolError::Truncated {
            declared,
            received: payload.len(),
        });
    }

    Ok(Request::Results {
        commit_id: commit_id.to_string(),
        payload: payload[..declared].to_vec(),
    })
}

pub(crate) fn parse_length(field: &[u8]) -> Result<usize, ProtocolError> {
    std::str::from_utf8(field)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            ProtocolError::MalformedResults(format!(
                "non-numeric length {:?}",
                String::from_utf8_lossy(field)
            ))
        })
}

/// Commit ids become file names in the results directory, so anything that
/// could escape it is refused along with the empty id.
fn validate_commit_id(command: &'static str, commit_id: &str) -> Result<(), ProtocolError> {
    if commit_id.is_empty() {
        return Err(ProtocolError::MissingCommitId(command));
    }
    if commit_id == "."
        || commit_id == ".."
        || commit_id.contains(['/', '\\', ':'])
        || commit_id.chars().any(char::is_control)
    {
        return Err(ProtocolError::UnsafeCommitId {
            command,
            commit_id: commit_id.to_string(),
        });
    }
    Ok(())
}

/// A reply on the wire. Replies are bare ASCII words or phrases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    Busy,
    InvalidCommand,
    InvalidAddress,
    InvalidCommitId,
    NoRunners,
    InvalidResults,
    /// Anything a peer said that is not part of the reply vocabulary.
    Unrecognized(String),
}

impl Response {
    pub fn as_str(&self) -> &str {
        match self {
            Response::Ok => "OK",
            Response::Pong => "pong",
            Response::Busy => "BUSY",
            Response::InvalidCommand => "Invalid command",
            Response::InvalidAddress => "Invalid address",
            Response::InvalidCommitId => "Invalid commit ID",
            Response::NoRunners => "No runners are registered",
            Response::InvalidResults => "Invalid results",
            Response::Unrecognized(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "OK" => Response::Ok,
            "pong" => Response::Pong,
            "BUSY" => Response::Busy,
            "Invalid command" => Response::InvalidCommand,
            "Invalid address" => Response::InvalidAddress,
            "Invalid commit ID" => Response::InvalidCommitId,
            "No runners are registered" => Response::NoRunners,
            "Invalid results" => Response::InvalidResults,
            other => Response::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("command longer than {limit} bytes")]
    CommandTooLong { limit: usize },

    #[error("invalid runner address {0:?}")]
    InvalidAddress(String),

    #[error("missing commit id in {0} command")]
    MissingCommitId(&'static str),

    #[error("commit id {commit_id:?} in {command} command is not allowed")]
    UnsafeCommitId {
        command: &'static str,
        commit_id: String,
    },

    #[error("malformed results header: {0}")]
    MalformedResults(String),

    #[error("declared results length {declared} exceeds limit of {limit} bytes")]
    PayloadTooLarge { declared: usize, limit: usize },

    #[error("results payload truncated: declared {declared} bytes, received {received}")]
    Truncated { declared: usize, received: usize },
}

impl ProtocolError {
    /// The reply sent back to the peer for this error.
    pub fn response(&self) -> Response {
        match self {
            ProtocolError::Empty
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::CommandTooLong { .. } => Response::InvalidCommand,
            ProtocolError::InvalidAddress(_) => Response::InvalidAddress,
            ProtocolError::MissingCommitId(RESULTS)
            | ProtocolError::UnsafeCommitId {
                command: RESULTS, ..
            } => Response::InvalidResults,
            ProtocolError::MissingCommitId(_) | ProtocolError::UnsafeCommitId { .. } => {
                Response::InvalidCommitId
            }
            ProtocolError::MalformedResults(_)
            | ProtocolError::PayloadTooLarge { .. }
            | ProtocolError::Truncated { .. } => Response::InvalidResults,
        }
    }
}
