//! The request line grammar.
//!
//! A request is a single line of the form `<cmd> <path> <checksum> [<id>]`, for example
//! `cpu /tmp/sample.prof abc123` or `trace /tmp/log.jitlog.zip deadbeef 42`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static REQUEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<cmd>[^ ]+) (?P<path>[a-zA-Z0-9/.\-_]+) (?P<checksum>[a-zA-Z0-9-]+)(?: (?P<id>[^ ]*))?$")
        .unwrap()
});

/// The view a client asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Flamegraph of a CPU sample profile.
    Cpu,
    /// Memory graph of a sample profile.
    Mem,
    /// Metadata of a profile or jitlog.
    Meta,
    /// A single trace of a jitlog.
    Trace { id: u64 },
    /// A trace of a jitlog, stitched together with its bridges.
    Stitch { id: u64 },
}

impl Command {
    /// The keyword of this command on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Cpu => "cpu",
            Command::Mem => "mem",
            Command::Meta => "meta",
            Command::Trace { .. } => "trace",
            Command::Stitch { .. } => "stitch",
        }
    }

    /// Whether the artifact for this command is a sample profile rather than a jitlog.
    pub fn reads_sample_profile(&self) -> bool {
        matches!(self, Command::Cpu | Command::Mem)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Trace { id } | Command::Stitch { id } => write!(f, "{} {id}", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Reasons for rejecting a request line.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    /// The line is not of the form `<cmd> <path> <checksum> [<id>]`.
    #[error("malformed request line")]
    Malformed,
    /// The command keyword is not known.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    /// A `trace` or `stitch` request without an id.
    #[error("missing trace id")]
    MissingTraceId,
    /// The trace id is not a non-negative integer.
    #[error("invalid trace id {0:?}")]
    InvalidTraceId(String),
    /// A command that does not address a trace was given an id.
    #[error("unexpected trace id")]
    UnexpectedTraceId,
}

/// A parsed request line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// The artifact on the local file system.
    pub path: PathBuf,
    /// Client supplied content checksum, used as the cache key.
    pub checksum: String,
}

impl Request {
    /// Parses a request line without its line terminator.
    pub fn parse(line: &str) -> Result<Self, InvalidRequest> {
        let captures = REQUEST_RE.captures(line).ok_or(InvalidRequest::Malformed)?;
        let id = captures.name("id").map(|id| parse_id(id.as_str())).transpose()?;

        let command = match (&captures["cmd"], id) {
            ("cpu", None) => Command::Cpu,
            ("mem", None) => Command::Mem,
            ("meta", None) => Command::Meta,
            ("trace", Some(id)) => Command::Trace { id },
            ("stitch", Some(id)) => Command::Stitch { id },
            ("cpu" | "mem" | "meta", Some(_)) => return Err(InvalidRequest::UnexpectedTraceId),
            ("trace" | "stitch", None) => return Err(InvalidRequest::MissingTraceId),
            (other, _) => return Err(InvalidRequest::UnknownCommand(other.to_owned())),
        };

        Ok(Request {
            command,
            path: PathBuf::from(&captures["path"]),
            checksum: captures["checksum"].to_owned(),
        })
    }
}

fn parse_id(id: &str) -> Result<u64, InvalidRequest> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidRequest::InvalidTraceId(id.to_owned()));
    }
    id.parse()
        .map_err(|_| InvalidRequest::InvalidTraceId(id.to_owned()))
}

impl FromStr for Request {
    type Err = InvalidRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
