//! Handling of a single client connection.
//!
//! Every connection carries exactly one request:
//!
//! 1. The client sends a request line, see [`Request`] for the grammar.
//! 2. Invalid lines and requests for files that do not exist are not answered.
//! 3. Otherwise the artifact is loaded (from cache or disk), the requested view is rendered and
//!    sent back as a single JSON line, unless the requested trace does not exist.
//! 4. The connection is closed in every case.
//!
//! The JSON document carries an additional `measures` object with the time it took to load the
//! artifact, its size on disk and the time it took to render the view.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Handle;

use crate::backend::{Document, ProfileBackend};
use crate::caching::EvictingCache;
use crate::config::Config;
use crate::loader::{ArtifactLoader, LoadError};
use crate::memory::MemoryProbe;
use crate::request::{Command, Request};

/// Errors that abort a connection.
///
/// None of these are reported to the client, the connection is closed without a response.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Reading the request or writing the response failed.
    #[error("connection failed")]
    Io(#[from] io::Error),
    /// The client sent more than the allowed number of bytes without a line break.
    #[error("request line exceeds {0} bytes")]
    LineTooLong(usize),
    /// The artifact could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// The rendered view could not be serialized.
    #[error("failed to serialize view")]
    Serialize(#[from] serde_json::Error),
    /// The render task was lost.
    #[error("internal error")]
    InternalError,
}

/// How a connection was completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A document was sent.
    Responded,
    /// The request was valid, but did not yield a document, for example for an unknown trace id.
    NoDocument,
    /// The request line was rejected.
    Invalid,
    /// The requested file does not exist.
    NotFound,
    /// The client went away before sending a complete line.
    Disconnected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Responded => "responded",
            Outcome::NoDocument => "no_document",
            Outcome::Invalid => "invalid",
            Outcome::NotFound => "not_found",
            Outcome::Disconnected => "disconnected",
        }
    }
}

/// Serves requests for one shared profile cache.
pub struct ProfileService<B: ProfileBackend> {
    backend: Arc<B>,
    loader: ArtifactLoader<B>,
    parse_pool: Handle,
    max_line_length: usize,
}

impl<B: ProfileBackend> std::fmt::Debug for ProfileService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileService")
            .field("loader", &self.loader)
            .field("max_line_length", &self.max_line_length)
            .finish()
    }
}

impl<B: ProfileBackend> ProfileService<B> {
    /// Creates the service and its cache.
    ///
    /// Parsing and rendering runs as blocking tasks on `parse_pool`.
    pub fn create(
        config: &Config,
        backend: B,
        probe: Arc<dyn MemoryProbe>,
        parse_pool: Handle,
    ) -> Self {
        let backend = Arc::new(backend);
        let cache = Arc::new(EvictingCache::new(config.cache, probe));
        let loader = ArtifactLoader::new(
            Arc::clone(&backend),
            cache,
            parse_pool.clone(),
            config.max_concurrent_parses,
        );

        Self {
            backend,
            loader,
            parse_pool,
            max_line_length: config.max_line_length,
        }
    }

    pub fn loader(&self) -> &ArtifactLoader<B> {
        &self.loader
    }

    /// Serves the single request of a connection and closes it.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let result = self.respond(&mut stream).await;

        if let Err(err) = stream.shutdown().await {
            tracing::debug!(error = &err as &dyn std::error::Error, "Failed to shut down connection");
        }

        if let Ok(outcome) = result {
            metric!(counter("connections.closed") += 1, "outcome" => outcome.as_str());
        }
        result
    }

    async fn respond<S>(&self, stream: &mut BufReader<S>) -> Result<Outcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(line) = read_request_line(stream, self.max_line_length).await? else {
            return Ok(Outcome::Disconnected);
        };

        let request = match std::str::from_utf8(&line).map(Request::parse) {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "Rejecting request");
                return Ok(Outcome::Invalid);
            }
            Err(_) => {
                tracing::debug!("Rejecting request that is not valid UTF-8");
                return Ok(Outcome::Invalid);
            }
        };

        sentry::configure_scope(|scope| {
            scope.set_tag("request.command", request.command.name());
            scope.set_tag("request.checksum", &request.checksum);
        });

        let size = match tokio::fs::metadata(&request.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    path = %request.path.display(),
                    "Requested artifact does not exist"
                );
                return Ok(Outcome::NotFound);
            }
        };

        let start = Instant::now();
        let profile = self.loader.load(&request).await?;
        let parsing = start.elapsed();

        let backend = Arc::clone(&self.backend);
        let command = request.command;
        let rendered = self
            .parse_pool
            .spawn_blocking(move || render(&*backend, &profile, command, parsing, size))
            .await
            .map_err(|_| ConnectionError::InternalError)??;

        let Some(response) = rendered else {
            tracing::debug!(command = %request.command, "No document for request");
            return Ok(Outcome::NoDocument);
        };

        stream.write_all(&response).await?;
        stream.flush().await?;
        tracing::debug!(command = %request.command, bytes = response.len(), "Sent document");

        Ok(Outcome::Responded)
    }
}

/// Reads one `\n` or `\r\n` terminated line, without the terminator.
///
/// Returns `None` if the peer closes the connection before completing the line.
async fn read_request_line<R>(
    reader: &mut R,
    max_length: usize,
) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    // two extra bytes for the terminator
    let limit = max_length as u64 + 2;
    (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;

    let terminated = line.last() == Some(&b'\n');
    if terminated {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }

    if line.len() > max_length {
        return Err(ConnectionError::LineTooLong(max_length));
    }
    Ok(terminated.then_some(line))
}

/// Renders the view for `command` into a response line.
///
/// Returns `None` if the profile has no trace with the requested id.
fn render<B: ProfileBackend>(
    backend: &B,
    profile: &B::Profile,
    command: Command,
    parsing: Duration,
    size: u64,
) -> Result<Option<Vec<u8>>, serde_json::Error> {
    let start = Instant::now();
    let document: Option<Document> = match command {
        Command::Cpu => Some(backend.flamegraph(profile)),
        Command::Mem => Some(backend.memorygraph(profile)),
        Command::Meta => Some(backend.meta(profile)),
        Command::Trace { id } => backend
            .find_trace(profile, id)
            .map(|trace| backend.trace_tree(trace)),
        Command::Stitch { id } => backend
            .find_trace(profile, id)
            .map(|trace| backend.stitched_tree(trace)),
    };
    let rendering = start.elapsed();
    metric!(timer("views.render.duration") = rendering, "command" => command.name());

    // An artifact without the requested view renders to an empty document, which is not sent.
    let Some(mut document) = document.filter(|document| !document.is_empty()) else {
        return Ok(None);
    };

    document.insert(
        "measures".into(),
        json!({
            "parsing": format_millis(parsing),
            // whole mebibytes, printed with a decimal for compatibility
            "log (zip)": format!("{:.1}MB", (size / 1024 / 1024) as f64),
            "json": format_millis(rendering),
        }),
    );

    let mut line = serde_json::to_vec(&document)?;
    line.extend_from_slice(b"\r\n");
    Ok(Some(line))
}

fn format_millis(duration: Duration) -> String {
    format!("{:.3}ms", duration.as_secs_f64() * 1000.0)
}
