//! Resolving requests to parsed profiles.
//!
//! The [`ArtifactLoader`] answers from the [`EvictingCache`] when it can, and otherwise opens,
//! decompresses and parses the artifact on the parse pool before caching it.
//!
//! Concurrent misses on the same checksum are coalesced: the first request starts the load, and
//! all requests arriving before it finishes wait for that same load instead of parsing the file
//! again.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};

use crate::backend::ProfileBackend;
use crate::caching::EvictingCache;
use crate::request::Request;
use crate::utils::compression::open_artifact;
use crate::utils::futures::CallOnDrop;

/// Errors while loading an artifact.
///
/// This is `Clone` so that a single failed load can be reported to every coalesced request.
#[derive(Clone, Debug, Error)]
pub enum LoadError {
    /// The artifact does not exist.
    #[error("artifact not found")]
    NotFound,
    /// The artifact could not be opened.
    #[error("failed to open artifact")]
    Io(#[source] Arc<io::Error>),
    /// The backend could not parse the artifact.
    #[error("failed to parse artifact: {0:#}")]
    Malformed(Arc<anyhow::Error>),
    /// The parse task was lost, for example because the parser panicked.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound,
            _ => LoadError::Io(Arc::new(err)),
        }
    }
}

type LoadResult<P> = Result<Arc<P>, LoadError>;
type InflightLoad<P> = Shared<oneshot::Receiver<LoadResult<P>>>;
type InflightLoads<P> = Arc<Mutex<HashMap<String, InflightLoad<P>>>>;

fn lock<P>(inflight: &InflightLoads<P>) -> MutexGuard<'_, HashMap<String, InflightLoad<P>>> {
    inflight.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Loads parsed profiles from the cache or the file system.
pub struct ArtifactLoader<B: ProfileBackend> {
    backend: Arc<B>,
    cache: Arc<EvictingCache<B::Profile>>,
    parse_pool: Handle,
    parse_permits: Option<Arc<Semaphore>>,
    inflight: InflightLoads<B::Profile>,
}

impl<B: ProfileBackend> std::fmt::Debug for ArtifactLoader<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inflight = self
            .inflight
            .try_lock()
            .map(|loads| loads.len())
            .unwrap_or_default();
        f.debug_struct("ArtifactLoader")
            .field("cached profiles", &self.cache.len())
            .field("running loads", &inflight)
            .field(
                "available parse permits",
                &self.parse_permits.as_ref().map(|p| p.available_permits()),
            )
            .finish()
    }
}

impl<B: ProfileBackend> ArtifactLoader<B> {
    /// Creates a loader that parses on `parse_pool`.
    ///
    /// At most `max_concurrent_parses` artifacts are parsed at the same time, `None` means no
    /// limit.
    pub fn new(
        backend: Arc<B>,
        cache: Arc<EvictingCache<B::Profile>>,
        parse_pool: Handle,
        max_concurrent_parses: Option<usize>,
    ) -> Self {
        Self {
            backend,
            cache,
            parse_pool,
            parse_permits: max_concurrent_parses.map(|permits| Arc::new(Semaphore::new(permits))),
            inflight: Default::default(),
        }
    }

    /// The cache this loader fills.
    pub fn cache(&self) -> &EvictingCache<B::Profile> {
        &self.cache
    }

    /// Returns the parsed profile for `request`.
    ///
    /// Profiles are returned even if the cache declined to store them because of memory pressure.
    /// Such a profile is simply parsed again on the next request.
    pub async fn load(&self, request: &Request) -> LoadResult<B::Profile> {
        let load = {
            // The cache is checked under the inflight lock, a finishing load stores its profile
            // before it unregisters itself.
            let mut inflight = lock(&self.inflight);

            if let Some(profile) = self.cache.get(&request.checksum) {
                tracing::debug!(checksum = %request.checksum, "Using cached profile");
                metric!(counter("artifacts.cache") += 1, "hit" => "true");
                return Ok(profile);
            }
            metric!(counter("artifacts.cache") += 1, "hit" => "false");

            match inflight.get(&request.checksum) {
                Some(load) => {
                    tracing::debug!(checksum = %request.checksum, "Waiting for running load");
                    metric!(counter("artifacts.coalesced") += 1);
                    load.clone()
                }
                None => {
                    // The load cannot unregister itself before it is registered, since that
                    // needs this lock.
                    let load = self.spawn_load(request.clone());
                    inflight.insert(request.checksum.clone(), load.clone());
                    load
                }
            }
        };

        // The sender is only dropped without a result if the load task was torn down.
        load.await.unwrap_or(Err(LoadError::InternalError))
    }

    /// Spawns the load for `request` as a separate task.
    ///
    /// The load runs to completion even if every request waiting for it goes away, and it
    /// unregisters itself from the in-flight table when it finishes or is torn down.
    fn spawn_load(&self, request: Request) -> InflightLoad<B::Profile> {
        let (sender, receiver) = oneshot::channel();

        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let parse_pool = self.parse_pool.clone();
        let parse_permits = self.parse_permits.clone();

        let inflight = Arc::clone(&self.inflight);
        let checksum = request.checksum.clone();
        let unregister_token = CallOnDrop::new(move || {
            lock(&inflight).remove(&checksum);
        });

        let load = async move {
            let result = parse_and_store(backend, cache, parse_pool, parse_permits, request).await;
            // Unregister before publishing the result. Later requests then either find the
            // profile in the cache or start a new load.
            drop(unregister_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(load);
        receiver.shared()
    }
}

async fn parse_and_store<B: ProfileBackend>(
    backend: Arc<B>,
    cache: Arc<EvictingCache<B::Profile>>,
    parse_pool: Handle,
    parse_permits: Option<Arc<Semaphore>>,
    request: Request,
) -> LoadResult<B::Profile> {
    let _permit = match parse_permits {
        Some(permits) => Some(
            permits
                .acquire_owned()
                .await
                .map_err(|_| LoadError::InternalError)?,
        ),
        None => None,
    };

    let task = parse_pool.spawn_blocking(move || -> LoadResult<B::Profile> {
        let start = Instant::now();
        let profile = Arc::new(parse_artifact(&*backend, &request)?);
        metric!(
            timer("artifacts.parse.duration") = start.elapsed(),
            "command" => request.command.name(),
        );
        tracing::info!(
            path = %request.path.display(),
            checksum = %request.checksum,
            "Parsed artifact"
        );

        if !cache.put(request.checksum, Arc::clone(&profile)) {
            tracing::debug!("Returning uncached profile");
        }
        Ok(profile)
    });

    task.await.map_err(|err| {
        tracing::error!(error = &err as &dyn std::error::Error, "Parse task failed");
        LoadError::InternalError
    })?
}

/// Opens and parses the artifact, choosing the parser from the requested command.
fn parse_artifact<B: ProfileBackend>(
    backend: &B,
    request: &Request,
) -> Result<B::Profile, LoadError> {
    let mut reader = open_artifact(&request.path)?;
    let parsed = if request.command.reads_sample_profile() {
        backend.parse_profile(&mut reader)
    } else {
        backend.parse_jitlog(&mut reader)
    };
    parsed.map_err(|err| LoadError::Malformed(Arc::new(err)))
}
