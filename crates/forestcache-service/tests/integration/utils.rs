use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use forestcache_service::backend::{Document, JsonBackend, JsonProfile, JsonTrace, ProfileBackend};
use forestcache_service::config::{CacheConfig, Config};
use forestcache_service::memory::MemoryProbe;
use forestcache_service::server::serve;
use forestcache_service::service::ProfileService;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A [`JsonBackend`] that counts how often it parses, and can be slowed down.
#[derive(Debug, Default)]
pub struct CountingBackend {
    inner: JsonBackend,
    parses: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every parse block for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// A handle to the parse counter that stays usable once the backend is moved into a service.
    pub fn parses(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.parses)
    }

    fn count(&self) {
        self.parses.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl ProfileBackend for CountingBackend {
    type Profile = JsonProfile;
    type Trace = JsonTrace;

    fn parse_profile(&self, reader: &mut dyn Read) -> anyhow::Result<JsonProfile> {
        self.count();
        self.inner.parse_profile(reader)
    }

    fn parse_jitlog(&self, reader: &mut dyn Read) -> anyhow::Result<JsonProfile> {
        self.count();
        self.inner.parse_jitlog(reader)
    }

    fn flamegraph(&self, profile: &JsonProfile) -> Document {
        self.inner.flamegraph(profile)
    }

    fn memorygraph(&self, profile: &JsonProfile) -> Document {
        self.inner.memorygraph(profile)
    }

    fn meta(&self, profile: &JsonProfile) -> Document {
        self.inner.meta(profile)
    }

    fn find_trace<'a>(&self, profile: &'a JsonProfile, id: u64) -> Option<&'a JsonTrace> {
        self.inner.find_trace(profile, id)
    }

    fn trace_tree(&self, trace: &JsonTrace) -> Document {
        self.inner.trace_tree(trace)
    }

    fn stitched_tree(&self, trace: &JsonTrace) -> Document {
        self.inner.stitched_tree(trace)
    }
}

/// A memory probe reporting whatever the test sets.
#[derive(Clone, Debug, Default)]
pub struct FakeMemory(Arc<AtomicU64>);

impl FakeMemory {
    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FakeMemory {
    fn current_usage(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A server on a random local port, stopped when dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub service: Arc<ProfileService<CountingBackend>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Number of profiles currently held by the server's cache.
    pub fn cached(&self) -> usize {
        self.service.loader().cache().len()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn test_config(max_memory: u64) -> Config {
    Config {
        bind: "127.0.0.1:0".to_owned(),
        cache: CacheConfig {
            max_memory,
            decay_window: Duration::from_secs(600),
        },
        ..Config::default()
    }
}

pub async fn spawn_server(
    config: Config,
    backend: CountingBackend,
    memory: FakeMemory,
) -> TestServer {
    let listener = TcpListener::bind(config.bind.as_str()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = Arc::new(ProfileService::create(
        &config,
        backend,
        Arc::new(memory),
        Handle::current(),
    ));
    let handle = tokio::spawn(serve(
        listener,
        Arc::clone(&service),
        std::future::pending(),
    ));

    TestServer {
        addr,
        service,
        handle,
    }
}
