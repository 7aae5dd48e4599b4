//! Helpers for testing the profile server and its cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Artifacts written into it disappear as soon as it is dropped,
//!    and requests for them are silently ignored by the server.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `forestcache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("forestcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// How an artifact is stored on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Gzip,
    Bzip2,
}

impl Encoding {
    /// The file extension the server uses to detect this encoding.
    pub fn extension(self) -> &'static str {
        match self {
            Encoding::Plain => "json",
            Encoding::Gzip => "zip",
            Encoding::Bzip2 => "bz2",
        }
    }
}

/// Writes `contents` into `dir` as `{name}.{extension}` and returns the full path.
pub fn write_artifact(dir: &Path, name: &str, contents: &[u8], encoding: Encoding) -> PathBuf {
    let path = dir.join(format!("{name}.{}", encoding.extension()));
    let file = File::create(&path).unwrap();

    match encoding {
        Encoding::Plain => {
            let mut file = file;
            file.write_all(contents).unwrap();
        }
        Encoding::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(contents).unwrap();
            encoder.finish().unwrap();
        }
        Encoding::Bzip2 => {
            let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
            encoder.write_all(contents).unwrap();
            encoder.finish().unwrap();
        }
    }

    path
}

/// Writes a JSON artifact, see [`write_artifact`].
pub fn write_json_artifact(
    dir: &Path,
    name: &str,
    contents: &serde_json::Value,
    encoding: Encoding,
) -> PathBuf {
    let contents = serde_json::to_vec(contents).unwrap();
    write_artifact(dir, name, &contents, encoding)
}

/// Sends a raw request to the server at `addr` and returns everything it sent back.
///
/// The server closes the connection after each request, so this reads until EOF. Hangs are turned
/// into a panic after a few seconds.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        // Half-close, so that the server sees the end of an incomplete line. The server may have
        // reset the connection already if it rejected an overlong line.
        stream.shutdown().await.ok();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.ok();
        response
    };

    tokio::time::timeout(Duration::from_secs(10), exchange)
        .await
        .expect("server did not close the connection")
}

/// Sends a request line and parses the response document, if there is one.
pub async fn request(addr: SocketAddr, line: &str) -> Option<serde_json::Value> {
    let response = send_raw(addr, format!("{line}\r\n").as_bytes()).await;
    if response.is_empty() {
        return None;
    }

    assert!(
        response.ends_with(b"\r\n"),
        "response is not terminated by a line break"
    );
    Some(serde_json::from_slice(&response).unwrap())
}
