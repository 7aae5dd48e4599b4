use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

/// The read buffer for bzip2 streams, the decoder keeps its own larger state anyway.
const BZ2_BUFFER_SIZE: usize = 2048;

/// How an artifact on disk is framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// A gzip stream. Artifacts use a `.zip` extension for this, they are not zip archives.
    Gzip,
    /// A bzip2 stream with a `.bz2` extension.
    Bzip2,
    /// Anything else is read as-is.
    None,
}

impl Compression {
    /// Determines the framing from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("zip") => Compression::Gzip,
            Some("bz2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }

    fn metrics_tag(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Bzip2 => "bz2",
            Compression::None => "none",
        }
    }
}

/// Opens an artifact for reading, transparently decompressing it based on its extension.
pub fn open_artifact(path: &Path) -> io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let compression = Compression::from_path(path);
    metric!(counter("compression") += 1, "type" => compression.metrics_tag());

    Ok(match compression {
        // We assume MultiGzDecoder accepts a strict superset of input
        // values compared to GzDecoder.
        Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(file))),
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(BufReader::with_capacity(
            BZ2_BUFFER_SIZE,
            file,
        ))),
        Compression::None => Box::new(BufReader::new(file)),
    })
}
