//! Parsers and view serializers for profiling artifacts.
//!
//! The service itself does not know any artifact format. A [`ProfileBackend`] turns a byte
//! stream into a parsed profile, and projects the views clients ask for out of it.

use std::io::Read;

mod json;

pub use json::{ArtifactKind, JsonBackend, JsonProfile, JsonTrace};

/// A JSON object as sent back to clients.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Parses artifacts and renders the views served to clients.
///
/// Parsing happens once per cached artifact on a blocking thread. The view methods run for every
/// request, on cached profiles that may be shared by concurrent requests.
pub trait ProfileBackend: Send + Sync + 'static {
    /// A parsed artifact, either a sample profile or a jitlog.
    type Profile: Send + Sync + 'static;
    /// A single trace inside a parsed jitlog.
    type Trace;

    /// Parses a CPU/memory sample profile.
    fn parse_profile(&self, reader: &mut dyn Read) -> anyhow::Result<Self::Profile>;

    /// Parses a jitlog.
    fn parse_jitlog(&self, reader: &mut dyn Read) -> anyhow::Result<Self::Profile>;

    /// Renders the flamegraph of a sample profile.
    fn flamegraph(&self, profile: &Self::Profile) -> Document;

    /// Renders the memory graph of a sample profile.
    fn memorygraph(&self, profile: &Self::Profile) -> Document;

    /// Renders the metadata of a profile.
    fn meta(&self, profile: &Self::Profile) -> Document;

    /// Looks up a trace by its id.
    fn find_trace<'a>(&self, profile: &'a Self::Profile, id: u64) -> Option<&'a Self::Trace>;

    /// Renders the tree of a single trace.
    fn trace_tree(&self, trace: &Self::Trace) -> Document;

    /// Renders a trace together with the bridges attached to it.
    fn stitched_tree(&self, trace: &Self::Trace) -> Document;
}
