use std::io::Read;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use super::{Document, ProfileBackend};

/// Which parser produced a [`JsonProfile`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArtifactKind {
    #[default]
    Profile,
    Jitlog,
}

/// An artifact whose views were rendered ahead of time.
///
/// ```json
/// {
///   "meta": {"interpreter": "pypy"},
///   "flamegraph": {"root": {}},
///   "memorygraph": {"samples": []},
///   "traces": [{"id": 42, "tree": {"ops": []}, "bridges": []}]
/// }
/// ```
///
/// Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct JsonProfile {
    #[serde(skip)]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub meta: Document,
    #[serde(default)]
    pub flamegraph: Document,
    #[serde(default)]
    pub memorygraph: Document,
    #[serde(default)]
    pub traces: Vec<JsonTrace>,
}

#[derive(Debug, Deserialize)]
pub struct JsonTrace {
    pub id: u64,
    #[serde(default)]
    pub tree: Document,
    #[serde(default)]
    pub bridges: Vec<Value>,
}

/// Serves artifacts that contain pre-rendered JSON views.
///
/// This is the backend the server runs with out of the box. It lets a separate tool do the
/// expensive format-specific work once, while forestcache keeps the result resident.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonBackend;

impl JsonBackend {
    fn parse(&self, reader: &mut dyn Read, kind: ArtifactKind) -> anyhow::Result<JsonProfile> {
        let mut profile: JsonProfile =
            serde_json::from_reader(reader).context("invalid JSON artifact")?;
        profile.kind = kind;
        Ok(profile)
    }
}

impl ProfileBackend for JsonBackend {
    type Profile = JsonProfile;
    type Trace = JsonTrace;

    fn parse_profile(&self, reader: &mut dyn Read) -> anyhow::Result<JsonProfile> {
        self.parse(reader, ArtifactKind::Profile)
    }

    fn parse_jitlog(&self, reader: &mut dyn Read) -> anyhow::Result<JsonProfile> {
        self.parse(reader, ArtifactKind::Jitlog)
    }

    fn flamegraph(&self, profile: &JsonProfile) -> Document {
        profile.flamegraph.clone()
    }

    fn memorygraph(&self, profile: &JsonProfile) -> Document {
        profile.memorygraph.clone()
    }

    fn meta(&self, profile: &JsonProfile) -> Document {
        let mut document = profile.meta.clone();
        let kind = match profile.kind {
            ArtifactKind::Profile => "profile",
            ArtifactKind::Jitlog => "jitlog",
        };
        document.insert("kind".into(), kind.into());
        if profile.kind == ArtifactKind::Jitlog {
            let ids: Vec<Value> = profile.traces.iter().map(|t| t.id.into()).collect();
            document.insert("traces".into(), ids.into());
        }
        document
    }

    fn find_trace<'a>(&self, profile: &'a JsonProfile, id: u64) -> Option<&'a JsonTrace> {
        profile.traces.iter().find(|trace| trace.id == id)
    }

    fn trace_tree(&self, trace: &JsonTrace) -> Document {
        let mut document = trace.tree.clone();
        document.insert("id".into(), trace.id.into());
        document
    }

    fn stitched_tree(&self, trace: &JsonTrace) -> Document {
        let mut document = self.trace_tree(trace);
        document.insert("bridges".into(), trace.bridges.clone().into());
        document
    }
}
