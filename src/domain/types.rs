use std::collections::BTreeMap;

use bytes::Bytes;

/// One unit of render work: a single logical page or a personalized variant
/// of one. Created by the orchestrator when it enumerates pages to export,
/// immutable afterwards, consumed exactly once by the render backend.
#[derive(Debug, Clone)]
pub struct RenderJob {
    /// Opaque identifier of the document owning the page.
    pub subject_id: String,
    /// Identifier of the canvas region to render.
    pub block_id: String,
    /// Position in the original request list. Used only for deterministic
    /// output naming and log correlation, never for scheduling.
    pub ordinal: usize,
    pub width: u32,
    pub height: u32,
    /// Image format suffix such as `png`.
    pub suffix: String,
    /// Query overrides forwarded to the render service, e.g. a
    /// personalization token.
    pub query: BTreeMap<String, String>,
    /// Name the artifact should carry in the final deliverable.
    pub suggested_name: String,
}

/// Outcome of one render request. A failure never aborts the batch; the job
/// is simply absent from the final artifact list.
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Success { artifact_url: String },
    Failure { reason: String },
}

/// A job that survived rendering. Survivors keep the relative order of the
/// original request list.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub ordinal: usize,
    pub artifact_url: String,
    pub suggested_name: String,
}

/// A named byte payload destined for the output archive. Names are unique
/// within one archive; collisions are resolved with a sequence suffix.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Bytes,
}

/// Final deliverable handed to the platform collaborator. A single surviving
/// artifact is returned raw instead of as a one-entry archive.
#[derive(Debug, Clone)]
pub enum Deliverable {
    Single {
        filename: String,
        mime_type: String,
        bytes: Bytes,
    },
    Archive {
        filename: String,
        bytes: Bytes,
    },
}

impl Deliverable {
    pub fn filename(&self) -> &str {
        match self {
            Deliverable::Single { filename, .. } => filename,
            Deliverable::Archive { filename, .. } => filename,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Deliverable::Single { bytes, .. } => bytes,
            Deliverable::Archive { bytes, .. } => bytes,
        }
    }
}
