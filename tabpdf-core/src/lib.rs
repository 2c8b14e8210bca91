use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod buffer;
mod config;
mod pipeline;
mod session;
mod slot;
mod store;
mod viewer;

pub use buffer::{BufferLedger, PageBuffer};
pub use config::ViewerConfig;
pub use pipeline::{
    DocumentState, PageOutcome, PageRenderPipeline, PipelineError, PipelineEvent, RenderFailure,
    RenderRequest, RenderResult,
};
pub use session::{Document, DocumentSession, OpenOutcome, PLACEHOLDER_NAME};
pub use slot::{Binding, Delivery, SlotBinding, SlotDisplay, SlotId, SlotTable};
pub use store::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, SessionSnapshot, SessionStore,
    SnapshotEntry, StoreError, StoredValue,
};
pub use viewer::{ViewEvent, Viewer};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d7c52-6b1e-5d84-9a27-c41e8b95d2a6").expect("valid namespace UUID")
});

/// Identity of a document. Two locators with the same text always map to the
/// same id, which is what session deduplication keys on.
pub fn document_id_for_locator(locator: &Locator) -> DocumentId {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, locator.as_str().as_bytes())
}

/// Opaque reference to a document's bytes. The core never looks inside; only
/// the render backend and the locator resolver interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("locator is empty")]
    Empty,
}

impl Locator {
    pub fn parse(raw: impl Into<String>) -> Result<Self, LocatorError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(LocatorError::Empty);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> DocumentId {
        document_id_for_locator(self)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Locator {
    type Error = LocatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Locator> for String {
    fn from(value: Locator) -> Self {
        value.0
    }
}

/// Native page size in points, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    /// Output pixel dimensions for the given density. Fractions are
    /// truncated; a dimension never collapses below one pixel.
    pub fn scaled(&self, density: f32) -> (u32, u32) {
        (scale_dimension(self.width, density), scale_dimension(self.height, density))
    }
}

fn scale_dimension(points: f32, density: f32) -> u32 {
    let scaled = (points * density).trunc();
    if !scaled.is_finite() || scaled < 1.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A freshly opened document as handed back by [`RenderBackend::open`].
pub struct OpenedDocument {
    pub source: Box<dyn PageSource>,
    pub page_count: usize,
}

impl fmt::Debug for OpenedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDocument")
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

/// Opens documents for rendering. Called from a document's render worker,
/// never from the interaction context.
pub trait RenderBackend: Send + Sync {
    fn open(&self, locator: &Locator) -> Result<OpenedDocument>;
}

/// An open document owned by exactly one render worker.
pub trait PageSource: Send {
    fn page_size(&mut self, page_index: usize) -> Result<PageSize>;

    fn render_page(&mut self, page_index: usize, width: u32, height: u32) -> Result<RenderImage>;

    /// Releases the underlying renderer. Consumes the source, so a source can
    /// only ever be closed once.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Checks that a locator is still reachable and names it for display.
pub trait LocatorResolver: Send + Sync {
    fn display_name(&self, locator: &Locator) -> Result<String>;
}
