use tracing::{debug, instrument, warn};

use crate::store::SessionSnapshot;
use crate::{DocumentId, Locator, LocatorResolver};

/// Display name used when a locator cannot be named.
pub const PLACEHOLDER_NAME: &str = "document.pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub locator: Locator,
    pub display_name: String,
    pub page_count: usize,
    pub current_page: usize,
}

impl Document {
    pub fn new(locator: Locator, display_name: String) -> Self {
        Self {
            id: locator.id(),
            locator,
            display_name,
            page_count: 0,
            current_page: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened { index: usize },
    AlreadyOpen { index: usize },
}

impl OpenOutcome {
    pub fn index(&self) -> usize {
        match self {
            OpenOutcome::Opened { index } | OpenOutcome::AlreadyOpen { index } => *index,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, OpenOutcome::Opened { .. })
    }
}

/// The ordered set of open documents and which one is active.
///
/// `active` is `None` or a valid index into `documents`; every mutation
/// below preserves that.
#[derive(Debug, Default)]
pub struct DocumentSession {
    documents: Vec<Document>,
    active: Option<usize>,
}

impl DocumentSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a session from a persisted snapshot. Each locator is checked
    /// with `resolver`; the ones that fail are dropped and the rest keep their
    /// relative order.
    #[instrument(skip_all, fields(entries = snapshot.entries.len()))]
    pub fn restore(snapshot: SessionSnapshot, resolver: &dyn LocatorResolver) -> Self {
        let mut session = Self::new();
        for entry in snapshot.entries {
            let locator = match Locator::parse(entry.locator) {
                Ok(locator) => locator,
                Err(err) => {
                    warn!(%err, "dropping malformed persisted locator");
                    continue;
                }
            };
            if session.position(&locator.id()).is_some() {
                debug!(%locator, "skipping duplicate persisted locator");
                continue;
            }
            let display_name = match resolver.display_name(&locator) {
                Ok(name) => name,
                Err(err) => {
                    warn!(%locator, error = %err, "dropping unreachable document from session");
                    continue;
                }
            };
            let mut document = Document::new(locator, display_name);
            document.current_page = entry.current_page;
            session.documents.push(document);
        }

        session.active = match snapshot.active_index {
            Some(index) if index < session.documents.len() => Some(index),
            _ if !session.documents.is_empty() => Some(0),
            _ => None,
        };
        session
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Document> {
        self.documents.get(index)
    }

    pub fn position(&self, id: &DocumentId) -> Option<usize> {
        self.documents.iter().position(|doc| doc.id == *id)
    }

    pub fn find(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.iter().find(|doc| doc.id == *id)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active(&self) -> Option<&Document> {
        self.active.and_then(|index| self.documents.get(index))
    }

    /// Opens `locator`, or switches to it when a document with the same id is
    /// already in the session. `display_name` is only consulted for new
    /// documents.
    pub fn open<F>(&mut self, locator: Locator, display_name: F) -> OpenOutcome
    where
        F: FnOnce(&Locator) -> String,
    {
        if let Some(index) = self.position(&locator.id()) {
            self.active = Some(index);
            return OpenOutcome::AlreadyOpen { index };
        }

        let name = display_name(&locator);
        self.documents.push(Document::new(locator, name));
        let index = self.documents.len() - 1;
        self.active = Some(index);
        OpenOutcome::Opened { index }
    }

    pub fn switch_to(&mut self, index: usize) -> Option<&Document> {
        if index >= self.documents.len() {
            return None;
        }
        self.active = Some(index);
        self.documents.get(index)
    }

    /// Removes the document at `index`. When it was active, the document that
    /// slides into its position becomes active, or the previous one when it
    /// was last.
    pub fn close(&mut self, index: usize) -> Option<Document> {
        if index >= self.documents.len() {
            return None;
        }
        let removed = self.documents.remove(index);
        let remaining = self.documents.len();

        self.active = match self.active {
            _ if remaining == 0 => None,
            Some(active) if active == index => Some(index.min(remaining - 1)),
            Some(active) if active > index => Some(active - 1),
            Some(active) => Some(active),
            None => None,
        };
        Some(removed)
    }

    /// Returns whether the remembered page changed.
    pub fn record_page_seen(&mut self, id: &DocumentId, page_index: usize) -> bool {
        match self.documents.iter_mut().find(|doc| doc.id == *id) {
            Some(doc) if doc.current_page != page_index => {
                doc.current_page = page_index;
                true
            }
            _ => false,
        }
    }

    pub fn set_page_count(&mut self, id: &DocumentId, page_count: usize) {
        if let Some(doc) = self.documents.iter_mut().find(|doc| doc.id == *id) {
            doc.page_count = page_count;
            if page_count > 0 && doc.current_page >= page_count {
                doc.current_page = page_count - 1;
            }
        }
    }
}
