use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::buffer::BufferLedger;
use crate::config::ViewerConfig;
use crate::pipeline::{
    DocumentState, PageRenderPipeline, PipelineError, PipelineEvent, RenderFailure, RenderRequest,
};
use crate::session::{Document, DocumentSession, OpenOutcome};
use crate::slot::{Binding, Delivery, SlotBinding, SlotId, SlotTable};
use crate::store::SessionStore;
use crate::{DocumentId, Locator, LocatorResolver, RenderBackend};

/// Notifications for the presentation layer, drained with
/// [`Viewer::drain_events`]. Slot images are read back through
/// [`Viewer::slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    DocumentOpened(DocumentId),
    AlreadyOpen(DocumentId),
    DocumentClosed(DocumentId),
    ActiveChanged(Option<usize>),
    DocumentReady { id: DocumentId, page_count: usize },
    DocumentFailed { id: DocumentId, error: String },
    PageLoading(SlotId),
    PageReady(SlotId),
    PageFailed { slot: SlotId, error: RenderFailure },
}

/// The interaction context: owns the session, its store, the render
/// pipeline and every slot. All mutation goes through here on one thread.
pub struct Viewer {
    session: DocumentSession,
    store: SessionStore,
    pipeline: PageRenderPipeline,
    slots: SlotTable,
    resolver: Arc<dyn LocatorResolver>,
    config: ViewerConfig,
    events: VecDeque<ViewEvent>,
}

impl Viewer {
    pub fn new(
        backend: Arc<dyn RenderBackend>,
        store: SessionStore,
        resolver: Arc<dyn LocatorResolver>,
        config: ViewerConfig,
    ) -> Self {
        let pipeline = PageRenderPipeline::new(backend, BufferLedger::new())
            .with_coalescing(config.coalesce_requests);
        Self {
            session: DocumentSession::new(),
            store,
            pipeline,
            slots: SlotTable::new(),
            resolver,
            config,
            events: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &DocumentSession {
        &self.session
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &BufferLedger {
        self.pipeline.ledger()
    }

    pub fn slot(&self, slot: SlotId) -> Option<&SlotBinding> {
        self.slots.get(slot)
    }

    pub fn document_state(&self, id: &DocumentId) -> DocumentState {
        self.pipeline.state(id)
    }

    pub fn drain_events(&mut self) -> Vec<ViewEvent> {
        self.events.drain(..).collect()
    }

    /// Replaces the session with the last saved one. Locators that no longer
    /// resolve are dropped; a store that cannot be read yields an empty
    /// session. Returns the number of documents restored.
    #[instrument(skip(self))]
    pub fn restore(&mut self) -> usize {
        let snapshot = match self.store.restore() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = ?err, "failed to read saved session, starting empty");
                Default::default()
            }
        };

        let ids: Vec<_> = self.session.documents().iter().map(|doc| doc.id).collect();
        for id in ids {
            self.pipeline.close_document(id);
            self.slots.release_document(&id);
        }

        self.session = DocumentSession::restore(snapshot, self.resolver.as_ref());
        let documents: Vec<_> = self
            .session
            .documents()
            .iter()
            .map(|doc| (doc.id, doc.locator.clone()))
            .collect();
        for (id, locator) in &documents {
            self.start_document(*id, locator);
            self.events.push_back(ViewEvent::DocumentOpened(*id));
        }
        self.events
            .push_back(ViewEvent::ActiveChanged(self.session.active_index()));
        info!(restored = documents.len(), "session restored");
        documents.len()
    }

    /// Opens `locator` or switches to it when it is already open.
    #[instrument(skip(self, locator), fields(%locator))]
    pub fn open(&mut self, locator: Locator) -> OpenOutcome {
        let resolver = Arc::clone(&self.resolver);
        let placeholder = self.config.placeholder_name.clone();
        let outcome = self.session.open(locator, |locator| {
            resolver.display_name(locator).unwrap_or_else(|err| {
                debug!(error = ?err, "display name unavailable");
                placeholder
            })
        });

        let Some((id, locator)) = self
            .session
            .get(outcome.index())
            .map(|doc| (doc.id, doc.locator.clone()))
        else {
            return outcome;
        };
        if outcome.is_new() {
            self.start_document(id, &locator);
            self.events.push_back(ViewEvent::DocumentOpened(id));
        } else {
            if matches!(self.pipeline.state(&id), DocumentState::Failed(_)) {
                self.start_document(id, &locator);
            }
            self.events.push_back(ViewEvent::AlreadyOpen(id));
        }
        self.events.push_back(ViewEvent::ActiveChanged(Some(outcome.index())));
        self.persist();
        outcome
    }

    pub fn switch_to(&mut self, index: usize) -> Option<&Document> {
        self.session.switch_to(index)?;
        self.events.push_back(ViewEvent::ActiveChanged(Some(index)));
        self.persist();
        self.session.get(index)
    }

    /// Closes the document at `index`, releasing its render resources and
    /// every slot still showing it.
    #[instrument(skip(self))]
    pub fn close(&mut self, index: usize) -> Option<Document> {
        let active_before = self.session.active_index();
        let removed = self.session.close(index)?;

        self.pipeline.close_document(removed.id);
        for slot in self.slots.release_document(&removed.id) {
            debug!(slot, "slot released with closed document");
        }
        self.events.push_back(ViewEvent::DocumentClosed(removed.id));
        if self.session.active_index() != active_before || active_before == Some(index) {
            self.events
                .push_back(ViewEvent::ActiveChanged(self.session.active_index()));
        }
        self.persist();
        Some(removed)
    }

    /// Remembers the page the user is on and saves the session when it moved.
    pub fn record_page_seen(&mut self, id: &DocumentId, page_index: usize) {
        if self.session.record_page_seen(id, page_index) {
            self.persist();
        }
    }

    /// Points `slot` at a page using the configured density.
    pub fn bind_slot(&mut self, slot: SlotId, document_id: DocumentId, page_index: usize) -> u64 {
        let density = self.config.density;
        self.bind_slot_with_density(slot, document_id, page_index, density)
    }

    pub fn bind_slot_with_density(
        &mut self,
        slot: SlotId,
        document_id: DocumentId,
        page_index: usize,
        density: f32,
    ) -> u64 {
        let binding = Binding {
            document_id,
            page_index,
        };
        let generation = self.slots.bind(slot, binding, Instant::now());
        self.events.push_back(ViewEvent::PageLoading(slot));

        let request = RenderRequest {
            document_id,
            slot,
            page_index,
            generation,
            density,
        };
        if let Err(err) = self.pipeline.request_page(request) {
            let failure = match err {
                PipelineError::Failed { reason, .. } => RenderFailure::DocumentUnavailable(reason),
                other => RenderFailure::DocumentUnavailable(other.to_string()),
            };
            debug!(slot, %failure, "page request rejected");
            self.slots.fail(slot, failure.clone());
            self.events.push_back(ViewEvent::PageFailed {
                slot,
                error: failure,
            });
        }
        generation
    }

    pub fn release_slot(&mut self, slot: SlotId) {
        self.slots.release(slot);
    }

    /// Applies every pipeline event that is already waiting. Never blocks.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.pipeline.try_next() {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    /// Waits up to `timeout` for one pipeline event and applies it.
    pub fn wait_event(&mut self, timeout: Duration) -> bool {
        match self.pipeline.next_timeout(timeout) {
            Some(event) => {
                self.apply(event);
                true
            }
            None => false,
        }
    }

    /// Waits for the next pipeline event and applies it.
    pub async fn next_event(&mut self) -> bool {
        match self.pipeline.next_async().await {
            Some(event) => {
                self.apply(event);
                true
            }
            None => false,
        }
    }

    /// Marks slots stuck in loading past the configured timeout.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.config.render_timeout else {
            return 0;
        };
        let expired = self.slots.expire_overdue(now, timeout);
        for slot in &expired {
            warn!(slot, "page render timed out");
            self.events.push_back(ViewEvent::PageFailed {
                slot: *slot,
                error: RenderFailure::TimedOut,
            });
        }
        expired.len()
    }

    /// Writes the current session snapshot. Failures are logged, never
    /// retried, and leave the in-memory session untouched.
    pub fn persist(&self) {
        if let Err(err) = self.store.save(&self.session) {
            warn!(error = ?err, "failed to save session");
        }
    }

    pub fn shutdown(self) {
        self.persist();
        self.pipeline.shutdown();
    }

    fn start_document(&mut self, id: DocumentId, locator: &Locator) {
        if let Err(err) = self.pipeline.open_document(id, locator) {
            warn!(%id, error = ?err, "failed to start render worker");
            self.events.push_back(ViewEvent::DocumentFailed {
                id,
                error: err.to_string(),
            });
        }
    }

    fn apply(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Opened {
                document_id,
                page_count,
                ..
            } => {
                self.session.set_page_count(&document_id, page_count);
                self.events.push_back(ViewEvent::DocumentReady {
                    id: document_id,
                    page_count,
                });
            }
            PipelineEvent::OpenFailed {
                document_id, error, ..
            } => {
                let failure = RenderFailure::DocumentUnavailable(error.clone());
                self.events.push_back(ViewEvent::DocumentFailed {
                    id: document_id,
                    error,
                });
                for slot in self.slots.fail_document(&document_id, &failure) {
                    self.events.push_back(ViewEvent::PageFailed {
                        slot,
                        error: failure.clone(),
                    });
                }
            }
            PipelineEvent::Page(result) => {
                let slot = result.slot;
                match self.slots.deliver(result) {
                    Delivery::Shown => self.events.push_back(ViewEvent::PageReady(slot)),
                    Delivery::Failed(error) => {
                        self.events.push_back(ViewEvent::PageFailed { slot, error })
                    }
                    Delivery::Stale => {}
                }
            }
        }
    }
}
