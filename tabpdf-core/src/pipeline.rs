//! Per-document render workers.
//!
//! Every open document gets one dedicated worker thread that owns its
//! [`PageSource`]. Requests go in over a per-document channel, results come
//! back over a single channel drained by the interaction context. Workers
//! never touch session or slot state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::buffer::{BufferLedger, PageBuffer};
use crate::slot::SlotId;
use crate::{DocumentId, Locator, OpenedDocument, PageSource, RenderBackend, RenderImage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub document_id: DocumentId,
    pub slot: SlotId,
    pub page_index: usize,
    pub generation: u64,
    pub density: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderFailure {
    #[error("page {page} is out of range ({page_count} pages)")]
    OutOfRange { page: usize, page_count: usize },
    #[error("failed to render page {page}: {message}")]
    Render { page: usize, message: String },
    #[error("document unavailable: {0}")]
    DocumentUnavailable(String),
    #[error("page render timed out")]
    TimedOut,
}

#[derive(Debug)]
pub enum PageOutcome {
    Image(PageBuffer),
    Failed(RenderFailure),
}

#[derive(Debug)]
pub struct RenderResult {
    pub document_id: DocumentId,
    /// Which incarnation of the document's pipeline entry produced this.
    pub ticket: u64,
    pub slot: SlotId,
    pub page_index: usize,
    pub generation: u64,
    pub outcome: PageOutcome,
}

#[derive(Debug)]
pub enum PipelineEvent {
    Opened {
        document_id: DocumentId,
        ticket: u64,
        page_count: usize,
    },
    OpenFailed {
        document_id: DocumentId,
        ticket: u64,
        error: String,
    },
    Page(RenderResult),
}

impl PipelineEvent {
    fn origin(&self) -> (DocumentId, u64) {
        match self {
            PipelineEvent::Opened {
                document_id,
                ticket,
                ..
            }
            | PipelineEvent::OpenFailed {
                document_id,
                ticket,
                ..
            } => (*document_id, *ticket),
            PipelineEvent::Page(result) => (result.document_id, result.ticket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentState {
    Opening,
    Ready { page_count: usize },
    Failed(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document {0} is not open in the render pipeline")]
    NotOpen(DocumentId),
    #[error("document {id} failed to open: {reason}")]
    Failed { id: DocumentId, reason: String },
    #[error("render worker for document {0} has stopped")]
    WorkerGone(DocumentId),
    #[error("failed to spawn render worker")]
    Spawn(#[source] std::io::Error),
}

enum WorkerMessage {
    Render(RenderRequest),
    Close,
}

struct DocumentEntry {
    ticket: u64,
    state: DocumentState,
    requests: Sender<WorkerMessage>,
    cancelled: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct PageRenderPipeline {
    backend: Arc<dyn RenderBackend>,
    ledger: BufferLedger,
    entries: HashMap<DocumentId, DocumentEntry>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    retired: Vec<JoinHandle<()>>,
    next_ticket: u64,
    coalesce: bool,
}

impl PageRenderPipeline {
    pub fn new(backend: Arc<dyn RenderBackend>, ledger: BufferLedger) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            backend,
            ledger,
            entries: HashMap::new(),
            events_tx,
            events_rx,
            retired: Vec::new(),
            next_ticket: 1,
            coalesce: true,
        }
    }

    /// Lets a worker drop queued requests that a newer request for the same
    /// slot has superseded.
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    pub fn state(&self, id: &DocumentId) -> DocumentState {
        self.entries
            .get(id)
            .map(|entry| entry.state.clone())
            .unwrap_or(DocumentState::Closed)
    }

    /// Starts opening `locator` on a fresh worker. A no-op while the document
    /// is opening or ready; a document that failed to open is retried.
    #[instrument(skip(self, locator), fields(%locator))]
    pub fn open_document(
        &mut self,
        document_id: DocumentId,
        locator: &Locator,
    ) -> Result<(), PipelineError> {
        match self.entries.get(&document_id).map(|entry| &entry.state) {
            Some(DocumentState::Failed(_)) => {
                self.close_document(document_id);
            }
            Some(_) => return Ok(()),
            None => {}
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let (requests, inbox) = flume::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            document_id,
            ticket,
            locator: locator.clone(),
            backend: Arc::clone(&self.backend),
            ledger: self.ledger.clone(),
            inbox,
            events: self.events_tx.clone(),
            cancelled: Arc::clone(&cancelled),
            coalesce: self.coalesce,
        };
        let handle = thread::Builder::new()
            .name(format!("render-{}", document_id.simple()))
            .spawn(move || worker.run())
            .map_err(PipelineError::Spawn)?;

        debug!(%document_id, ticket, "document opening");
        self.entries.insert(
            document_id,
            DocumentEntry {
                ticket,
                state: DocumentState::Opening,
                requests,
                cancelled,
                worker: handle,
            },
        );
        Ok(())
    }

    /// Queues a render on the document's worker. Requests made while the
    /// document is still opening are served once it is ready.
    pub fn request_page(&self, request: RenderRequest) -> Result<(), PipelineError> {
        let id = request.document_id;
        let entry = self.entries.get(&id).ok_or(PipelineError::NotOpen(id))?;
        if let DocumentState::Failed(reason) = &entry.state {
            return Err(PipelineError::Failed {
                id,
                reason: reason.clone(),
            });
        }
        entry
            .requests
            .send(WorkerMessage::Render(request))
            .map_err(|_| PipelineError::WorkerGone(id))
    }

    /// Forgets the document and tells its worker to close the resource once
    /// any in-flight render returns. Never waits for the worker.
    #[instrument(skip(self))]
    pub fn close_document(&mut self, document_id: DocumentId) -> bool {
        self.retired.retain(|handle| !handle.is_finished());
        let Some(entry) = self.entries.remove(&document_id) else {
            return false;
        };
        entry.cancelled.store(true, Ordering::Release);
        // The worker may already be gone after a failed open.
        let _ = entry.requests.send(WorkerMessage::Close);
        self.retired.push(entry.worker);
        debug!(%document_id, ticket = entry.ticket, "document closed");
        true
    }

    /// Next pending event, without blocking. Events from closed or replaced
    /// documents are dropped here.
    pub fn try_next(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Blocks for at most `timeout` waiting for the next accepted event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<PipelineEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.events_rx.recv_deadline(deadline) {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    pub async fn next_async(&mut self) -> Option<PipelineEvent> {
        loop {
            let event = self.events_rx.recv_async().await.ok()?;
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
    }

    fn accept(&mut self, event: PipelineEvent) -> Option<PipelineEvent> {
        let (document_id, ticket) = event.origin();
        let Some(entry) = self
            .entries
            .get_mut(&document_id)
            .filter(|entry| entry.ticket == ticket)
        else {
            trace!(%document_id, ticket, "dropping event from closed document");
            return None;
        };

        match &event {
            PipelineEvent::Opened { page_count, .. } => {
                entry.state = DocumentState::Ready {
                    page_count: *page_count,
                };
            }
            PipelineEvent::OpenFailed { error, .. } => {
                entry.state = DocumentState::Failed(error.clone());
            }
            PipelineEvent::Page(_) => {}
        }
        Some(event)
    }

    /// Closes every document and waits for all workers to finish.
    pub fn shutdown(mut self) {
        let ids: Vec<_> = self.entries.keys().copied().collect();
        for id in ids {
            self.close_document(id);
        }
        for handle in self.retired.drain(..) {
            if handle.join().is_err() {
                warn!("render worker panicked during shutdown");
            }
        }
    }
}

impl Drop for PageRenderPipeline {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancelled.store(true, Ordering::Release);
            let _ = entry.requests.send(WorkerMessage::Close);
        }
    }
}

struct Worker {
    document_id: DocumentId,
    ticket: u64,
    locator: Locator,
    backend: Arc<dyn RenderBackend>,
    ledger: BufferLedger,
    inbox: Receiver<WorkerMessage>,
    events: Sender<PipelineEvent>,
    cancelled: Arc<AtomicBool>,
    coalesce: bool,
}

impl Worker {
    fn run(self) {
        let OpenedDocument {
            mut source,
            page_count,
        } = match self.backend.open(&self.locator) {
            Ok(opened) => opened,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(document_id = %self.document_id, %error, "failed to open document");
                let _ = self.events.send(PipelineEvent::OpenFailed {
                    document_id: self.document_id,
                    ticket: self.ticket,
                    error,
                });
                return;
            }
        };

        if !self.is_cancelled() {
            debug!(document_id = %self.document_id, page_count, "document ready");
            let _ = self.events.send(PipelineEvent::Opened {
                document_id: self.document_id,
                ticket: self.ticket,
                page_count,
            });
            self.serve(source.as_mut(), page_count);
        }

        if let Err(err) = source.close() {
            warn!(document_id = %self.document_id, error = ?err, "failed to close render resource");
        }
        debug!(document_id = %self.document_id, ticket = self.ticket, "render resource closed");
    }

    fn serve(&self, source: &mut dyn PageSource, page_count: usize) {
        loop {
            let Ok(first) = self.inbox.recv() else {
                return;
            };
            let mut batch = vec![first];
            if self.coalesce {
                batch.extend(self.inbox.try_iter());
            }

            let mut closing = false;
            let mut renders = Vec::with_capacity(batch.len());
            for message in batch {
                match message {
                    WorkerMessage::Render(request) => renders.push(request),
                    WorkerMessage::Close => {
                        closing = true;
                        break;
                    }
                }
            }

            for request in coalesce(renders) {
                if self.is_cancelled() {
                    return;
                }
                let outcome = self.render(source, page_count, &request);
                let result = RenderResult {
                    document_id: self.document_id,
                    ticket: self.ticket,
                    slot: request.slot,
                    page_index: request.page_index,
                    generation: request.generation,
                    outcome,
                };
                if self.events.send(PipelineEvent::Page(result)).is_err() {
                    return;
                }
            }

            if closing || self.is_cancelled() {
                return;
            }
        }
    }

    fn render(
        &self,
        source: &mut dyn PageSource,
        page_count: usize,
        request: &RenderRequest,
    ) -> PageOutcome {
        let page = request.page_index;
        if page >= page_count {
            return PageOutcome::Failed(RenderFailure::OutOfRange { page, page_count });
        }
        match rasterize(source, page, request.density) {
            Ok(image) => PageOutcome::Image(self.ledger.wrap(image)),
            Err(err) => {
                let message = format!("{err:#}");
                debug!(document_id = %self.document_id, page, %message, "page render failed");
                PageOutcome::Failed(RenderFailure::Render { page, message })
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

fn rasterize(source: &mut dyn PageSource, page: usize, density: f32) -> Result<RenderImage> {
    let size = source.page_size(page)?;
    let (width, height) = size.scaled(density);
    source.render_page(page, width, height)
}

/// Keeps only the newest request per slot, in arrival order.
fn coalesce(requests: Vec<RenderRequest>) -> Vec<RenderRequest> {
    let mut newest: HashMap<SlotId, usize> = HashMap::with_capacity(requests.len());
    for (position, request) in requests.iter().enumerate() {
        newest.insert(request.slot, position);
    }
    requests
        .into_iter()
        .enumerate()
        .filter(|(position, request)| newest.get(&request.slot) == Some(position))
        .map(|(_, request)| request)
        .collect()
}
