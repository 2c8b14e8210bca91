use std::collections::HashMap;
use std::mem;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::buffer::PageBuffer;
use crate::pipeline::{PageOutcome, RenderFailure, RenderResult};
use crate::DocumentId;

/// Identity of an on-screen page position.
pub type SlotId = usize;

#[derive(Debug, Default)]
pub enum SlotDisplay {
    #[default]
    Empty,
    Loading,
    Ready(PageBuffer),
    Failed(RenderFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub document_id: DocumentId,
    pub page_index: usize,
}

/// What a slot currently wants to show. Holds at most one page buffer.
#[derive(Debug, Default)]
pub struct SlotBinding {
    generation: u64,
    binding: Option<Binding>,
    display: SlotDisplay,
    loading_since: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Shown,
    Failed(RenderFailure),
    Stale,
}

impl SlotBinding {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding
    }

    pub fn display(&self) -> &SlotDisplay {
        &self.display
    }

    pub fn image(&self) -> Option<&PageBuffer> {
        match &self.display {
            SlotDisplay::Ready(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.display, SlotDisplay::Loading)
    }

    fn clear_display(&mut self) {
        drop(mem::take(&mut self.display));
        self.loading_since = None;
    }

    fn rebind(&mut self, binding: Binding, now: Instant) -> u64 {
        self.clear_display();
        self.generation += 1;
        self.binding = Some(binding);
        self.display = SlotDisplay::Loading;
        self.loading_since = Some(now);
        self.generation
    }

    fn release(&mut self) {
        self.clear_display();
        self.generation += 1;
        self.binding = None;
    }

    fn fail(&mut self, failure: RenderFailure) {
        self.clear_display();
        self.display = SlotDisplay::Failed(failure);
    }

    fn deliver(&mut self, result: RenderResult) -> Delivery {
        if result.generation != self.generation {
            trace!(
                slot = result.slot,
                page = result.page_index,
                generation = result.generation,
                current = self.generation,
                "discarding stale page"
            );
            return Delivery::Stale;
        }

        self.clear_display();
        match result.outcome {
            PageOutcome::Image(buffer) => {
                self.display = SlotDisplay::Ready(buffer);
                Delivery::Shown
            }
            PageOutcome::Failed(failure) => {
                self.display = SlotDisplay::Failed(failure.clone());
                Delivery::Failed(failure)
            }
        }
    }
}

/// All slots known to the interaction context, keyed by slot id.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: HashMap<SlotId, SlotBinding>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: SlotId) -> Option<&SlotBinding> {
        self.slots.get(&slot)
    }

    /// Points `slot` at a new page and returns the generation the matching
    /// render request must carry. Any buffer the slot held is released first.
    pub fn bind(&mut self, slot: SlotId, binding: Binding, now: Instant) -> u64 {
        self.slots.entry(slot).or_default().rebind(binding, now)
    }

    pub fn release(&mut self, slot: SlotId) {
        if let Some(entry) = self.slots.get_mut(&slot) {
            entry.release();
        }
    }

    pub fn fail(&mut self, slot: SlotId, failure: RenderFailure) {
        if let Some(entry) = self.slots.get_mut(&slot) {
            entry.fail(failure);
        }
    }

    /// Applies a render result. Results for unknown slots or older
    /// generations are dropped, which releases their buffer.
    pub fn deliver(&mut self, result: RenderResult) -> Delivery {
        match self.slots.get_mut(&result.slot) {
            Some(entry) => entry.deliver(result),
            None => Delivery::Stale,
        }
    }

    /// Releases every slot bound to `document_id`.
    pub fn release_document(&mut self, document_id: &DocumentId) -> Vec<SlotId> {
        let mut released = Vec::new();
        for (slot, entry) in self.slots.iter_mut() {
            if entry.binding.is_some_and(|b| b.document_id == *document_id) {
                entry.release();
                released.push(*slot);
            }
        }
        released.sort_unstable();
        released
    }

    /// Switches every slot of `document_id` that is still waiting for a page
    /// to the failure placeholder.
    pub fn fail_document(
        &mut self,
        document_id: &DocumentId,
        failure: &RenderFailure,
    ) -> Vec<SlotId> {
        let mut failed = Vec::new();
        for (slot, entry) in self.slots.iter_mut() {
            let bound = entry.binding.is_some_and(|b| b.document_id == *document_id);
            if bound && entry.is_loading() {
                entry.fail(failure.clone());
                failed.push(*slot);
            }
        }
        failed.sort_unstable();
        failed
    }

    /// Marks slots that have been loading for longer than `timeout` as timed
    /// out. Their generation is left alone so a late page still lands.
    pub fn expire_overdue(&mut self, now: Instant, timeout: Duration) -> Vec<SlotId> {
        let mut expired = Vec::new();
        for (slot, entry) in self.slots.iter_mut() {
            let overdue = entry
                .loading_since
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout);
            if overdue && entry.is_loading() {
                entry.fail(RenderFailure::TimedOut);
                expired.push(*slot);
            }
        }
        expired.sort_unstable();
        expired
    }
}
